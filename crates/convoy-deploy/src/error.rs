//! Deployment errors.

use thiserror::Error;

use convoy_core::DeploymentId;
use convoy_plan::PlanError;

pub type DeployResult<T> = Result<T, DeployError>;

/// Errors returned synchronously by the deployment manager.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeployError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("applications are locked by deployments {}", join(deployment_ids))]
    DeploymentConflict { deployment_ids: Vec<DeploymentId> },

    #[error("deployment {0} not found")]
    DeploymentNotFound(DeploymentId),
}

/// Why an action stopped before completing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ActionError {
    #[error("deployment cancelled")]
    Cancelled,

    #[error("event stream closed")]
    EventStreamClosed,

    #[error("action task aborted: {0}")]
    Aborted(String),
}

fn join(ids: &[DeploymentId]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}
