//! Plan construction errors.

use thiserror::Error;

use convoy_core::{AppId, CoreError};

pub type PlanResult<T> = Result<T, PlanError>;

/// Reasons a transition cannot be compiled into a plan. Plan construction
/// has no side effects, so every error leaves the cluster untouched.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanError {
    #[error("cyclic dependency between applications: {}", join(cycle))]
    CyclicDependency { cycle: Vec<AppId> },

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error(transparent)]
    InvalidSpec(#[from] CoreError),
}

fn join(ids: &[AppId]) -> String {
    ids.iter().map(AppId::as_str).collect::<Vec<_>>().join(" -> ")
}
