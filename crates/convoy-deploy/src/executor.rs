//! Deployment executor driving one plan to a terminal state.
//!
//! ```text
//! Pending ──► Running ──► Succeeded
//!                 ├─────► Cancelled   (cancel requested or preempted)
//!                 └─────► Failed      (event stream lost, action aborted)
//! ```
//!
//! Steps run strictly one after another; actions within a step run
//! concurrently. A deployment has no deadline: if the cluster never
//! converges it stays `Running` until cancelled.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use convoy_core::{DeploymentId, Event, EventBus};
use convoy_plan::DeploymentPlan;

use crate::action::{ActionContext, ActionRunner};
use crate::error::ActionError;
use crate::lock::LockManager;

/// Lifecycle state of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeploymentState {
    Pending,
    Running,
    Succeeded,
    Cancelled,
    Failed { reason: String },
}

impl DeploymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentState::Succeeded | DeploymentState::Cancelled | DeploymentState::Failed { .. }
        )
    }
}

/// Observable progress of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub state: DeploymentState,
    /// Index of the step being executed, once the first step has begun.
    pub current_step: Option<usize>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            state: DeploymentState::Pending,
            current_step: None,
        }
    }
}

pub struct DeploymentExecutor {
    id: DeploymentId,
    plan: Arc<DeploymentPlan>,
    ctx: Arc<ActionContext>,
    locks: Arc<LockManager>,
    cancel: watch::Receiver<bool>,
    progress: watch::Sender<Progress>,
}

impl DeploymentExecutor {
    pub fn new(
        id: DeploymentId,
        plan: Arc<DeploymentPlan>,
        ctx: Arc<ActionContext>,
        locks: Arc<LockManager>,
        cancel: watch::Receiver<bool>,
        progress: watch::Sender<Progress>,
    ) -> Self {
        Self {
            id,
            plan,
            ctx,
            locks,
            cancel,
            progress,
        }
    }

    /// Execute the plan, release the deployment's locks, and publish the
    /// outcome.
    pub async fn run(self) -> DeploymentState {
        self.progress.send_modify(|p| p.state = DeploymentState::Running);
        self.events().publish(Event::DeploymentStarted {
            deployment_id: self.id,
            affected_apps: self.plan.affected_apps.iter().cloned().collect(),
            steps: self.plan.steps.len(),
        });
        info!(
            deployment = %self.id,
            steps = self.plan.steps.len(),
            apps = self.plan.affected_apps.len(),
            "deployment started"
        );

        let state = match self.run_steps().await {
            Ok(()) => DeploymentState::Succeeded,
            Err(ActionError::Cancelled) => DeploymentState::Cancelled,
            Err(error) => DeploymentState::Failed {
                reason: error.to_string(),
            },
        };

        self.locks.release(self.id).await;

        let event = match &state {
            DeploymentState::Succeeded => {
                info!(deployment = %self.id, "deployment succeeded");
                Event::DeploymentSucceeded { deployment_id: self.id }
            }
            DeploymentState::Failed { reason } => {
                warn!(deployment = %self.id, %reason, "deployment failed");
                Event::DeploymentFailed {
                    deployment_id: self.id,
                    reason: reason.clone(),
                }
            }
            _ => {
                info!(deployment = %self.id, "deployment cancelled");
                Event::DeploymentCancelled { deployment_id: self.id }
            }
        };
        self.progress.send_modify(|p| p.state = state.clone());
        self.events().publish(event);
        state
    }

    async fn run_steps(&self) -> Result<(), ActionError> {
        let runner = ActionRunner::new(Arc::clone(&self.ctx), self.id, self.cancel.clone());

        for (index, step) in self.plan.steps.iter().enumerate() {
            if *self.cancel.borrow() {
                return Err(ActionError::Cancelled);
            }
            self.progress.send_modify(|p| p.current_step = Some(index));
            info!(deployment = %self.id, step = index, actions = step.actions.len(), "step started");

            let mut running = JoinSet::new();
            for action in step.actions.iter().cloned() {
                let runner = runner.clone();
                running.spawn(async move { runner.run(&action).await });
            }
            while let Some(joined) = running.join_next().await {
                let outcome = joined.unwrap_or_else(|e| Err(ActionError::Aborted(e.to_string())));
                if let Err(error) = outcome {
                    // Remaining actions are abandoned, not rolled back.
                    running.abort_all();
                    return Err(error);
                }
            }

            self.events().publish(Event::DeploymentStepSucceeded {
                deployment_id: self.id,
                step: index,
            });
        }
        Ok(())
    }

    fn events(&self) -> &EventBus {
        &self.ctx.events
    }
}
