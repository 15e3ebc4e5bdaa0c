//! Deployment manager: the entry point for requesting transitions.
//!
//! A request is planned first (pure, may fail with no side effects), then
//! the touched applications are locked, preempted deployments are
//! cancelled, and an executor is spawned. The registry only holds
//! deployments that have not finished yet.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info};

use convoy_core::{
    AppId, ArtifactStore, ConvoyConfig, DeploymentId, EventBus, TaskId, TaskLauncher,
    TaskSupervisor,
};
use convoy_health::{HealthCheckManager, Prober, TaskHealth};
use convoy_plan::{DeploymentPlan, DeploymentStep, Transition};

use crate::action::ActionContext;
use crate::error::{DeployError, DeployResult};
use crate::executor::{DeploymentExecutor, DeploymentState, Progress};
use crate::lock::LockManager;

/// The external systems a manager drives.
#[derive(Clone)]
pub struct Collaborators {
    pub supervisor: Arc<dyn TaskSupervisor>,
    pub launcher: Arc<dyn TaskLauncher>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub prober: Arc<dyn Prober>,
}

/// A running deployment as reported to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentInfo {
    pub id: DeploymentId,
    pub affected_apps: BTreeSet<AppId>,
    pub steps: Vec<DeploymentStep>,
    pub current_step: Option<usize>,
    pub state: DeploymentState,
    pub created_at: DateTime<Utc>,
}

struct Registered {
    plan: Arc<DeploymentPlan>,
    created_at: DateTime<Utc>,
    cancel: watch::Sender<bool>,
    progress: watch::Receiver<Progress>,
}

pub struct DeploymentManager {
    ctx: Arc<ActionContext>,
    locks: Arc<LockManager>,
    deployments: Arc<Mutex<HashMap<DeploymentId, Registered>>>,
}

impl DeploymentManager {
    pub fn new(collaborators: Collaborators, events: EventBus, config: &ConvoyConfig) -> Self {
        let health = Arc::new(HealthCheckManager::new(
            Arc::clone(&collaborators.supervisor),
            collaborators.prober,
            events.clone(),
            &config.health,
        ));
        let ctx = ActionContext::new(
            collaborators.supervisor,
            collaborators.launcher,
            collaborators.artifacts,
            health,
            events,
            &config.deploy,
        );
        Self {
            ctx: Arc::new(ctx),
            locks: Arc::new(LockManager::new()),
            deployments: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    pub fn health(&self) -> &Arc<HealthCheckManager> {
        &self.ctx.health
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Plan `transition` and start executing it.
    ///
    /// With `force`, deployments holding any of the touched applications
    /// are cancelled and their locks taken over.
    ///
    /// # Errors
    ///
    /// * `Plan` when the transition cannot be planned.
    /// * `DeploymentConflict` when another deployment holds a touched app
    ///   and `force` is false.
    pub async fn request_transition(
        &self,
        transition: &Transition,
        force: bool,
    ) -> DeployResult<DeploymentId> {
        let plan = Arc::new(DeploymentPlan::build(transition)?);
        let id = DeploymentId::generate();

        let mut deployments = self.deployments.lock().await;
        let preempted = self.locks.acquire(&plan.affected_apps, id, force).await?;
        for other in &preempted {
            if let Some(registered) = deployments.get(other) {
                registered.cancel.send_replace(true);
                info!(deployment = %other, by = %id, "deployment preempted");
            }
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (progress_tx, progress_rx) = watch::channel(Progress::default());
        deployments.insert(
            id,
            Registered {
                plan: Arc::clone(&plan),
                created_at: Utc::now(),
                cancel: cancel_tx,
                progress: progress_rx,
            },
        );
        drop(deployments);

        let executor = DeploymentExecutor::new(
            id,
            plan,
            Arc::clone(&self.ctx),
            Arc::clone(&self.locks),
            cancel_rx,
            progress_tx,
        );
        let registry = Arc::clone(&self.deployments);
        tokio::spawn(async move {
            let state = executor.run().await;
            registry.lock().await.remove(&id);
            debug!(deployment = %id, ?state, "deployment finished");
        });

        Ok(id)
    }

    /// Deployments that have not reached a terminal state, oldest first.
    pub async fn list_deployments(&self) -> Vec<DeploymentInfo> {
        let deployments = self.deployments.lock().await;
        let mut infos: Vec<DeploymentInfo> = deployments
            .iter()
            .map(|(id, registered)| {
                let progress = registered.progress.borrow().clone();
                DeploymentInfo {
                    id: *id,
                    affected_apps: registered.plan.affected_apps.clone(),
                    steps: registered.plan.steps.clone(),
                    current_step: progress.current_step,
                    state: progress.state,
                    created_at: registered.created_at,
                }
            })
            .collect();
        infos.sort_by_key(|info| (info.created_at, info.id));
        infos
    }

    /// Request cancellation. The deployment stops at its next suspension
    /// point; already issued commands are not rolled back.
    ///
    /// # Errors
    ///
    /// `DeploymentNotFound` if the deployment is unknown or already finished.
    pub async fn cancel_deployment(&self, id: DeploymentId) -> DeployResult<()> {
        let deployments = self.deployments.lock().await;
        let registered = deployments
            .get(&id)
            .ok_or(DeployError::DeploymentNotFound(id))?;
        registered.cancel.send_replace(true);
        info!(deployment = %id, "deployment cancellation requested");
        Ok(())
    }

    /// Aggregate health of a task across its version's checks.
    pub async fn task_health(&self, task_id: &TaskId) -> Option<TaskHealth> {
        self.ctx.health.task_health(task_id).await
    }

    /// Cancel every deployment and stop all health monitors.
    pub async fn shutdown(&self) {
        let deployments = self.deployments.lock().await;
        for registered in deployments.values() {
            registered.cancel.send_replace(true);
        }
        info!(cancelled = deployments.len(), "deployment manager shutting down");
        drop(deployments);
        self.ctx.health.stop_all().await;
    }
}
