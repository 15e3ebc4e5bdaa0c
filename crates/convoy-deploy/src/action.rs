//! Execution of single deployment actions.
//!
//! An action issues its commands, then waits for the cluster to reach the
//! action's goal. Waiting is event driven: the runner subscribes to the
//! event bus before issuing anything, evaluates the goal once, and
//! re-evaluates only when an event about the same app arrives. Failed
//! collaborator calls are retried with exponential backoff until they
//! succeed or the deployment is cancelled.

use std::cmp::Reverse;
use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use convoy_core::{
    AppId, AppSpec, ArtifactStore, CollaboratorError, CollaboratorResult, DeploySettings,
    DeploymentId, Event, EventBus, Task, TaskLauncher, TaskSupervisor, Version,
};
use convoy_health::HealthCheckManager;
use convoy_plan::{DeploymentAction, rolling_update};

use crate::error::ActionError;

/// Collaborators and tuning shared by every action of every deployment.
pub struct ActionContext {
    pub supervisor: Arc<dyn TaskSupervisor>,
    pub launcher: Arc<dyn TaskLauncher>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub health: Arc<HealthCheckManager>,
    pub events: EventBus,
    pub collaborator_timeout: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl ActionContext {
    pub fn new(
        supervisor: Arc<dyn TaskSupervisor>,
        launcher: Arc<dyn TaskLauncher>,
        artifacts: Arc<dyn ArtifactStore>,
        health: Arc<HealthCheckManager>,
        events: EventBus,
        settings: &DeploySettings,
    ) -> Self {
        Self {
            supervisor,
            launcher,
            artifacts,
            health,
            events,
            collaborator_timeout: settings.collaborator_timeout(),
            retry_base: settings.retry_base(),
            retry_max: settings.retry_max(),
        }
    }
}

/// Condition an action waits for.
#[derive(Debug, Clone)]
enum Goal {
    /// At least `count` running tasks of `app`'s version, alive in every
    /// health check when the version has any.
    Ready { app: AppSpec, count: u32 },
    /// At most `count` live tasks of `version`.
    AtMost { app_id: AppId, version: Version, count: u32 },
    /// No live tasks of any version but `keep`.
    OnlyVersion { app_id: AppId, keep: Version },
}

impl Goal {
    fn app_id(&self) -> &AppId {
        match self {
            Goal::Ready { app, .. } => &app.id,
            Goal::AtMost { app_id, .. } | Goal::OnlyVersion { app_id, .. } => app_id,
        }
    }

    fn is_relevant(&self, event: &Event) -> bool {
        event.app_id() == Some(self.app_id())
    }
}

/// Runs actions on behalf of one deployment. Cheap to clone.
#[derive(Clone)]
pub struct ActionRunner {
    ctx: Arc<ActionContext>,
    deployment_id: DeploymentId,
    cancel: watch::Receiver<bool>,
}

impl ActionRunner {
    pub fn new(
        ctx: Arc<ActionContext>,
        deployment_id: DeploymentId,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            deployment_id,
            cancel,
        }
    }

    /// Run `action` to completion. A restart runs its rolling update
    /// sequence one action at a time.
    pub async fn run(&self, action: &DeploymentAction) -> Result<(), ActionError> {
        let mut pending = VecDeque::from([action.clone()]);
        while let Some(next) = pending.pop_front() {
            if self.is_cancelled() {
                return Err(ActionError::Cancelled);
            }
            info!(deployment = %self.deployment_id, action = %next, "running action");
            let mut events = self.ctx.events.subscribe();

            match next {
                DeploymentAction::ResolveArtifacts { app } => {
                    let artifacts = &self.ctx.artifacts;
                    self.retry("resolve artifacts", || artifacts.resolve(&app)).await?;
                    self.ctx.events.publish(Event::ArtifactsResolved {
                        app_id: app.id.clone(),
                        version: app.version.clone(),
                    });
                }
                DeploymentAction::StartApplication { app, scale_to } => {
                    self.ctx.health.add_app(&app).await;
                    let launcher = &self.ctx.launcher;
                    self.retry("scale", || launcher.scale(&app, scale_to)).await?;
                    self.wait_for(Goal::Ready { app, count: scale_to }, &mut events)
                        .await?;
                }
                DeploymentAction::ScaleApplication { app, scale_to } => {
                    self.scale(app, scale_to, &mut events).await?;
                }
                DeploymentAction::StopApplication { app } => {
                    let launcher = &self.ctx.launcher;
                    self.retry("stop", || launcher.stop(&app.id, &app.version))
                        .await?;
                    let doomed: Vec<Task> = self
                        .live_tasks(&app.id)
                        .await?
                        .into_iter()
                        .filter(|task| task.version == app.version)
                        .collect();
                    self.kill_all(&doomed).await?;
                    self.wait_for(
                        Goal::AtMost {
                            app_id: app.id.clone(),
                            version: app.version.clone(),
                            count: 0,
                        },
                        &mut events,
                    )
                    .await?;
                    self.ctx.health.remove_version(&app.id, &app.version).await;
                }
                DeploymentAction::KillAllOldTasksOf { app } => {
                    let old: Vec<Task> = self
                        .live_tasks(&app.id)
                        .await?
                        .into_iter()
                        .filter(|task| task.version != app.version)
                        .collect();
                    let versions: BTreeSet<Version> =
                        old.iter().map(|task| task.version.clone()).collect();
                    let launcher = &self.ctx.launcher;
                    for version in &versions {
                        self.retry("stop", || launcher.stop(&app.id, version)).await?;
                    }
                    self.kill_all(&old).await?;
                    self.wait_for(
                        Goal::OnlyVersion {
                            app_id: app.id.clone(),
                            keep: app.version.clone(),
                        },
                        &mut events,
                    )
                    .await?;
                    self.ctx
                        .health
                        .remove_other_versions(&app.id, &app.version)
                        .await;
                }
                DeploymentAction::RestartApplication { from, to } => {
                    for phased in rolling_update(&from, &to).into_iter().rev() {
                        pending.push_front(phased.action);
                    }
                }
            }
        }
        Ok(())
    }

    async fn scale(
        &self,
        app: AppSpec,
        scale_to: u32,
        events: &mut broadcast::Receiver<Event>,
    ) -> Result<(), ActionError> {
        self.ctx.health.add_app(&app).await;
        let launcher = &self.ctx.launcher;
        self.retry("scale", || launcher.scale(&app, scale_to)).await?;

        let live: Vec<Task> = self
            .live_tasks(&app.id)
            .await?
            .into_iter()
            .filter(|task| task.version == app.version)
            .collect();

        let target = usize::try_from(scale_to).unwrap_or(usize::MAX);
        if live.len() > target {
            let excess = live.len() - target;
            let victims = select_victims(live, excess);
            debug!(app = %app.id, victims = victims.len(), "scaling down");
            self.kill_all(&victims).await?;
            self.wait_for(
                Goal::AtMost {
                    app_id: app.id.clone(),
                    version: app.version.clone(),
                    count: scale_to,
                },
                events,
            )
            .await
        } else {
            self.wait_for(Goal::Ready { app, count: scale_to }, events)
                .await
        }
    }

    async fn kill_all(&self, tasks: &[Task]) -> Result<(), ActionError> {
        let supervisor = &self.ctx.supervisor;
        for task in tasks {
            self.retry("kill task", || supervisor.kill_task(&task.id))
                .await?;
        }
        Ok(())
    }

    async fn live_tasks(&self, app_id: &AppId) -> Result<Vec<Task>, ActionError> {
        let supervisor = &self.ctx.supervisor;
        self.retry("list live tasks", || supervisor.list_live_tasks(app_id))
            .await
    }

    async fn reached(&self, goal: &Goal) -> Result<bool, ActionError> {
        let tasks = self.live_tasks(goal.app_id()).await?;
        let reached = match goal {
            Goal::Ready { app, count } => {
                let running = tasks
                    .iter()
                    .filter(|task| task.version == app.version && task.is_running());
                let ready = if app.health_checks.is_empty() {
                    running.count()
                } else {
                    let alive = self.ctx.health.alive_tasks(app).await;
                    running.filter(|task| alive.contains(&task.id)).count()
                };
                ready >= usize::try_from(*count).unwrap_or(usize::MAX)
            }
            Goal::AtMost {
                version, count, ..
            } => {
                let live = tasks.iter().filter(|task| &task.version == version).count();
                live <= usize::try_from(*count).unwrap_or(usize::MAX)
            }
            Goal::OnlyVersion { keep, .. } => tasks.iter().all(|task| &task.version == keep),
        };
        Ok(reached)
    }

    async fn wait_for(
        &self,
        goal: Goal,
        events: &mut broadcast::Receiver<Event>,
    ) -> Result<(), ActionError> {
        let mut cancel = self.cancel.clone();
        loop {
            if self.reached(&goal).await? {
                return Ok(());
            }
            loop {
                tokio::select! {
                    _ = cancellation(&mut cancel) => return Err(ActionError::Cancelled),
                    received = events.recv() => match received {
                        Ok(event) if goal.is_relevant(&event) => break,
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(deployment = %self.deployment_id, skipped, "event stream lagged");
                            break;
                        }
                        Err(RecvError::Closed) => return Err(ActionError::EventStreamClosed),
                    },
                }
            }
        }
    }

    /// Call `operation` until it succeeds, backing off exponentially from
    /// `retry_base` to `retry_max`. Each call is bounded by the collaborator
    /// timeout.
    async fn retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ActionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CollaboratorResult<T>>,
    {
        let mut cancel = self.cancel.clone();
        let mut delay = self.ctx.retry_base;
        loop {
            if *cancel.borrow() {
                return Err(ActionError::Cancelled);
            }
            let error = match tokio::time::timeout(self.ctx.collaborator_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(error)) => error,
                Err(_) => CollaboratorError::timeout(operation),
            };
            warn!(
                deployment = %self.deployment_id,
                operation,
                %error,
                retry_in = ?delay,
                "collaborator call failed"
            );
            tokio::select! {
                _ = cancellation(&mut cancel) => return Err(ActionError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.ctx.retry_max);
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// Resolves once cancellation is requested or the requester goes away.
async fn cancellation(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Pick `count` tasks to kill when scaling down: staging tasks first, then
/// the most recently started.
pub fn select_victims(mut tasks: Vec<Task>, count: usize) -> Vec<Task> {
    tasks.sort_by_key(|task| {
        (
            task.is_running(),
            Reverse(task.started_at.unwrap_or(task.staged_at)),
            task.id.clone(),
        )
    });
    tasks.truncate(count);
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use convoy_core::{TaskId, TaskState};

    fn task(state: TaskState, started_secs_ago: i64) -> Task {
        let app_id = AppId::new("/web").unwrap();
        let now = Utc::now();
        Task {
            id: TaskId::for_app(&app_id),
            app_id,
            version: Version::new("v1"),
            host: "127.0.0.1".to_string(),
            ports: vec![31000],
            staged_at: now - ChronoDuration::seconds(started_secs_ago + 1),
            started_at: (state == TaskState::Running)
                .then(|| now - ChronoDuration::seconds(started_secs_ago)),
            state,
        }
    }

    #[test]
    fn victims_prefer_staging_then_newest() {
        let oldest = task(TaskState::Running, 300);
        let newest = task(TaskState::Running, 10);
        let middle = task(TaskState::Running, 100);
        let staging = task(TaskState::Staging, 0);

        let victims = select_victims(
            vec![oldest.clone(), newest.clone(), middle.clone(), staging.clone()],
            2,
        );
        assert_eq!(victims, vec![staging, newest]);

        let all = select_victims(vec![oldest.clone(), middle.clone()], 5);
        assert_eq!(all, vec![middle, oldest]);
    }

    #[test]
    fn goal_relevance_follows_app() {
        let goal = Goal::OnlyVersion {
            app_id: AppId::new("/web").unwrap(),
            keep: Version::new("v2"),
        };
        let ours = Event::ArtifactsResolved {
            app_id: AppId::new("/web").unwrap(),
            version: Version::new("v2"),
        };
        let theirs = Event::ArtifactsResolved {
            app_id: AppId::new("/api").unwrap(),
            version: Version::new("v2"),
        };
        assert!(goal.is_relevant(&ours));
        assert!(!goal.is_relevant(&theirs));
        assert!(!goal.is_relevant(&Event::DeploymentSucceeded {
            deployment_id: DeploymentId::generate()
        }));
    }
}
