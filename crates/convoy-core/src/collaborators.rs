//! Narrow interfaces to the systems the orchestration core drives.
//!
//! Implementations are injected at construction time; nothing in the core
//! reaches for process-wide singletons.

use async_trait::async_trait;

use crate::app::AppSpec;
use crate::error::CollaboratorResult;
use crate::ids::{AppId, TaskId, Version};
use crate::task::Task;

/// The task supervision layer: owns launch/kill acknowledgement.
#[async_trait]
pub trait TaskSupervisor: Send + Sync {
    /// All live (staging or running) tasks of an app, across versions.
    async fn list_live_tasks(&self, app_id: &AppId) -> CollaboratorResult<Vec<Task>>;

    /// Request termination of a task. Killing an unknown task succeeds.
    async fn kill_task(&self, task_id: &TaskId) -> CollaboratorResult<()>;

    /// Tell the scheduling layer a task was killed for failing health checks
    /// so it can delay the app's next launch.
    async fn notify_unhealthy_task_killed(
        &self,
        app_id: &AppId,
        task_id: &TaskId,
    ) -> CollaboratorResult<()>;
}

/// The placement layer that turns "run N instances" into compute.
#[async_trait]
pub trait TaskLauncher: Send + Sync {
    /// Launch tasks of `app`'s version until `instances` are live. Never kills.
    async fn scale(&self, app: &AppSpec, instances: u32) -> CollaboratorResult<()>;

    /// Stop launching tasks of one version of an app.
    async fn stop(&self, app_id: &AppId, version: &Version) -> CollaboratorResult<()>;
}

/// Artifact resolution for an application version.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Succeeds once every artifact of `app` is available.
    async fn resolve(&self, app: &AppSpec) -> CollaboratorResult<()>;
}
