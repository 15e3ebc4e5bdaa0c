//! In-memory cluster that stands in for the supervision, placement, and
//! artifact layers. Used by `convoyd simulate` and by tests.
//!
//! Launched tasks report running immediately unless launches are held.
//! Every task state change is published on the event bus the way a real
//! supervision layer would report it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use convoy_core::{
    AppId, AppSpec, ArtifactStore, CollaboratorError, CollaboratorResult, Event, EventBus,
    HealthCheckSpec, Task, TaskId, TaskLauncher, TaskState, TaskStatus, TaskSupervisor, Version,
};
use convoy_health::{HealthResult, Prober};

const FIRST_PORT: u16 = 31000;

#[derive(Default)]
struct ClusterState {
    tasks: BTreeMap<TaskId, Task>,
    targets: HashMap<(AppId, Version), u32>,
    artifact_failures: HashMap<AppId, u32>,
    supervisor_failures: u32,
    hold_launches: bool,
    next_port: u16,
    kills: Vec<TaskId>,
    backoffs: Vec<(AppId, TaskId)>,
}

/// Shared in-memory cluster. Clone freely; clones see the same state.
#[derive(Clone)]
pub struct InMemoryCluster {
    state: Arc<Mutex<ClusterState>>,
    events: EventBus,
}

impl InMemoryCluster {
    pub fn new(events: EventBus) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                next_port: FIRST_PORT,
                ..ClusterState::default()
            })),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        // A poisoned lock only means a test panicked mid-update.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Place `instances` running tasks of `app` without publishing events,
    /// as if they were deployed before the simulation started.
    pub fn seed(&self, app: &AppSpec, instances: u32) -> Vec<TaskId> {
        let mut state = self.lock();
        state.targets.insert((app.id.clone(), app.version.clone()), instances);
        (0..instances)
            .map(|_| {
                let task = new_task(&mut state, app, TaskState::Running);
                let id = task.id.clone();
                state.tasks.insert(id.clone(), task);
                id
            })
            .collect()
    }

    /// While held, launched tasks stay staging.
    pub fn hold_launches(&self, hold: bool) {
        self.lock().hold_launches = hold;
    }

    /// Promote every staging task to running.
    pub fn release_staging(&self) {
        let promoted: Vec<Task> = {
            let mut state = self.lock();
            state
                .tasks
                .values_mut()
                .filter(|task| task.state == TaskState::Staging)
                .map(|task| {
                    task.state = TaskState::Running;
                    task.started_at = Some(Utc::now());
                    task.clone()
                })
                .collect()
        };
        for task in promoted {
            self.publish_status(&task, TaskStatus::Running);
        }
    }

    /// Fail the next `count` artifact resolutions of an app.
    pub fn fail_artifacts(&self, app_id: &AppId, count: u32) {
        self.lock().artifact_failures.insert(app_id.clone(), count);
    }

    /// Fail the next `count` task listings.
    pub fn fail_listings(&self, count: u32) {
        self.lock().supervisor_failures = count;
    }

    pub fn tasks(&self, app_id: &AppId) -> Vec<Task> {
        self.lock()
            .tasks
            .values()
            .filter(|task| &task.app_id == app_id)
            .cloned()
            .collect()
    }

    pub fn kills(&self) -> Vec<TaskId> {
        self.lock().kills.clone()
    }

    pub fn backoffs(&self) -> Vec<(AppId, TaskId)> {
        self.lock().backoffs.clone()
    }

    /// Launch target recorded for a version, if it is still wanted.
    pub fn target(&self, app_id: &AppId, version: &Version) -> Option<u32> {
        self.lock()
            .targets
            .get(&(app_id.clone(), version.clone()))
            .copied()
    }

    fn publish_status(&self, task: &Task, status: TaskStatus) {
        self.events.publish(Event::TaskStatusChanged {
            app_id: task.app_id.clone(),
            task_id: task.id.clone(),
            version: task.version.clone(),
            status,
        });
    }
}

fn new_task(state: &mut ClusterState, app: &AppSpec, task_state: TaskState) -> Task {
    let port = state.next_port;
    state.next_port = state.next_port.wrapping_add(1).max(FIRST_PORT);
    let now = Utc::now();
    Task {
        id: TaskId::for_app(&app.id),
        app_id: app.id.clone(),
        version: app.version.clone(),
        host: "127.0.0.1".to_string(),
        ports: vec![port],
        staged_at: now,
        started_at: (task_state == TaskState::Running).then_some(now),
        state: task_state,
    }
}

#[async_trait]
impl TaskSupervisor for InMemoryCluster {
    async fn list_live_tasks(&self, app_id: &AppId) -> CollaboratorResult<Vec<Task>> {
        {
            let mut state = self.lock();
            if state.supervisor_failures > 0 {
                state.supervisor_failures -= 1;
                return Err(CollaboratorError::Unavailable(
                    "supervisor is not reachable".to_string(),
                ));
            }
        }
        Ok(self.tasks(app_id))
    }

    async fn kill_task(&self, task_id: &TaskId) -> CollaboratorResult<()> {
        let killed = {
            let mut state = self.lock();
            state.kills.push(task_id.clone());
            state.tasks.remove(task_id)
        };
        if let Some(task) = killed {
            debug!(task = %task_id, "task killed");
            self.publish_status(&task, TaskStatus::Killed);
        }
        Ok(())
    }

    async fn notify_unhealthy_task_killed(
        &self,
        app_id: &AppId,
        task_id: &TaskId,
    ) -> CollaboratorResult<()> {
        self.lock().backoffs.push((app_id.clone(), task_id.clone()));
        Ok(())
    }
}

#[async_trait]
impl TaskLauncher for InMemoryCluster {
    async fn scale(&self, app: &AppSpec, instances: u32) -> CollaboratorResult<()> {
        let launched: Vec<Task> = {
            let mut state = self.lock();
            state
                .targets
                .insert((app.id.clone(), app.version.clone()), instances);
            let live = state
                .tasks
                .values()
                .filter(|task| task.app_id == app.id && task.version == app.version)
                .count();
            let wanted = usize::try_from(instances).unwrap_or(usize::MAX);
            let task_state = if state.hold_launches {
                TaskState::Staging
            } else {
                TaskState::Running
            };
            (live..wanted)
                .map(|_| {
                    let task = new_task(&mut state, app, task_state);
                    state.tasks.insert(task.id.clone(), task.clone());
                    task
                })
                .collect()
        };

        debug!(app = %app.id, version = %app.version, launched = launched.len(), "scaled");
        for task in &launched {
            self.publish_status(task, TaskStatus::Staging);
            if task.is_running() {
                self.publish_status(task, TaskStatus::Running);
            }
        }
        Ok(())
    }

    async fn stop(&self, app_id: &AppId, version: &Version) -> CollaboratorResult<()> {
        self.lock()
            .targets
            .remove(&(app_id.clone(), version.clone()));
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for InMemoryCluster {
    async fn resolve(&self, app: &AppSpec) -> CollaboratorResult<()> {
        let mut state = self.lock();
        match state.artifact_failures.get_mut(&app.id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(CollaboratorError::Unavailable(format!(
                    "artifacts of {} not reachable",
                    app.id
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Prober answering from a per-version script. Unscripted versions are
/// healthy.
#[derive(Clone, Default)]
pub struct ScriptedProber {
    results: Arc<Mutex<HashMap<(AppId, Version), HealthResult>>>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, app_id: &AppId, version: &Version, result: HealthResult) {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((app_id.clone(), version.clone()), result);
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, task: &Task, _check: &HealthCheckSpec) -> HealthResult {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(task.app_id.clone(), task.version.clone()))
            .cloned()
            .unwrap_or(HealthResult::Healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web(version: &str) -> AppSpec {
        AppSpec::new(AppId::new("/web").unwrap(), version, 3)
    }

    #[tokio::test]
    async fn scale_launches_only_the_missing_tasks() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let cluster = InMemoryCluster::new(bus);

        cluster.seed(&web("v1"), 2);
        cluster.scale(&web("v1"), 3).await.unwrap();
        assert_eq!(cluster.tasks(&web("v1").id).len(), 3);

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            Event::TaskStatusChanged { status: TaskStatus::Staging, .. }
        ));

        // Scaling never kills.
        cluster.scale(&web("v1"), 1).await.unwrap();
        assert_eq!(cluster.tasks(&web("v1").id).len(), 3);
        assert_eq!(cluster.target(&web("v1").id, &Version::new("v1")), Some(1));
    }

    #[tokio::test]
    async fn held_launches_stay_staging() {
        let cluster = InMemoryCluster::new(EventBus::new(64));
        cluster.hold_launches(true);
        cluster.scale(&web("v1"), 2).await.unwrap();
        assert!(cluster.tasks(&web("v1").id).iter().all(|t| !t.is_running()));

        cluster.release_staging();
        assert!(cluster.tasks(&web("v1").id).iter().all(Task::is_running));
    }

    #[tokio::test]
    async fn kill_removes_and_records() {
        let cluster = InMemoryCluster::new(EventBus::new(64));
        let ids = cluster.seed(&web("v1"), 2);

        cluster.kill_task(&ids[0]).await.unwrap();
        cluster.kill_task(&TaskId::new("unknown")).await.unwrap();

        assert_eq!(cluster.tasks(&web("v1").id).len(), 1);
        assert_eq!(cluster.kills().len(), 2);
    }

    #[tokio::test]
    async fn scripted_failures_run_out() {
        let cluster = InMemoryCluster::new(EventBus::new(64));
        cluster.fail_artifacts(&web("v1").id, 1);
        assert!(cluster.resolve(&web("v1")).await.is_err());
        assert!(cluster.resolve(&web("v1")).await.is_ok());

        cluster.fail_listings(1);
        assert!(cluster.list_live_tasks(&web("v1").id).await.is_err());
        assert!(cluster.list_live_tasks(&web("v1").id).await.is_ok());
    }
}
