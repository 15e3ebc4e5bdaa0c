//! Registry of running health monitors.
//!
//! Deployment executors add monitors when a version starts and remove them
//! when a version is stopped. Queries fan out to the monitors of the
//! task's application.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use convoy_core::{AppId, AppSpec, EventBus, HealthSettings, TaskId, TaskSupervisor, Version};

use crate::checker::HealthRecord;
use crate::monitor::{MonitorClient, MonitorContext, MonitorHandle, MonitorKey};
use crate::probe::Prober;

/// Aggregate health of a task across all checks of its version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHealth {
    pub task_id: TaskId,
    /// True iff every check currently reports the task alive.
    pub alive: bool,
    pub records: Vec<HealthRecord>,
}

/// Owns every [`MonitorHandle`]; dropping the manager stops all monitors.
pub struct HealthCheckManager {
    ctx: MonitorContext,
    monitors: RwLock<HashMap<MonitorKey, MonitorHandle>>,
}

impl HealthCheckManager {
    pub fn new(
        supervisor: Arc<dyn TaskSupervisor>,
        prober: Arc<dyn Prober>,
        events: EventBus,
        settings: &HealthSettings,
    ) -> Self {
        Self {
            ctx: MonitorContext {
                supervisor,
                prober,
                events,
                collaborator_timeout: settings.collaborator_timeout(),
            },
            monitors: RwLock::new(HashMap::new()),
        }
    }

    /// Ensure a monitor runs for every health check of `app`'s version.
    pub async fn add_app(&self, app: &AppSpec) {
        let mut monitors = self.monitors.write().await;
        for (check_index, check) in app.health_checks.iter().enumerate() {
            let key = MonitorKey {
                app_id: app.id.clone(),
                version: app.version.clone(),
                check_index,
            };
            if monitors.contains_key(&key) {
                continue;
            }
            let handle = MonitorHandle::spawn(key.clone(), check.clone(), self.ctx.clone());
            monitors.insert(key, handle);
        }
    }

    /// Stop the monitors of one version of an app.
    pub async fn remove_version(&self, app_id: &AppId, version: &Version) {
        self.remove_where(|key| &key.app_id == app_id && &key.version == version)
            .await;
    }

    /// Stop the monitors of every version of an app except `keep`.
    pub async fn remove_other_versions(&self, app_id: &AppId, keep: &Version) {
        self.remove_where(|key| &key.app_id == app_id && &key.version != keep)
            .await;
    }

    /// Stop all monitors (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        let count = monitors.len();
        monitors.clear();
        info!(count, "all health monitors stopped");
    }

    async fn remove_where<F: Fn(&MonitorKey) -> bool>(&self, matches: F) {
        let mut monitors = self.monitors.write().await;
        let before = monitors.len();
        monitors.retain(|key, _| !matches(key));
        let removed = before - monitors.len();
        if removed > 0 {
            debug!(removed, "health monitors removed");
        }
    }

    pub async fn active_monitors(&self) -> Vec<MonitorKey> {
        let monitors = self.monitors.read().await;
        let mut keys: Vec<_> = monitors.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Current health of a task, or `None` if no monitor tracks it.
    pub async fn task_health(&self, task_id: &TaskId) -> Option<TaskHealth> {
        let app_id = task_id.app_id()?;
        let clients = self.clients_where(|key| key.app_id == app_id).await;

        let mut records = Vec::new();
        for client in clients {
            if let Some(record) = client.query(task_id).await {
                records.push(record);
            }
        }
        if records.is_empty() {
            return None;
        }
        Some(TaskHealth {
            task_id: task_id.clone(),
            alive: records.iter().all(|r| r.alive),
            records,
        })
    }

    /// Tasks of `app`'s version that every one of its checks reports alive.
    ///
    /// Empty when the version has no running monitors.
    pub async fn alive_tasks(&self, app: &AppSpec) -> HashSet<TaskId> {
        let mut alive: Option<HashSet<TaskId>> = None;
        for check_index in 0..app.health_checks.len() {
            let key = MonitorKey {
                app_id: app.id.clone(),
                version: app.version.clone(),
                check_index,
            };
            let Some(client) = self.clients_where(|k| k == &key).await.pop() else {
                return HashSet::new();
            };
            let passing: HashSet<TaskId> = client
                .snapshot()
                .await
                .into_iter()
                .filter(|record| record.alive)
                .map(|record| record.task_id)
                .collect();
            alive = Some(match alive {
                Some(acc) => acc.intersection(&passing).cloned().collect(),
                None => passing,
            });
        }
        alive.unwrap_or_default()
    }

    async fn clients_where<F: Fn(&MonitorKey) -> bool>(&self, matches: F) -> Vec<MonitorClient> {
        let monitors = self.monitors.read().await;
        monitors
            .iter()
            .filter(|(key, _)| matches(key))
            .map(|(_, handle)| handle.client())
            .collect()
    }
}
