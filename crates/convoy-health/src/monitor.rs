//! Health monitor: one actor per (application version, health check).
//!
//! The monitor owns its health records outright: every mutation happens
//! inside its processing loop, one message at a time. On each tick it
//! refreshes the live task set, purges records of vanished tasks, and
//! spawns one short-lived probe job per running task. Probe jobs report
//! back through the monitor's own mailbox.
//!
//! ```text
//! tick ──► list_live_tasks ──► purge ──► spawn probe job per task
//!                                             │
//! mailbox ◄───────────── ProbeResult ◄────────┘
//!    └─► HealthRecord::apply ──► events / kill / back-off notification
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use convoy_core::{
    AppId, Event, EventBus, HealthCheckSpec, Task, TaskId, TaskSupervisor, Version,
};

use crate::checker::{HealthRecord, HealthResult};
use crate::probe::Prober;

const MAILBOX_CAPACITY: usize = 256;

/// Identifies one monitor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonitorKey {
    pub app_id: AppId,
    pub version: Version,
    pub check_index: usize,
}

impl fmt::Display for MonitorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.app_id, self.version, self.check_index)
    }
}

enum Command {
    ProbeResult {
        task_id: TaskId,
        result: HealthResult,
    },
    Query {
        task_id: TaskId,
        reply: oneshot::Sender<Option<HealthRecord>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<HealthRecord>>,
    },
}

/// Collaborators shared by every monitor.
#[derive(Clone)]
pub struct MonitorContext {
    pub supervisor: Arc<dyn TaskSupervisor>,
    pub prober: Arc<dyn Prober>,
    pub events: EventBus,
    /// Bound on task listing and kill calls.
    pub collaborator_timeout: Duration,
}

/// Owning handle to a running monitor. Dropping it stops the monitor.
pub struct MonitorHandle {
    key: MonitorKey,
    client: MonitorClient,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Cloneable query side of a monitor.
#[derive(Clone)]
pub struct MonitorClient {
    tx: mpsc::Sender<Command>,
}

impl MonitorHandle {
    /// Spawn the monitor task. Its timer lives exactly as long as the handle.
    pub fn spawn(key: MonitorKey, check: HealthCheckSpec, ctx: MonitorContext) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let monitor = HealthMonitor {
            key: key.clone(),
            check,
            ctx,
            mailbox: tx.clone(),
            live: HashMap::new(),
            records: HashMap::new(),
            kill_requested: HashSet::new(),
        };
        let handle = tokio::spawn(monitor.run(rx, shutdown_rx));

        info!(monitor = %key, "health monitor started");
        Self {
            key,
            client: MonitorClient { tx },
            shutdown_tx,
            handle,
        }
    }

    pub fn key(&self) -> &MonitorKey {
        &self.key
    }

    pub fn client(&self) -> MonitorClient {
        self.client.clone()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
        debug!(monitor = %self.key, "health monitor stopped");
    }
}

impl MonitorClient {
    /// Current record for a task, or `None` if the task is untracked or the
    /// monitor has stopped.
    pub async fn query(&self, task_id: &TaskId) -> Option<HealthRecord> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Query {
                task_id: task_id.clone(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// All records currently held by the monitor.
    pub async fn snapshot(&self) -> Vec<HealthRecord> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Snapshot { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

struct HealthMonitor {
    key: MonitorKey,
    check: HealthCheckSpec,
    ctx: MonitorContext,
    /// Sender side of our own mailbox, handed to probe jobs.
    mailbox: mpsc::Sender<Command>,
    /// Live tasks of this version as of the last successful listing.
    live: HashMap<TaskId, Task>,
    records: HashMap<TaskId, HealthRecord>,
    /// Tasks already killed for failing this check.
    kill_requested: HashSet<TaskId>,
}

impl HealthMonitor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.check.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    debug!(monitor = %self.key, "health loop shutting down");
                    break;
                }
                Some(command) = rx.recv() => self.handle(command).await,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::ProbeResult { task_id, result } => self.on_result(task_id, result).await,
            Command::Query { task_id, reply } => {
                let _ = reply.send(self.records.get(&task_id).cloned());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.records.values().cloned().collect());
            }
        }
    }

    async fn tick(&mut self) {
        let listing = tokio::time::timeout(
            self.ctx.collaborator_timeout,
            self.ctx.supervisor.list_live_tasks(&self.key.app_id),
        )
        .await;
        let tasks = match listing {
            Ok(Ok(tasks)) => tasks,
            Ok(Err(e)) => {
                warn!(monitor = %self.key, error = %e, "listing live tasks failed, retrying next tick");
                return;
            }
            Err(_) => {
                warn!(monitor = %self.key, "listing live tasks timed out, retrying next tick");
                return;
            }
        };

        self.live = tasks
            .into_iter()
            .filter(|task| task.version == self.key.version)
            .map(|task| (task.id.clone(), task))
            .collect();
        self.purge();

        for task in self.live.values().filter(|task| task.is_running()) {
            self.dispatch_probe(task.clone());
        }
    }

    /// Drop state for tasks that are no longer live.
    fn purge(&mut self) {
        let live = &self.live;
        let before = self.records.len();
        self.records.retain(|task_id, _| live.contains_key(task_id));
        self.kill_requested.retain(|task_id| live.contains_key(task_id));
        let purged = before - self.records.len();
        if purged > 0 {
            debug!(monitor = %self.key, purged, "purged health records of vanished tasks");
        }
    }

    fn dispatch_probe(&self, task: Task) {
        let prober = Arc::clone(&self.ctx.prober);
        let check = self.check.clone();
        let mailbox = self.mailbox.clone();

        tokio::spawn(async move {
            let result = tokio::time::timeout(check.timeout(), prober.probe(&task, &check))
                .await
                .unwrap_or_else(|_| HealthResult::unhealthy("probe timed out"));
            // The monitor may be gone; the result is then simply dropped.
            let _ = mailbox
                .send(Command::ProbeResult {
                    task_id: task.id,
                    result,
                })
                .await;
        });
    }

    async fn on_result(&mut self, task_id: TaskId, result: HealthResult) {
        let Some(task) = self.live.get(&task_id) else {
            debug!(monitor = %self.key, %task_id, "discarding result for untracked task");
            return;
        };

        let record = self
            .records
            .entry(task_id.clone())
            .or_insert_with(|| HealthRecord::new(task_id.clone()));
        let was_alive = record.alive;
        let escalation = record.apply(&result, task, &self.check, Utc::now());
        let alive = record.alive;
        let consecutive_failures = record.consecutive_failures;

        if escalation.failed_check {
            self.ctx.events.publish(Event::FailedHealthCheck {
                app_id: self.key.app_id.clone(),
                task_id: task_id.clone(),
                check_index: self.key.check_index,
                consecutive_failures,
            });
        }

        if alive != was_alive {
            debug!(monitor = %self.key, %task_id, alive, "health status changed");
            self.ctx.events.publish(Event::HealthStatusChanged {
                app_id: self.key.app_id.clone(),
                task_id: task_id.clone(),
                version: self.key.version.clone(),
                alive,
            });
        }

        if escalation.kill && self.kill_requested.insert(task_id.clone()) {
            self.kill_unhealthy(&task_id, consecutive_failures).await;
        }
    }

    async fn kill_unhealthy(&mut self, task_id: &TaskId, failures: u32) {
        let timeout = self.ctx.collaborator_timeout;
        let supervisor = &self.ctx.supervisor;

        match tokio::time::timeout(timeout, supervisor.kill_task(task_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(monitor = %self.key, %task_id, error = %e, "failed to kill unhealthy task");
                self.kill_requested.remove(task_id);
                return;
            }
            Err(_) => {
                error!(monitor = %self.key, %task_id, "killing unhealthy task timed out");
                self.kill_requested.remove(task_id);
                return;
            }
        }

        let notified = tokio::time::timeout(
            timeout,
            supervisor.notify_unhealthy_task_killed(&self.key.app_id, task_id),
        )
        .await;
        if !matches!(notified, Ok(Ok(()))) {
            warn!(monitor = %self.key, %task_id, "back-off notification for killed task failed");
        }

        let reason = format!("{failures} consecutive health check failures");
        info!(monitor = %self.key, %task_id, %reason, "killed unhealthy task");
        self.ctx.events.publish(Event::UnhealthyTaskKilled {
            app_id: self.key.app_id.clone(),
            task_id: task_id.clone(),
            version: self.key.version.clone(),
            reason,
        });
    }
}
