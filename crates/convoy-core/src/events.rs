//! Lifecycle events and the in-process event bus.
//!
//! The bus is a `tokio::sync::broadcast` channel: publishing never blocks,
//! and slow subscribers observe `Lagged` rather than stalling producers.
//! Deployment executors subscribe to it to re-evaluate completion
//! conditions; an external transport can subscribe and forward.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::ids::{AppId, DeploymentId, TaskId, Version};

/// Terminal or transitional status reported for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Staging,
    Running,
    Killed,
}

/// Everything the orchestration core publishes or listens for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A task's aggregate `alive` flag flipped.
    HealthStatusChanged {
        app_id: AppId,
        task_id: TaskId,
        version: Version,
        alive: bool,
    },
    /// A post-grace probe failed.
    FailedHealthCheck {
        app_id: AppId,
        task_id: TaskId,
        check_index: usize,
        consecutive_failures: u32,
    },
    /// A task was killed after too many consecutive failures.
    UnhealthyTaskKilled {
        app_id: AppId,
        task_id: TaskId,
        version: Version,
        reason: String,
    },
    /// Reported by the supervision layer.
    TaskStatusChanged {
        app_id: AppId,
        task_id: TaskId,
        version: Version,
        status: TaskStatus,
    },
    ArtifactsResolved {
        app_id: AppId,
        version: Version,
    },
    DeploymentStarted {
        deployment_id: DeploymentId,
        affected_apps: Vec<AppId>,
        steps: usize,
    },
    DeploymentStepSucceeded {
        deployment_id: DeploymentId,
        step: usize,
    },
    DeploymentSucceeded {
        deployment_id: DeploymentId,
    },
    DeploymentCancelled {
        deployment_id: DeploymentId,
    },
    DeploymentFailed {
        deployment_id: DeploymentId,
        reason: String,
    },
}

impl Event {
    /// The application an event concerns, for task- and app-level events.
    pub fn app_id(&self) -> Option<&AppId> {
        match self {
            Event::HealthStatusChanged { app_id, .. }
            | Event::FailedHealthCheck { app_id, .. }
            | Event::UnhealthyTaskKilled { app_id, .. }
            | Event::TaskStatusChanged { app_id, .. }
            | Event::ArtifactsResolved { app_id, .. } => Some(app_id),
            _ => None,
        }
    }

    /// The deployment an event concerns, for deployment lifecycle events.
    pub fn deployment_id(&self) -> Option<DeploymentId> {
        match self {
            Event::DeploymentStarted { deployment_id, .. }
            | Event::DeploymentStepSucceeded { deployment_id, .. }
            | Event::DeploymentSucceeded { deployment_id }
            | Event::DeploymentCancelled { deployment_id }
            | Event::DeploymentFailed { deployment_id, .. } => Some(*deployment_id),
            _ => None,
        }
    }
}

/// Fire-and-forget event fan-out. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        trace!(?event, "publishing event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let id = DeploymentId::generate();

        bus.publish(Event::DeploymentSucceeded { deployment_id: id });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.deployment_id(), Some(id));
        assert_eq!(event.app_id(), None);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(Event::ArtifactsResolved {
            app_id: AppId::new("/web").unwrap(),
            version: Version::new("v1"),
        });
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = Event::HealthStatusChanged {
            app_id: AppId::new("/web").unwrap(),
            task_id: TaskId::new("web.1"),
            version: Version::new("v2"),
            alive: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "health_status_changed");
        assert_eq!(json["alive"], true);
    }
}
