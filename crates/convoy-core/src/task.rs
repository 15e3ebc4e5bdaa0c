//! Task instances as observed from the supervision layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AppId, TaskId, Version};

/// Lifecycle flag of a live task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Launched but not yet reported running.
    Staging,
    Running,
}

/// A running unit belonging to one application version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub app_id: AppId,
    pub version: Version,
    pub host: String,
    #[serde(default)]
    pub ports: Vec<u16>,
    pub staged_at: DateTime<Utc>,
    /// Set once the task reports running.
    pub started_at: Option<DateTime<Utc>>,
    pub state: TaskState,
}

impl Task {
    pub fn is_running(&self) -> bool {
        self.state == TaskState::Running
    }

    /// `host:port` for the port at `port_index`, if the task has one.
    pub fn address(&self, port_index: usize) -> Option<String> {
        self.ports
            .get(port_index)
            .map(|port| format!("{}:{}", self.host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_uses_port_index() {
        let app_id = AppId::new("/web").unwrap();
        let task = Task {
            id: TaskId::for_app(&app_id),
            app_id,
            version: Version::new("v1"),
            host: "10.0.0.4".to_string(),
            ports: vec![31000, 31001],
            staged_at: Utc::now(),
            started_at: None,
            state: TaskState::Staging,
        };
        assert_eq!(task.address(1).as_deref(), Some("10.0.0.4:31001"));
        assert_eq!(task.address(2), None);
        assert!(!task.is_running());
    }
}
