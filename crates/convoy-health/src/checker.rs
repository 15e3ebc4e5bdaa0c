//! Health record arithmetic.
//!
//! A [`HealthRecord`] aggregates the probe results of one task for one
//! health check. Applying a result is a pure function of the record, the
//! task, the check, and the current time, so the escalation rules (grace
//! period, consecutive-failure threshold) are tested here without timers.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use convoy_core::{HealthCheckSpec, Task, TaskId};

/// Result of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthResult {
    Healthy,
    Unhealthy { cause: String },
}

impl HealthResult {
    pub fn unhealthy(cause: impl Into<String>) -> Self {
        Self::Unhealthy {
            cause: cause.into(),
        }
    }
}

/// Per-task aggregate of probe outcomes for one health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub task_id: TaskId,
    pub first_success: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_failure_cause: Option<String>,
    pub consecutive_failures: u32,
    /// True iff the most recent recorded outcome was healthy.
    pub alive: bool,
}

/// What the owning monitor must do after a result was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Escalation {
    /// Publish a failed-health-check event.
    pub failed_check: bool,
    /// The consecutive-failure threshold was reached.
    pub kill: bool,
}

impl HealthRecord {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            first_success: None,
            last_success: None,
            last_failure: None,
            last_failure_cause: None,
            consecutive_failures: 0,
            alive: false,
        }
    }

    /// Merge a probe result into the record.
    pub fn apply(
        &mut self,
        result: &HealthResult,
        task: &Task,
        check: &HealthCheckSpec,
        now: DateTime<Utc>,
    ) -> Escalation {
        match result {
            HealthResult::Healthy => {
                if !self.alive {
                    debug!(task_id = %self.task_id, "task passed health check");
                }
                self.consecutive_failures = 0;
                self.first_success.get_or_insert(now);
                self.last_success = Some(now);
                self.alive = true;
                Escalation::default()
            }
            HealthResult::Unhealthy { cause } => {
                self.last_failure = Some(now);
                self.last_failure_cause = Some(cause.clone());
                self.alive = false;

                if self.in_grace_period(task, check.grace_period(), now) {
                    debug!(task_id = %self.task_id, %cause, "ignoring failure during grace period");
                    return Escalation::default();
                }

                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                let max = check.max_consecutive_failures;
                let kill = max > 0 && self.consecutive_failures >= max;
                if kill {
                    warn!(
                        task_id = %self.task_id,
                        failures = self.consecutive_failures,
                        threshold = max,
                        "task exceeded consecutive health check failures"
                    );
                }
                Escalation {
                    failed_check: true,
                    kill,
                }
            }
        }
    }

    /// A task is in its grace period until it has started and either
    /// passed a check or outlived `grace`.
    fn in_grace_period(&self, task: &Task, grace: Duration, now: DateTime<Utc>) -> bool {
        let Some(started_at) = task.started_at else {
            return true;
        };
        if self.first_success.is_some() {
            return false;
        }
        TimeDelta::from_std(grace).map_or(true, |grace| now.signed_duration_since(started_at) < grace)
    }
}
