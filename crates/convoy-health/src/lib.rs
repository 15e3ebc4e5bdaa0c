//! convoy-health — health monitoring for Convoy.
//!
//! One monitor actor runs per (application version, health check). Each
//! monitor periodically probes every running task of its version, keeps a
//! [`HealthRecord`] per task, and escalates chronic failures by killing the
//! task and asking the scheduling layer to back off.
//!
//! # Architecture
//!
//! ```text
//! HealthCheckManager
//!   └── MonitorHandle per (app, version, check)
//!       ├── interval timer (stopped when the handle drops)
//!       ├── probe job per running task ──► Prober
//!       ├── HealthRecord per task (grace period, failure streak)
//!       └── TaskSupervisor: kill + back-off notification
//! ```
//!
//! Health transitions are published on the [`convoy_core::EventBus`] as
//! `HealthStatusChanged`; deployment executors wait on them.

pub mod checker;
pub mod manager;
pub mod monitor;
pub mod probe;

pub use checker::{Escalation, HealthRecord, HealthResult};
pub use manager::{HealthCheckManager, TaskHealth};
pub use monitor::{MonitorClient, MonitorContext, MonitorHandle, MonitorKey};
pub use probe::{NetworkProber, Prober};
