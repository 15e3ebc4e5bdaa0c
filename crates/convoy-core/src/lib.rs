//! convoy-core — shared types for the Convoy deployment orchestrator.
//!
//! Everything the orchestration crates exchange lives here: identifiers,
//! application and health-check specs, observed tasks, the event model,
//! the narrow traits through which the core talks to the outside world,
//! and the `convoy.toml` configuration.
//!
//! # Collaborators
//!
//! ```text
//! TaskSupervisor   list live tasks, kill, back-off notification
//! TaskLauncher     "run N tasks of this app version"
//! ArtifactStore    confirm artifacts for an app version
//! EventBus         in-process fan-out of lifecycle events
//! ```

pub mod app;
pub mod collaborators;
pub mod config;
pub mod duration;
pub mod error;
pub mod events;
pub mod ids;
pub mod task;

pub use app::{AppSpec, HealthCheckSpec, HealthProtocol, UpgradeStrategy};
pub use collaborators::{ArtifactStore, TaskLauncher, TaskSupervisor};
pub use config::{ConvoyConfig, DeploySettings, HealthSettings, LogSettings};
pub use duration::parse_duration;
pub use error::{CollaboratorError, CollaboratorResult, CoreError, CoreResult};
pub use events::{Event, EventBus, TaskStatus};
pub use ids::{AppId, DeploymentId, TaskId, Version};
pub use task::{Task, TaskState};
