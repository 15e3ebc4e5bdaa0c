//! The primitive actions a deployment step is made of.

use std::fmt;

use serde::{Deserialize, Serialize};

use convoy_core::AppSpec;

/// One primitive change to the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DeploymentAction {
    /// Make every artifact of the version available.
    ResolveArtifacts { app: AppSpec },
    /// Launch a fresh version up to `scale_to` healthy instances.
    StartApplication { app: AppSpec, scale_to: u32 },
    /// Kill every task of the version.
    StopApplication { app: AppSpec },
    /// Move an existing version to `scale_to` instances.
    ScaleApplication { app: AppSpec, scale_to: u32 },
    /// Replace `from` by `to` with a rolling update, as a single action.
    RestartApplication { from: AppSpec, to: AppSpec },
    /// Kill tasks of every version of the app other than `app`'s.
    KillAllOldTasksOf { app: AppSpec },
}

impl DeploymentAction {
    /// The application version the action targets. For a restart this is
    /// the version being rolled out.
    pub fn app(&self) -> &AppSpec {
        match self {
            Self::ResolveArtifacts { app }
            | Self::StartApplication { app, .. }
            | Self::StopApplication { app }
            | Self::ScaleApplication { app, .. }
            | Self::KillAllOldTasksOf { app } => app,
            Self::RestartApplication { to, .. } => to,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResolveArtifacts { .. } => "resolve_artifacts",
            Self::StartApplication { .. } => "start_application",
            Self::StopApplication { .. } => "stop_application",
            Self::ScaleApplication { .. } => "scale_application",
            Self::RestartApplication { .. } => "restart_application",
            Self::KillAllOldTasksOf { .. } => "kill_all_old_tasks_of",
        }
    }
}

impl fmt::Display for DeploymentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResolveArtifacts { app } => {
                write!(f, "resolve artifacts of {}@{}", app.id, app.version)
            }
            Self::StartApplication { app, scale_to } => {
                write!(f, "start {}@{} with {scale_to} instances", app.id, app.version)
            }
            Self::StopApplication { app } => write!(f, "stop {}@{}", app.id, app.version),
            Self::ScaleApplication { app, scale_to } => {
                write!(f, "scale {}@{} to {scale_to} instances", app.id, app.version)
            }
            Self::RestartApplication { from, to } => write!(
                f,
                "restart {} from {} to {} (minimum health capacity {})",
                to.id, from.version, to.version, to.upgrade_strategy.minimum_health_capacity
            ),
            Self::KillAllOldTasksOf { app } => {
                write!(f, "kill tasks of {} not at {}", app.id, app.version)
            }
        }
    }
}

/// Ordering band of an action within a plan.
///
/// Phases run in declaration order for a single app. Across apps, `Start`
/// actions follow the dependency order, `Drain` and `Retire` the reverse.
/// `Drain` covers capacity removed before new capacity arrives, `Retire`
/// the capacity removed after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Resolve,
    Drain,
    Start,
    Retire,
}

impl Phase {
    /// Whether the phase removes capacity, and so is ordered dependents first.
    pub fn is_stop(self) -> bool {
        matches!(self, Self::Drain | Self::Retire)
    }
}

/// An action tagged with the phase it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct PhasedAction {
    pub phase: Phase,
    pub action: DeploymentAction,
}

impl PhasedAction {
    pub fn new(phase: Phase, action: DeploymentAction) -> Self {
        Self { phase, action }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::AppId;

    #[test]
    fn restart_targets_new_version() {
        let from = AppSpec::new(AppId::new("/web").unwrap(), "v1", 3);
        let to = AppSpec::new(AppId::new("/web").unwrap(), "v2", 3).with_minimum_health_capacity(0.5);
        let action = DeploymentAction::RestartApplication { from, to };

        assert_eq!(action.app().version.as_str(), "v2");
        assert_eq!(action.to_string(), "restart /web from v1 to v2 (minimum health capacity 0.5)");
    }

    #[test]
    fn serializes_with_action_tag() {
        let app = AppSpec::new(AppId::new("/web").unwrap(), "v1", 3);
        let json = serde_json::to_value(DeploymentAction::ScaleApplication { app, scale_to: 5 }).unwrap();
        assert_eq!(json["action"], "scale_application");
        assert_eq!(json["scale_to"], 5);
    }
}
