//! Rolling update planning: replacing one version by another while keeping
//! a fraction of the old capacity available.

use convoy_core::AppSpec;

use crate::action::{DeploymentAction, PhasedAction, Phase};

/// Tolerance for float noise when rounding capacity fractions up.
const EPSILON: f64 = 1e-9;

/// Number of old instances that `capacity` of `instances` demands, rounded
/// up and clamped to `[0, instances]`.
pub fn keep_count(capacity: f64, instances: u32) -> u32 {
    let raw = (capacity * f64::from(instances) - EPSILON).ceil();
    if raw <= 0.0 {
        0
    } else if raw >= f64::from(instances) {
        instances
    } else {
        // In range: 0 < raw < instances.
        raw as u32
    }
}

/// The ordered actions that replace `from` by `to`, governed by the
/// minimum health capacity of `to`.
///
/// * `m == 0`: stop the old version, then start the new one.
/// * `m == 1`: start the new version in full, then stop the old one.
/// * otherwise, with `k = ceil(m * old instances)`: scale old to `k`, start
///   new with `k`, scale new to its target, then kill the remaining old tasks.
pub fn rolling_update(from: &AppSpec, to: &AppSpec) -> Vec<PhasedAction> {
    let capacity = to.upgrade_strategy.minimum_health_capacity;

    if capacity <= 0.0 {
        return vec![
            PhasedAction::new(
                Phase::Drain,
                DeploymentAction::StopApplication { app: from.clone() },
            ),
            PhasedAction::new(
                Phase::Start,
                DeploymentAction::StartApplication {
                    app: to.clone(),
                    scale_to: to.instances,
                },
            ),
        ];
    }

    if capacity >= 1.0 {
        return vec![
            PhasedAction::new(
                Phase::Start,
                DeploymentAction::StartApplication {
                    app: to.clone(),
                    scale_to: to.instances,
                },
            ),
            PhasedAction::new(
                Phase::Retire,
                DeploymentAction::StopApplication { app: from.clone() },
            ),
        ];
    }

    let keep = keep_count(capacity, from.instances);
    vec![
        PhasedAction::new(
            Phase::Drain,
            DeploymentAction::ScaleApplication {
                app: from.clone(),
                scale_to: keep,
            },
        ),
        PhasedAction::new(
            Phase::Start,
            DeploymentAction::StartApplication {
                app: to.clone(),
                scale_to: keep,
            },
        ),
        PhasedAction::new(
            Phase::Start,
            DeploymentAction::ScaleApplication {
                app: to.clone(),
                scale_to: to.instances,
            },
        ),
        PhasedAction::new(
            Phase::Retire,
            DeploymentAction::KillAllOldTasksOf { app: to.clone() },
        ),
    ]
}
