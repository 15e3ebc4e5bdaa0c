//! convoy-plan — turns a declared-state transition into a deployment plan.
//!
//! Planning is pure. It validates the transition, orders the touched
//! applications by their dependencies, expands version changes into
//! rolling update sequences, and packs the resulting actions into steps
//! that a deployment executor runs one after another.

pub mod action;
pub mod error;
pub mod graph;
pub mod plan;
pub mod rolling;

pub use action::{DeploymentAction, Phase, PhasedAction};
pub use error::{PlanError, PlanResult};
pub use graph::{DependencyGraph, Traversal};
pub use plan::{AppTransition, DeploymentPlan, DeploymentStep, Transition};
pub use rolling::{keep_count, rolling_update};
