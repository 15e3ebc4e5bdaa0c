//! convoy-deploy — executes deployment plans against the cluster.
//!
//! # Components
//!
//! - **`lock`**: per-application ownership, all-or-nothing acquisition
//! - **`action`**: runs one action, issuing commands and waiting for its goal
//! - **`executor`**: steps a plan to Succeeded / Cancelled / Failed
//! - **`manager`**: request, list, and cancel deployments
//! - **`memory`**: in-memory cluster for simulation and tests

pub mod action;
pub mod error;
pub mod executor;
pub mod lock;
pub mod manager;
pub mod memory;

pub use action::{ActionContext, ActionRunner, select_victims};
pub use error::{ActionError, DeployError, DeployResult};
pub use executor::{DeploymentExecutor, DeploymentState, Progress};
pub use lock::LockManager;
pub use manager::{Collaborators, DeploymentInfo, DeploymentManager};
pub use memory::{InMemoryCluster, ScriptedProber};
