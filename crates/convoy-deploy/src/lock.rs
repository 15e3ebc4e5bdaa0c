//! Per-application deployment locks.
//!
//! At any instant an application is owned by at most one deployment.
//! Acquisition is all-or-nothing: a deployment either locks every app it
//! touches or none of them.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tokio::sync::Mutex;
use tracing::{debug, info};

use convoy_core::{AppId, DeploymentId};

use crate::error::{DeployError, DeployResult};

#[derive(Debug, Default)]
pub struct LockManager {
    owners: Mutex<HashMap<AppId, DeploymentId>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `apps` for `deployment`.
    ///
    /// Without `force`, any app owned by another deployment fails the whole
    /// request. With `force`, every lock held by a blocking deployment is
    /// released and the blockers are returned so the caller can cancel them.
    ///
    /// # Errors
    ///
    /// `DeploymentConflict` listing the blocking deployments.
    pub async fn acquire(
        &self,
        apps: &BTreeSet<AppId>,
        deployment: DeploymentId,
        force: bool,
    ) -> DeployResult<Vec<DeploymentId>> {
        let mut owners = self.owners.lock().await;

        let blockers: BTreeSet<DeploymentId> = apps
            .iter()
            .filter_map(|app| owners.get(app))
            .filter(|owner| **owner != deployment)
            .copied()
            .collect();

        if !blockers.is_empty() {
            if !force {
                debug!(%deployment, blockers = blockers.len(), "lock acquisition refused");
                return Err(DeployError::DeploymentConflict {
                    deployment_ids: blockers.into_iter().collect(),
                });
            }
            owners.retain(|_, owner| !blockers.contains(owner));
            info!(%deployment, preempted = blockers.len(), "locks taken over by force");
        }

        for app in apps {
            owners.insert(app.clone(), deployment);
        }
        Ok(blockers.into_iter().collect())
    }

    /// Release every lock held by `deployment`. Idempotent.
    pub async fn release(&self, deployment: DeploymentId) -> usize {
        let mut owners = self.owners.lock().await;
        let before = owners.len();
        owners.retain(|_, owner| *owner != deployment);
        let released = before - owners.len();
        if released > 0 {
            debug!(%deployment, released, "locks released");
        }
        released
    }

    pub async fn owner(&self, app_id: &AppId) -> Option<DeploymentId> {
        self.owners.lock().await.get(app_id).copied()
    }

    /// Snapshot of all held locks.
    pub async fn held(&self) -> BTreeMap<AppId, DeploymentId> {
        self.owners
            .lock()
            .await
            .iter()
            .map(|(app, owner)| (app.clone(), *owner))
            .collect()
    }
}
