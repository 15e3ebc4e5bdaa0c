//! `convoyd simulate`: run one transition against an in-memory cluster.
//!
//! Current versions named by the transition are seeded as already running.
//! Every event is printed as one JSON line on stdout until the deployment
//! reaches a terminal state; Ctrl-C cancels it.

use std::sync::Arc;

use anyhow::bail;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use convoy_core::{ConvoyConfig, Event, EventBus};
use convoy_deploy::{Collaborators, DeploymentManager, InMemoryCluster, ScriptedProber};
use convoy_plan::Transition;

pub async fn run(transition: Transition, config: &ConvoyConfig, force: bool) -> anyhow::Result<()> {
    let events = EventBus::new(config.deploy.event_buffer);
    let cluster = InMemoryCluster::new(events.clone());
    for current in transition.apps.iter().filter_map(|app| app.from.as_ref()) {
        let seeded = cluster.seed(current, current.instances);
        info!(app = %current.id, version = %current.version, tasks = seeded.len(), "seeded");
    }

    let manager = DeploymentManager::new(
        Collaborators {
            supervisor: Arc::new(cluster.clone()),
            launcher: Arc::new(cluster.clone()),
            artifacts: Arc::new(cluster.clone()),
            prober: Arc::new(ScriptedProber::new()),
        },
        events.clone(),
        config,
    );

    let mut rx = events.subscribe();
    let deployment = manager.request_transition(&transition, force).await?;
    info!(%deployment, "deployment requested");

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, cancelling deployment");
                manager.cancel_deployment(deployment).await?;
            }
            received = rx.recv() => match received {
                Ok(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    let terminal = matches!(
                        event,
                        Event::DeploymentSucceeded { .. }
                            | Event::DeploymentCancelled { .. }
                            | Event::DeploymentFailed { .. }
                    );
                    if terminal && event.deployment_id() == Some(deployment) {
                        break event;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event output lagged"),
                Err(RecvError::Closed) => bail!("event bus closed"),
            },
        }
    };

    for app_id in transition.apps.iter().filter_map(|app| app.app_id()) {
        let tasks = cluster.tasks(app_id);
        info!(app = %app_id, tasks = tasks.len(), "final task count");
    }
    manager.shutdown().await;

    match outcome {
        Event::DeploymentFailed { reason, .. } => bail!("deployment {deployment} failed: {reason}"),
        Event::DeploymentCancelled { .. } => bail!("deployment {deployment} was cancelled"),
        _ => Ok(()),
    }
}
