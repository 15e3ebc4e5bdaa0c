//! Compiling a transition into an ordered deployment plan.
//!
//! Every touched application contributes a short chain of phased actions.
//! The chains are laid over the dependency graph: `Start` actions wait for
//! the `Start` actions of the app's dependencies, `Drain` and `Retire`
//! actions wait for those of its dependents. Where the chains allow it, a
//! dependency's stops also wait for every stop of its dependents, whatever
//! the phase. Each action then lands in the earliest step after all of its
//! predecessors, so independent work shares a step and runs concurrently.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use convoy_core::{AppId, AppSpec};

use crate::action::{DeploymentAction, Phase, PhasedAction};
use crate::error::{PlanError, PlanResult};
use crate::graph::DependencyGraph;
use crate::rolling::rolling_update;

/// Old and new declared state of a single application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppTransition {
    /// Currently deployed version, absent for a new app.
    #[serde(default)]
    pub from: Option<AppSpec>,
    /// Desired version, absent for a removal.
    #[serde(default)]
    pub to: Option<AppSpec>,
    /// Replace the running version as one restart action.
    #[serde(default)]
    pub restart: bool,
}

impl AppTransition {
    pub fn create(to: AppSpec) -> Self {
        Self { from: None, to: Some(to), restart: false }
    }

    pub fn destroy(from: AppSpec) -> Self {
        Self { from: Some(from), to: None, restart: false }
    }

    pub fn update(from: AppSpec, to: AppSpec) -> Self {
        Self { from: Some(from), to: Some(to), restart: false }
    }

    pub fn restart(from: AppSpec, to: AppSpec) -> Self {
        Self { from: Some(from), to: Some(to), restart: true }
    }

    pub fn app_id(&self) -> Option<&AppId> {
        self.to.as_ref().or(self.from.as_ref()).map(|app| &app.id)
    }

    /// The definition whose dependencies govern ordering: the target, or the
    /// current version for a removal.
    fn governing_spec(&self) -> Option<&AppSpec> {
        self.to.as_ref().or(self.from.as_ref())
    }

    fn validate(&self) -> PlanResult<()> {
        match (&self.from, &self.to) {
            (None, None) => Err(PlanError::InvalidTransition(
                "an app transition needs a current or a target spec".to_string(),
            )),
            (Some(from), Some(to)) if from.id != to.id => Err(PlanError::InvalidTransition(
                format!("cannot transition {} into {}", from.id, to.id),
            )),
            (Some(from), Some(to)) if self.restart && from.version == to.version => {
                Err(PlanError::InvalidTransition(format!(
                    "restart of {} needs a new version tag, got {} twice",
                    to.id, to.version
                )))
            }
            (from, to) if self.restart && (from.is_none() || to.is_none()) => {
                Err(PlanError::InvalidTransition(format!(
                    "restart of {} needs both a current and a target spec",
                    self.app_id().map(AppId::as_str).unwrap_or_default()
                )))
            }
            (from, to) => {
                for spec in from.iter().chain(to.iter()) {
                    spec.validate()?;
                }
                Ok(())
            }
        }
    }

    /// The actions for this app alone, in execution order.
    fn actions(&self) -> Vec<PhasedAction> {
        let resolve = |app: &AppSpec| {
            (!app.artifacts.is_empty()).then(|| {
                PhasedAction::new(
                    Phase::Resolve,
                    DeploymentAction::ResolveArtifacts { app: app.clone() },
                )
            })
        };

        match (&self.from, &self.to) {
            (None, Some(to)) => resolve(to)
                .into_iter()
                .chain([PhasedAction::new(
                    Phase::Start,
                    DeploymentAction::StartApplication {
                        app: to.clone(),
                        scale_to: to.instances,
                    },
                )])
                .collect(),
            (Some(from), None) => vec![PhasedAction::new(
                Phase::Drain,
                DeploymentAction::StopApplication { app: from.clone() },
            )],
            (Some(from), Some(to)) if self.restart => resolve(to)
                .into_iter()
                .chain([PhasedAction::new(
                    Phase::Start,
                    DeploymentAction::RestartApplication {
                        from: from.clone(),
                        to: to.clone(),
                    },
                )])
                .collect(),
            (Some(from), Some(to)) if from.version != to.version => resolve(to)
                .into_iter()
                .chain(rolling_update(from, to))
                .collect(),
            (Some(from), Some(to)) if from.instances != to.instances => {
                let phase = if to.instances > from.instances {
                    Phase::Start
                } else {
                    Phase::Drain
                };
                vec![PhasedAction::new(
                    phase,
                    DeploymentAction::ScaleApplication {
                        app: to.clone(),
                        scale_to: to.instances,
                    },
                )]
            }
            _ => Vec::new(),
        }
    }
}

/// A set of per-application changes requested together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    #[serde(default)]
    pub apps: Vec<AppTransition>,
}

impl Transition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, app: AppTransition) -> Self {
        self.apps.push(app);
        self
    }
}

/// Actions that may run concurrently.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub actions: Vec<DeploymentAction>,
}

/// An ordered list of steps. Step `i + 1` starts only after every action of
/// step `i` has completed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub steps: Vec<DeploymentStep>,
    pub affected_apps: BTreeSet<AppId>,
}

struct Node {
    app_id: AppId,
    chain_index: usize,
    phase: Phase,
    action: DeploymentAction,
}

impl DeploymentPlan {
    /// Compile `transition` into a plan.
    ///
    /// Pure: nothing is locked or executed. Every app named by the
    /// transition is affected, even when it needs no action.
    ///
    /// # Errors
    ///
    /// * `InvalidTransition` for malformed or duplicate entries.
    /// * `InvalidSpec` for out-of-range spec values.
    /// * `CyclicDependency` when dependencies among the touched apps loop.
    pub fn build(transition: &Transition) -> PlanResult<Self> {
        let mut governing: BTreeMap<&AppId, &AppTransition> = BTreeMap::new();
        for entry in &transition.apps {
            entry.validate()?;
            let Some(app_id) = entry.app_id() else {
                continue;
            };
            if governing.insert(app_id, entry).is_some() {
                return Err(PlanError::InvalidTransition(format!(
                    "{app_id} appears more than once"
                )));
            }
        }

        let graph =
            DependencyGraph::from_specs(governing.values().filter_map(|e| e.governing_spec()));
        graph.topological_order()?;

        let nodes: Vec<Node> = governing
            .iter()
            .flat_map(|(app_id, entry)| {
                entry
                    .actions()
                    .into_iter()
                    .enumerate()
                    .map(|(chain_index, phased)| Node {
                        app_id: (*app_id).clone(),
                        chain_index,
                        phase: phased.phase,
                        action: phased.action,
                    })
            })
            .collect();

        let mut chains: HashMap<&AppId, Vec<usize>> = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            chains.entry(&node.app_id).or_default().push(i);
        }
        let chain_of = |app_id: &AppId| chains.get(app_id).map(Vec::as_slice).unwrap_or_default();

        let mut dag: DiGraph<usize, ()> = DiGraph::with_capacity(nodes.len(), nodes.len());
        let ix: Vec<NodeIndex> = (0..nodes.len()).map(|i| dag.add_node(i)).collect();

        for chain in chains.values() {
            for pair in chain.windows(2) {
                dag.add_edge(ix[pair[0]], ix[pair[1]], ());
            }
        }

        // Same-phase edges between apps: starts after dependencies' starts,
        // stops after dependents' stops. These alone never form a cycle.
        for (i, node) in nodes.iter().enumerate() {
            let upstream = match node.phase {
                Phase::Resolve => continue,
                Phase::Start => graph.dependencies_of(&node.app_id),
                Phase::Drain | Phase::Retire => graph.dependents_of(&node.app_id),
            };
            for other in &upstream {
                for &j in chain_of(other) {
                    if nodes[j].phase == node.phase {
                        dag.add_edge(ix[j], ix[i], ());
                    }
                }
            }
        }

        // A dependency's stops also wait for its dependents' stops of the
        // other phase, unless the app chains already force the reverse.
        for (i, node) in nodes.iter().enumerate() {
            if !node.phase.is_stop() {
                continue;
            }
            for dependent in graph.dependents_of(&node.app_id) {
                for &j in chain_of(&dependent) {
                    let other = &nodes[j];
                    if other.phase.is_stop()
                        && other.phase != node.phase
                        && !has_path_connecting(&dag, ix[i], ix[j], None)
                    {
                        dag.add_edge(ix[j], ix[i], ());
                    }
                }
            }
        }

        let sorted = toposort(&dag, None).map_err(|cycle| PlanError::CyclicDependency {
            cycle: vec![nodes[dag[cycle.node_id()]].app_id.clone()],
        })?;
        let mut levels = vec![0usize; nodes.len()];
        for n in sorted {
            let level = dag
                .neighbors_directed(n, Direction::Incoming)
                .map(|p| levels[dag[p]] + 1)
                .max()
                .unwrap_or(0);
            levels[dag[n]] = level;
        }

        let mut levelled: Vec<(usize, Node)> = levels.into_iter().zip(nodes).collect();
        levelled.sort_by(|(la, a), (lb, b)| {
            (la, &a.app_id, a.chain_index).cmp(&(lb, &b.app_id, b.chain_index))
        });

        let mut steps: Vec<DeploymentStep> = Vec::new();
        for (level, node) in levelled {
            if steps.len() <= level {
                steps.resize_with(level + 1, DeploymentStep::default);
            }
            steps[level].actions.push(node.action);
        }

        let plan = Self {
            steps,
            affected_apps: governing.keys().map(|id| (*id).clone()).collect(),
        };
        debug!(
            steps = plan.steps.len(),
            actions = plan.action_count(),
            apps = plan.affected_apps.len(),
            "deployment plan built"
        );
        Ok(plan)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn action_count(&self) -> usize {
        self.steps.iter().map(|s| s.actions.len()).sum()
    }

    /// Index of the step holding the first action matching `pred`.
    pub fn step_of(&self, pred: impl Fn(&DeploymentAction) -> bool) -> Option<usize> {
        self.steps
            .iter()
            .position(|step| step.actions.iter().any(&pred))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(path: &str) -> AppId {
        AppId::new(path).unwrap()
    }

    fn app(path: &str, version: &str, instances: u32, deps: &[&str]) -> AppSpec {
        deps.iter().fold(AppSpec::new(id(path), version, instances), |spec, dep| {
            spec.with_dependency(id(dep))
        })
    }

    fn starts(plan: &DeploymentPlan, path: &str) -> Option<usize> {
        plan.step_of(|a| {
            matches!(a, DeploymentAction::StartApplication { app, .. } if app.id == id(path))
        })
    }

    fn stops(plan: &DeploymentPlan, path: &str) -> Option<usize> {
        plan.step_of(|a| {
            matches!(a, DeploymentAction::StopApplication { app } if app.id == id(path))
        })
    }

    #[test]
    fn create_follows_dependencies() {
        let transition = Transition::new()
            .with(AppTransition::create(app("/web", "v1", 2, &["/api"])))
            .with(AppTransition::create(app("/api", "v1", 2, &["/db"])))
            .with(AppTransition::create(app("/db", "v1", 1, &[])))
            .with(AppTransition::create(app("/metrics", "v1", 1, &[])));
        let plan = DeploymentPlan::build(&transition).unwrap();

        assert_eq!(plan.steps.len(), 3);
        assert_eq!(starts(&plan, "/db"), Some(0));
        assert_eq!(starts(&plan, "/metrics"), Some(0));
        assert_eq!(starts(&plan, "/api"), Some(1));
        assert_eq!(starts(&plan, "/web"), Some(2));
        assert_eq!(plan.affected_apps.len(), 4);
    }

    #[test]
    fn destroy_runs_dependents_first() {
        let transition = Transition::new()
            .with(AppTransition::destroy(app("/db", "v1", 1, &[])))
            .with(AppTransition::destroy(app("/web", "v1", 2, &["/api"])))
            .with(AppTransition::destroy(app("/api", "v1", 2, &["/db"])));
        let plan = DeploymentPlan::build(&transition).unwrap();

        assert_eq!(stops(&plan, "/web"), Some(0));
        assert_eq!(stops(&plan, "/api"), Some(1));
        assert_eq!(stops(&plan, "/db"), Some(2));
    }

    #[test]
    fn artifacts_resolve_before_start() {
        let to = app("/web", "v1", 2, &[]).with_artifact("https://artifacts.local/web.tgz");
        let plan = DeploymentPlan::build(&Transition::new().with(AppTransition::create(to))).unwrap();

        assert_eq!(plan.steps.len(), 2);
        assert!(matches!(
            plan.steps[0].actions[0],
            DeploymentAction::ResolveArtifacts { .. }
        ));
        assert_eq!(starts(&plan, "/web"), Some(1));
    }

    #[test]
    fn scaling_is_classified_by_direction() {
        let up = DeploymentPlan::build(&Transition::new().with(AppTransition::update(
            app("/web", "v1", 2, &[]),
            app("/web", "v1", 5, &[]),
        )))
        .unwrap();
        assert_eq!(up.action_count(), 1);
        assert!(matches!(
            &up.steps[0].actions[0],
            DeploymentAction::ScaleApplication { scale_to: 5, .. }
        ));

        let unchanged = DeploymentPlan::build(&Transition::new().with(AppTransition::update(
            app("/web", "v1", 2, &[]),
            app("/web", "v1", 2, &[]),
        )))
        .unwrap();
        assert!(unchanged.is_empty());
        assert_eq!(unchanged.affected_apps.len(), 1);
    }

    #[test]
    fn scale_down_precedes_dependency_scale_down() {
        let transition = Transition::new()
            .with(AppTransition::update(app("/api", "v1", 4, &[]), app("/api", "v1", 2, &[])))
            .with(AppTransition::update(
                app("/web", "v1", 4, &["/api"]),
                app("/web", "v1", 1, &["/api"]),
            ));
        let plan = DeploymentPlan::build(&transition).unwrap();
        let scale = |path: &str| {
            plan.step_of(|a| matches!(a, DeploymentAction::ScaleApplication { app, .. } if app.id == id(path)))
        };
        assert_eq!(scale("/web"), Some(0));
        assert_eq!(scale("/api"), Some(1));
    }

    #[test]
    fn rolling_upgrade_of_a_single_app() {
        let from = app("/web", "v1", 10, &[]);
        let to = app("/web", "v2", 10, &[]).with_minimum_health_capacity(0.6);
        let plan = DeploymentPlan::build(&Transition::new().with(AppTransition::update(
            from.clone(),
            to.clone(),
        )))
        .unwrap();

        let actions: Vec<_> = plan.steps.iter().flat_map(|s| s.actions.clone()).collect();
        assert_eq!(plan.steps.len(), 4);
        assert_eq!(
            actions,
            vec![
                DeploymentAction::ScaleApplication { app: from, scale_to: 6 },
                DeploymentAction::StartApplication { app: to.clone(), scale_to: 6 },
                DeploymentAction::ScaleApplication { app: to.clone(), scale_to: 10 },
                DeploymentAction::KillAllOldTasksOf { app: to },
            ]
        );
    }

    #[test]
    fn upgrade_of_dependent_apps_keeps_both_orders() {
        let transition = Transition::new()
            .with(AppTransition::update(
                app("/web", "v1", 2, &["/api"]),
                app("/web", "v2", 2, &["/api"]),
            ))
            .with(AppTransition::update(
                app("/api", "v1", 2, &[]),
                app("/api", "v2", 2, &[]),
            ));
        let plan = DeploymentPlan::build(&transition).unwrap();

        assert!(starts(&plan, "/api") < starts(&plan, "/web"));
        assert!(stops(&plan, "/web") < stops(&plan, "/api"));
        assert!(starts(&plan, "/web") < stops(&plan, "/web"));
    }

    #[test]
    fn mixed_capacity_upgrade_stays_acyclic() {
        let transition = Transition::new()
            .with(AppTransition::update(
                app("/web", "v1", 4, &["/api"]),
                app("/web", "v2", 4, &["/api"]).with_minimum_health_capacity(0.0),
            ))
            .with(AppTransition::update(
                app("/api", "v1", 4, &[]),
                app("/api", "v2", 4, &[]).with_minimum_health_capacity(0.5),
            ));
        let plan = DeploymentPlan::build(&transition).unwrap();

        let drain_api = plan
            .step_of(|a| matches!(a, DeploymentAction::ScaleApplication { app, scale_to: 2 } if app.id == id("/api")))
            .unwrap();
        let stop_web = stops(&plan, "/web").unwrap();
        let start_api = starts(&plan, "/api").unwrap();
        let start_web = starts(&plan, "/web").unwrap();
        assert!(stop_web < drain_api);
        assert!(drain_api < start_api);
        assert!(start_api < start_web);
        assert_eq!(plan.action_count(), 6);
    }

    #[test]
    fn dependency_scale_down_waits_for_dependent_retire() {
        let transition = Transition::new()
            .with(AppTransition::update(app("/api", "v1", 4, &[]), app("/api", "v1", 2, &[])))
            .with(AppTransition::update(
                app("/web", "v1", 2, &["/api"]),
                app("/web", "v2", 2, &["/api"]),
            ));
        let plan = DeploymentPlan::build(&transition).unwrap();

        let scale_api = plan
            .step_of(|a| matches!(a, DeploymentAction::ScaleApplication { app, .. } if app.id == id("/api")))
            .unwrap();
        let stop_web = stops(&plan, "/web").unwrap();
        assert_eq!(starts(&plan, "/web"), Some(0));
        assert_eq!(stop_web, 1);
        assert_eq!(scale_api, 2);
    }

    #[test]
    fn cross_phase_stop_order_yields_to_start_order() {
        // /db drains before it starts, so /web's retire cannot precede the
        // /api scale-down without looping through /db's start.
        let transition = Transition::new()
            .with(AppTransition::update(
                app("/db", "v1", 4, &[]),
                app("/db", "v2", 4, &[]).with_minimum_health_capacity(0.5),
            ))
            .with(AppTransition::update(
                app("/api", "v1", 4, &["/db"]),
                app("/api", "v1", 2, &["/db"]),
            ))
            .with(AppTransition::update(
                app("/web", "v1", 2, &["/api", "/db"]),
                app("/web", "v2", 2, &["/api", "/db"]),
            ));
        let plan = DeploymentPlan::build(&transition).unwrap();

        let scale = |path: &str, to: u32| {
            plan.step_of(|a| {
                matches!(a, DeploymentAction::ScaleApplication { app, scale_to } if app.id == id(path) && *scale_to == to)
            })
            .unwrap()
        };
        let drain_db = scale("/db", 2);
        let start_db = starts(&plan, "/db").unwrap();
        let start_web = starts(&plan, "/web").unwrap();
        let stop_web = stops(&plan, "/web").unwrap();
        assert!(scale("/api", 2) < drain_db);
        assert!(drain_db < start_db);
        assert!(start_db < start_web);
        assert!(start_web < stop_web);
        assert_eq!(plan.action_count(), 7);
    }

    #[test]
    fn restart_is_one_action() {
        let from = app("/web", "v1", 3, &[]);
        let to = app("/web", "v2", 3, &[]);
        let plan =
            DeploymentPlan::build(&Transition::new().with(AppTransition::restart(from, to))).unwrap();
        assert_eq!(plan.action_count(), 1);
        assert_eq!(plan.steps[0].actions[0].kind(), "restart_application");
    }

    #[test]
    fn restart_requires_a_new_version() {
        let spec = app("/web", "v1", 3, &[]);
        let err = DeploymentPlan::build(
            &Transition::new().with(AppTransition::restart(spec.clone(), spec)),
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::InvalidTransition(_)));
    }

    #[test]
    fn cycle_fails_without_a_plan() {
        let transition = Transition::new()
            .with(AppTransition::create(app("/a", "v1", 1, &["/b"])))
            .with(AppTransition::create(app("/b", "v1", 1, &["/a"])));
        assert_eq!(
            DeploymentPlan::build(&transition),
            Err(PlanError::CyclicDependency { cycle: vec![id("/a"), id("/b")] })
        );
    }

    #[test]
    fn duplicate_and_mismatched_entries_are_rejected() {
        let duplicate = Transition::new()
            .with(AppTransition::create(app("/a", "v1", 1, &[])))
            .with(AppTransition::create(app("/a", "v2", 1, &[])));
        assert!(matches!(
            DeploymentPlan::build(&duplicate),
            Err(PlanError::InvalidTransition(_))
        ));

        let mismatched = Transition::new().with(AppTransition::update(
            app("/a", "v1", 1, &[]),
            app("/b", "v1", 1, &[]),
        ));
        assert!(matches!(
            DeploymentPlan::build(&mismatched),
            Err(PlanError::InvalidTransition(_))
        ));

        let empty = Transition::new().with(AppTransition { from: None, to: None, restart: false });
        assert!(matches!(
            DeploymentPlan::build(&empty),
            Err(PlanError::InvalidTransition(_))
        ));
    }

    #[test]
    fn out_of_range_capacity_is_rejected() {
        let to = app("/a", "v2", 1, &[]).with_minimum_health_capacity(1.5);
        let err = DeploymentPlan::build(
            &Transition::new().with(AppTransition::update(app("/a", "v1", 1, &[]), to)),
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::InvalidSpec(_)));
    }

    #[test]
    fn transition_parses_from_toml() {
        let transition: Transition = toml::from_str(
            r#"
            [[apps]]
            [apps.to]
            id = "/web"
            version = "v2"
            instances = 3
            dependencies = ["/api"]

            [[apps]]
            restart = false
            [apps.from]
            id = "/old"
            version = "v1"
            instances = 1
            "#,
        )
        .unwrap();
        assert_eq!(transition.apps.len(), 2);
        assert!(transition.apps[0].from.is_none());
        assert!(transition.apps[1].to.is_none());

        let plan = DeploymentPlan::build(&transition).unwrap();
        assert_eq!(plan.action_count(), 2);
        assert_eq!(starts(&plan, "/web"), Some(0));
        assert_eq!(stops(&plan, "/old"), Some(0));
    }
}
