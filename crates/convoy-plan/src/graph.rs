//! Dependency graph over the applications touched by a transition.
//!
//! Edges point from a dependency to its dependent, so a topological order
//! settles dependencies first. Dependencies on applications outside the
//! transition are already settled and do not constrain the order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use convoy_core::{AppId, AppSpec};

use crate::error::{PlanError, PlanResult};

/// Which way to walk the graph for an action kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traversal {
    /// Starts and scale-ups: a dependency before its dependents.
    DependenciesFirst,
    /// Stops and scale-downs: a dependent before its dependencies.
    DependentsFirst,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<AppId, ()>,
    index: HashMap<AppId, NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph from the declared dependencies of `specs`.
    pub fn from_specs<'a>(specs: impl IntoIterator<Item = &'a AppSpec>) -> Self {
        let specs: BTreeMap<&AppId, &AppSpec> = specs.into_iter().map(|s| (&s.id, s)).collect();

        let mut graph = DiGraph::new();
        let mut index = HashMap::with_capacity(specs.len());
        for id in specs.keys() {
            index.insert((*id).clone(), graph.add_node((*id).clone()));
        }
        for (id, spec) in &specs {
            let dependent = index[*id];
            for dependency in &spec.dependencies {
                if let Some(&upstream) = index.get(dependency) {
                    graph.add_edge(upstream, dependent, ());
                }
            }
        }
        Self { graph, index }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, app_id: &AppId) -> bool {
        self.index.contains_key(app_id)
    }

    /// Dependencies first. Kahn's algorithm with ties broken by app id, so
    /// the order is deterministic.
    ///
    /// # Errors
    ///
    /// `CyclicDependency` naming the members of one cycle.
    pub fn topological_order(&self) -> PlanResult<Vec<AppId>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.graph.neighbors_directed(n, Direction::Incoming).count()))
            .collect();

        let mut ready: BTreeSet<(AppId, NodeIndex)> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(&n, _)| (self.graph[n].clone(), n))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some((app_id, node)) = ready.pop_first() {
            order.push(app_id);
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert((self.graph[next].clone(), next));
                    }
                }
            }
        }

        if order.len() < self.graph.node_count() {
            return Err(PlanError::CyclicDependency {
                cycle: self.find_cycle(),
            });
        }
        Ok(order)
    }

    /// The order in which to process applications for a traversal.
    pub fn order_for(&self, traversal: Traversal) -> PlanResult<Vec<AppId>> {
        let mut order = self.topological_order()?;
        if traversal == Traversal::DependentsFirst {
            order.reverse();
        }
        Ok(order)
    }

    /// Direct dependencies of `app_id` within the graph.
    pub fn dependencies_of(&self, app_id: &AppId) -> Vec<AppId> {
        self.neighbors(app_id, Direction::Incoming)
    }

    /// Direct dependents of `app_id` within the graph.
    pub fn dependents_of(&self, app_id: &AppId) -> Vec<AppId> {
        self.neighbors(app_id, Direction::Outgoing)
    }

    fn neighbors(&self, app_id: &AppId, direction: Direction) -> Vec<AppId> {
        let Some(&node) = self.index.get(app_id) else {
            return Vec::new();
        };
        let mut ids: Vec<AppId> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Members of the first strongly connected component that forms a cycle.
    fn find_cycle(&self) -> Vec<AppId> {
        for component in tarjan_scc(&self.graph) {
            let cyclic = component.len() > 1
                || component
                    .first()
                    .is_some_and(|&n| self.graph.contains_edge(n, n));
            if cyclic {
                let mut ids: Vec<AppId> = component.iter().map(|&n| self.graph[n].clone()).collect();
                ids.sort();
                return ids;
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(path: &str) -> AppId {
        AppId::new(path).unwrap()
    }

    fn app(path: &str, deps: &[&str]) -> AppSpec {
        deps.iter()
            .fold(AppSpec::new(id(path), "v1", 1), |spec, dep| spec.with_dependency(id(dep)))
    }

    #[test]
    fn dependencies_come_first() {
        let specs = [
            app("/web", &["/api"]),
            app("/api", &["/db", "/cache"]),
            app("/db", &[]),
            app("/cache", &[]),
        ];
        let graph = DependencyGraph::from_specs(&specs);

        let order = graph.topological_order().unwrap();
        assert_eq!(order, vec![id("/cache"), id("/db"), id("/api"), id("/web")]);

        let reverse = graph.order_for(Traversal::DependentsFirst).unwrap();
        assert_eq!(reverse.first(), Some(&id("/web")));
        assert_eq!(reverse.last(), Some(&id("/cache")));
    }

    #[test]
    fn outside_dependencies_are_ignored() {
        let specs = [app("/web", &["/external"])];
        let graph = DependencyGraph::from_specs(&specs);
        assert_eq!(graph.len(), 1);
        assert!(!graph.contains(&id("/external")));
        assert_eq!(graph.topological_order().unwrap(), vec![id("/web")]);
    }

    #[test]
    fn neighbours() {
        let specs = [app("/web", &["/api"]), app("/worker", &["/api"]), app("/api", &[])];
        let graph = DependencyGraph::from_specs(&specs);
        assert_eq!(graph.dependents_of(&id("/api")), vec![id("/web"), id("/worker")]);
        assert_eq!(graph.dependencies_of(&id("/web")), vec![id("/api")]);
        assert!(graph.dependencies_of(&id("/missing")).is_empty());
    }

    #[test]
    fn cycle_is_reported() {
        let specs = [
            app("/a", &["/b"]),
            app("/b", &["/c"]),
            app("/c", &["/a"]),
            app("/d", &[]),
        ];
        let graph = DependencyGraph::from_specs(&specs);
        let err = graph.topological_order().unwrap_err();
        assert_eq!(
            err,
            PlanError::CyclicDependency {
                cycle: vec![id("/a"), id("/b"), id("/c")]
            }
        );
        assert!(err.to_string().contains("/a -> /b -> /c"));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let specs = [app("/a", &["/a"])];
        let graph = DependencyGraph::from_specs(&specs);
        assert!(matches!(
            graph.topological_order(),
            Err(PlanError::CyclicDependency { cycle }) if cycle == vec![id("/a")]
        ));
    }

    #[test]
    fn empty_graph() {
        let graph = DependencyGraph::default();
        assert!(graph.is_empty());
        assert!(graph.topological_order().unwrap().is_empty());
    }
}
