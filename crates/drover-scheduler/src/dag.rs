//! Pipeline dependency graph resolution.
//!
//! Pipelines name their upstream pipelines; the resolver validates that
//! every referenced pipeline exists and that no pipeline transitively
//! depends on itself, and produces a dependency-first build order.

use drover_core::PipelineName;
use drover_core::pipeline::PipelineConfig;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    /// Cycle rendered from the point of detection back to where it started.
    #[error("Circular dependency: {}", render_cycle(.0))]
    CircularDependency(Vec<PipelineName>),
    #[error("Pipeline \"{missing}\" does not exist. It is used from pipeline \"{referrer}\".")]
    MissingDependency {
        missing: PipelineName,
        referrer: PipelineName,
    },
    #[error("Pipeline \"{0}\" does not exist.")]
    UnknownPipeline(PipelineName),
}

fn render_cycle(path: &[PipelineName]) -> String {
    path.iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(" <- ")
}

impl From<DagError> for drover_core::Error {
    fn from(err: DagError) -> Self {
        drover_core::Error::InvalidConfig(err.to_string())
    }
}

/// A pipeline and the pipelines it depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineNode {
    pub name: PipelineName,
    pub upstream: Vec<PipelineName>,
}

impl PipelineNode {
    pub fn new(name: impl Into<PipelineName>) -> Self {
        Self {
            name: name.into(),
            upstream: vec![],
        }
    }

    pub fn depends_on(mut self, upstream: impl Into<PipelineName>) -> Self {
        let upstream = upstream.into();
        if !self.upstream.contains(&upstream) {
            self.upstream.push(upstream);
        }
        self
    }
}

/// Snapshot of pipeline dependencies, keyed case-insensitively.
///
/// The graph is never validated on insertion; callers resolve it before
/// relying on it.
#[derive(Debug, Clone, Default)]
pub struct PipelineGraph {
    nodes: HashMap<PipelineName, PipelineNode>,
}

impl PipelineGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs<'a>(configs: impl IntoIterator<Item = &'a PipelineConfig>) -> Self {
        let mut graph = Self::new();
        for config in configs {
            let node = config
                .upstream
                .iter()
                .fold(PipelineNode::new(config.name.clone()), |node, up| {
                    node.depends_on(up.clone())
                });
            graph.insert(node);
        }
        graph
    }

    /// Insert or replace a node.
    pub fn insert(&mut self, node: PipelineNode) {
        self.nodes.insert(node.name.clone(), node);
    }

    pub fn get(&self, name: &PipelineName) -> Option<&PipelineNode> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &PipelineName) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Names in a stable, case-insensitive alphabetical order.
    pub fn names(&self) -> Vec<PipelineName> {
        let mut names: Vec<_> = self.nodes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve `start` and everything it transitively depends on, in
    /// dependency-first order. `start` is always last.
    pub fn resolve(&self, start: &PipelineName) -> Result<Vec<PipelineName>, DagError> {
        let mut walk = Walk::default();
        self.visit(start, None, &mut walk)?;
        Ok(walk.order)
    }

    /// Resolve every pipeline, failing on the first invalid one.
    pub fn validate(&self) -> Result<(), DagError> {
        let mut walk = Walk::default();
        for name in self.names() {
            self.visit(&name, None, &mut walk)?;
        }
        Ok(())
    }

    fn visit(
        &self,
        name: &PipelineName,
        referrer: Option<&PipelineName>,
        walk: &mut Walk,
    ) -> Result<(), DagError> {
        if walk.done.contains(name) {
            return Ok(());
        }

        if let Some(pos) = walk.path.iter().position(|p| p == name) {
            let mut cycle = vec![walk.path[pos].clone()];
            cycle.extend(walk.path[pos..].iter().rev().cloned());
            return Err(DagError::CircularDependency(cycle));
        }

        let node = match (self.nodes.get(name), referrer) {
            (Some(node), _) => node,
            (None, Some(referrer)) => {
                return Err(DagError::MissingDependency {
                    missing: name.clone(),
                    referrer: referrer.clone(),
                });
            }
            (None, None) => return Err(DagError::UnknownPipeline(name.clone())),
        };

        walk.path.push(node.name.clone());
        for upstream in &node.upstream {
            self.visit(upstream, Some(&node.name), walk)?;
        }
        walk.path.pop();

        walk.done.insert(node.name.clone());
        walk.order.push(node.name.clone());
        Ok(())
    }

    /// Every pipeline in dependency-first order.
    pub fn build_order(&self) -> Result<Vec<PipelineName>, DagError> {
        self.validate()?;

        let mut graph = DiGraph::<PipelineName, ()>::new();
        let mut index: HashMap<PipelineName, NodeIndex> = HashMap::new();

        for name in self.names() {
            let idx = graph.add_node(name.clone());
            index.insert(name, idx);
        }

        for node in self.nodes.values() {
            let to = index[&node.name];
            for upstream in &node.upstream {
                graph.add_edge(index[upstream], to, ());
            }
        }

        toposort(&graph, None)
            .map(|indices| indices.into_iter().map(|idx| graph[idx].clone()).collect())
            .map_err(|cycle| {
                let name = graph[cycle.node_id()].clone();
                DagError::CircularDependency(vec![name.clone(), name])
            })
    }

    /// Pipelines that directly depend on `name`, in build order.
    pub fn downstream(&self, name: &PipelineName) -> Result<Vec<PipelineName>, DagError> {
        Ok(self
            .build_order()?
            .into_iter()
            .filter(|candidate| {
                self.nodes
                    .get(candidate)
                    .is_some_and(|node| node.upstream.contains(name))
            })
            .collect())
    }

    /// Direct upstream pipelines of `name`.
    pub fn upstream(&self, name: &PipelineName) -> Vec<PipelineName> {
        self.nodes
            .get(name)
            .map(|node| node.upstream.clone())
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct Walk {
    path: Vec<PipelineName>,
    done: HashSet<PipelineName>,
    order: Vec<PipelineName>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn graph(edges: &[(&str, &[&str])]) -> PipelineGraph {
        let mut graph = PipelineGraph::new();
        for (name, deps) in edges {
            let node = deps
                .iter()
                .fold(PipelineNode::new(*name), |node, dep| node.depends_on(*dep));
            graph.insert(node);
        }
        graph
    }

    fn names(order: &[PipelineName]) -> Vec<&str> {
        order.iter().map(|p| p.as_str()).collect()
    }

    #[test]
    fn test_linear_chain() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]);
        let order = g.resolve(&"a".into()).unwrap();
        assert_eq!(names(&order), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_diamond_visits_shared_dependency_once() {
        let g = graph(&[
            ("deploy", &["api", "web"]),
            ("api", &["lib"]),
            ("web", &["lib"]),
            ("lib", &[]),
        ]);
        let order = g.resolve(&"deploy".into()).unwrap();
        assert_eq!(names(&order), vec!["lib", "api", "web", "deploy"]);
    }

    #[test]
    fn test_cycle_message() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        let err = g.resolve(&"a".into()).unwrap_err();
        assert_eq!(err.to_string(), "Circular dependency: a <- c <- b <- a");
    }

    #[test]
    fn test_self_dependency() {
        let g = graph(&[("pipeline1", &["pipeline1"])]);
        let err = g.resolve(&"pipeline1".into()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Circular dependency: pipeline1 <- pipeline1"
        );
    }

    #[test]
    fn test_cycle_not_through_start() {
        let g = graph(&[("x", &["a"]), ("a", &["b"]), ("b", &["a"])]);
        let err = g.resolve(&"x".into()).unwrap_err();
        assert_eq!(err.to_string(), "Circular dependency: a <- b <- a");
    }

    #[test]
    fn test_missing_dependency_message() {
        let g = graph(&[("a", &["b"]), ("b", &["z"])]);
        let err = g.resolve(&"a".into()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Pipeline \"z\" does not exist. It is used from pipeline \"b\"."
        );
    }

    #[test]
    fn test_unknown_start() {
        let g = graph(&[("a", &[])]);
        assert_eq!(
            g.resolve(&"nope".into()).unwrap_err(),
            DagError::UnknownPipeline("nope".into())
        );
    }

    #[test]
    fn test_names_are_case_insensitive() {
        let g = graph(&[("Deploy", &["BUILD"]), ("build", &[])]);
        let order = g.resolve(&"deploy".into()).unwrap();
        assert_eq!(names(&order), vec!["build", "Deploy"]);
    }

    #[test]
    fn test_downstream_in_build_order() {
        let g = graph(&[
            ("lib", &[]),
            ("web", &["lib", "api"]),
            ("api", &["lib"]),
            ("docs", &[]),
        ]);
        let downstream = g.downstream(&"lib".into()).unwrap();
        assert_eq!(names(&downstream), vec!["api", "web"]);
    }

    #[test]
    fn test_validate_rejects_any_cycle() {
        let g = graph(&[("ok", &[]), ("p", &["q"]), ("q", &["p"])]);
        assert!(matches!(
            g.validate(),
            Err(DagError::CircularDependency(_))
        ));
        assert!(g.build_order().is_err());
    }

    #[test]
    fn test_converts_into_core_error() {
        let err: drover_core::Error = DagError::UnknownPipeline("a".into()).into();
        assert!(matches!(err, drover_core::Error::InvalidConfig(_)));
    }

    /// Random DAG where node `i` may only depend on nodes `j < i`.
    fn arb_dag() -> impl Strategy<Value = PipelineGraph> {
        (1usize..24).prop_flat_map(|n| {
            proptest::collection::vec(proptest::collection::vec(any::<prop::sample::Index>(), 0..4), n)
                .prop_map(move |deps| {
                    let mut g = PipelineGraph::new();
                    for (i, picks) in deps.iter().enumerate() {
                        let mut node = PipelineNode::new(format!("p{}", i).as_str());
                        if i > 0 {
                            for pick in picks {
                                let j = pick.index(i);
                                node = node.depends_on(format!("p{}", j).as_str());
                            }
                        }
                        g.insert(node);
                    }
                    g
                })
        })
    }

    fn assert_dependencies_first(g: &PipelineGraph, order: &[PipelineName]) {
        let position: HashMap<&PipelineName, usize> =
            order.iter().enumerate().map(|(i, p)| (p, i)).collect();
        for name in order {
            for up in g.upstream(name) {
                assert!(position[&up] < position[name], "{} must precede {}", up, name);
            }
        }
    }

    proptest! {
        #[test]
        fn prop_resolve_orders_dependencies_first(g in arb_dag()) {
            for name in g.names() {
                let order = g.resolve(&name).unwrap();
                prop_assert_eq!(order.last(), Some(&name));
                assert_dependencies_first(&g, &order);
            }
        }

        #[test]
        fn prop_build_order_covers_every_pipeline(g in arb_dag()) {
            let order = g.build_order().unwrap();
            prop_assert_eq!(order.len(), g.len());
            assert_dependencies_first(&g, &order);
        }
    }
}
