//! Dependency graph resolution.
//!
//! Steps reference each other by name; the execer resolves names to a
//! graph of indices so no cyclic references exist in memory. Validation
//! rejects unknown vertices and cycles before anything is dispatched.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

use hodei_runner_core::spec::Step;
use hodei_runner_core::DomainError;

/// Resolved dependency graph over step indices.
#[derive(Debug)]
pub struct Dag {
    graph: DiGraph<usize, ()>,
    nodes: Vec<NodeIndex>,
}

impl Dag {
    /// Builds and validates the graph from the compiled steps.
    pub fn build(steps: &[Step]) -> Result<Self, DomainError> {
        let mut graph = DiGraph::new();
        let mut nodes = Vec::with_capacity(steps.len());
        let mut by_name: HashMap<&str, NodeIndex> = HashMap::new();

        for (index, step) in steps.iter().enumerate() {
            let node = graph.add_node(index);
            nodes.push(node);
            by_name.insert(step.name.as_str(), node);
        }

        for (index, step) in steps.iter().enumerate() {
            for dep in &step.depends_on {
                let dep_node = by_name.get(dep.as_str()).ok_or_else(|| {
                    DomainError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                graph.add_edge(*dep_node, nodes[index], ());
            }
        }

        if toposort(&graph, None).is_err() {
            return Err(DomainError::DependencyCycle);
        }

        Ok(Self { graph, nodes })
    }

    /// Indices of the steps the given step depends on.
    pub fn predecessors(&self, index: usize) -> Vec<usize> {
        self.graph
            .neighbors_directed(self.nodes[index], petgraph::Direction::Incoming)
            .map(|n| self.graph[n])
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, deps: &[&str]) -> Step {
        Step {
            name: name.to_string(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_linear_graph() {
        let dag = Dag::build(&[step("a", &[]), step("b", &["a"]), step("c", &["b"])]).unwrap();
        assert_eq!(dag.predecessors(0), Vec::<usize>::new());
        assert_eq!(dag.predecessors(1), vec![0]);
        assert_eq!(dag.predecessors(2), vec![1]);
    }

    #[test]
    fn test_diamond_graph() {
        let dag = Dag::build(&[
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ])
        .unwrap();
        let mut preds = dag.predecessors(3);
        preds.sort();
        assert_eq!(preds, vec![1, 2]);
    }

    #[test]
    fn test_unknown_vertex() {
        let err = Dag::build(&[step("a", &["ghost"])]).unwrap_err();
        assert!(matches!(err, DomainError::UnknownDependency { .. }));
    }

    #[test]
    fn test_cycle_detected() {
        let err = Dag::build(&[step("a", &["b"]), step("b", &["a"])]).unwrap_err();
        assert!(matches!(err, DomainError::DependencyCycle));
    }
}
