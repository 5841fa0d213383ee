//! Step dependency graph.
//!
//! Validates a workflow's step list and yields a topological order in which
//! every step comes after all of its dependencies.

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use super::types::WorkflowStep;
use crate::error::OrchestrationError;

/// Errors raised while building a step graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// The workflow has no steps.
    #[error("workflow has no steps")]
    Empty,

    /// Two steps share an ID.
    #[error("duplicate step id: {0}")]
    DuplicateStep(String),

    /// A step depends on a step that does not exist.
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        /// Dependent step.
        step: String,
        /// Missing dependency.
        dependency: String,
    },

    /// The dependencies form a cycle.
    #[error("circular dependency detected: {0}")]
    CycleDetected(String),
}

impl From<GraphError> for OrchestrationError {
    fn from(err: GraphError) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Dependency graph over workflow steps.
///
/// Edges point from a dependency to its dependent.
#[derive(Debug, Clone)]
pub struct StepGraph {
    graph: DiGraph<String, ()>,
    node_map: HashMap<String, NodeIndex>,
    order: Vec<String>,
}

impl StepGraph {
    /// Builds and validates the graph for `steps`.
    ///
    /// # Errors
    /// Returns an error for an empty step list, duplicate IDs, unknown
    /// dependencies, or a cycle.
    pub fn build(steps: &[WorkflowStep]) -> Result<Self, GraphError> {
        if steps.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut graph = DiGraph::new();
        let mut node_map = HashMap::new();
        for step in steps {
            if node_map.contains_key(&step.id) {
                return Err(GraphError::DuplicateStep(step.id.clone()));
            }
            let node = graph.add_node(step.id.clone());
            node_map.insert(step.id.clone(), node);
        }

        for step in steps {
            let to = node_map[&step.id];
            for dependency in &step.dependencies {
                let from = node_map.get(dependency).ok_or_else(|| GraphError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dependency.clone(),
                })?;
                graph.add_edge(*from, to, ());
            }
        }

        if is_cyclic_directed(&graph) {
            return Err(GraphError::CycleDetected(find_cycle(&graph)));
        }

        // Ties keep declaration order so dispatch is predictable.
        let order = stable_topological_order(&graph, steps.len())
            .ok_or_else(|| GraphError::CycleDetected(find_cycle(&graph)))?;

        Ok(Self { graph, node_map, order })
    }

    /// Step IDs with every dependency before its dependents.
    #[must_use]
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Direct dependents of `step_id`.
    #[must_use]
    pub fn dependents(&self, step_id: &str) -> Vec<String> {
        self.node_map
            .get(step_id)
            .map(|node| {
                let mut ids: Vec<String> = self
                    .graph
                    .neighbors_directed(*node, Direction::Outgoing)
                    .map(|n| self.graph[n].clone())
                    .collect();
                ids.sort();
                ids
            })
            .unwrap_or_default()
    }

    /// Every step reachable from `step_id` through dependent edges.
    #[must_use]
    pub fn transitive_dependents(&self, step_id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let Some(start) = self.node_map.get(step_id) else {
            return seen;
        };
        let mut stack = vec![*start];
        while let Some(node) = stack.pop() {
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if seen.insert(self.graph[next].clone()) {
                    stack.push(next);
                }
            }
        }
        seen
    }
}

/// Kahn's algorithm, always taking the earliest-declared ready step.
fn stable_topological_order(graph: &DiGraph<String, ()>, len: usize) -> Option<Vec<String>> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut ready: Vec<NodeIndex> =
        graph.node_indices().filter(|n| in_degree[n.index()] == 0).collect();
    let mut order = Vec::with_capacity(len);

    while !ready.is_empty() {
        ready.sort_by_key(|n| std::cmp::Reverse(n.index()));
        let node = ready.pop()?;
        order.push(graph[node].clone());
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            in_degree[next.index()] -= 1;
            if in_degree[next.index()] == 0 {
                ready.push(next);
            }
        }
    }

    (order.len() == len).then_some(order)
}

/// Renders one cycle as `a -> b -> a` for error messages.
fn find_cycle(graph: &DiGraph<String, ()>) -> String {
    fn visit(
        graph: &DiGraph<String, ()>,
        node: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
        visited.insert(node);
        stack.push(node);
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            if let Some(pos) = stack.iter().position(|n| *n == next) {
                let mut cycle = stack[pos..].to_vec();
                cycle.push(next);
                return Some(cycle);
            }
            if !visited.contains(&next) {
                if let Some(cycle) = visit(graph, next, visited, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        None
    }

    let mut visited = HashSet::new();
    for node in graph.node_indices() {
        if visited.contains(&node) {
            continue;
        }
        if let Some(cycle) = visit(graph, node, &mut visited, &mut Vec::new()) {
            return cycle.iter().map(|n| graph[*n].as_str()).collect::<Vec<_>>().join(" -> ");
        }
    }
    "unknown cycle".to_string()
}
