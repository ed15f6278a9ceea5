// src/dag/graph.rs

//! Dependency graph over concrete test cases.
//!
//! Nodes are test cases (node index == [`TestCaseId`]), edges point from a
//! dependency to its dependent. The graph is validated to be acyclic when it
//! is built and afterwards only tracks, per node, how many dependencies have
//! not yet passed. [`DependencyGraph::resolve`] decrements those counters for
//! the direct dependents of a passed test case, so the total bookkeeping over
//! a whole run is O(E).

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tracing::warn;

use crate::dag::resolve::{resolve_edges, DependencyEdge};
use crate::dag::test_case::{TestCase, TestCaseId};
use crate::errors::{HpctestError, Result};
use crate::types::DependencyKind;

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<TestCaseId, DependencyKind>,
    names: Vec<String>,
    /// Dependencies of each node that have not passed yet.
    unresolved: Vec<usize>,
    resolved: Vec<bool>,
}

impl DependencyGraph {
    /// Build the graph for a set of test cases, expanding their declared
    /// dependency references into concrete edges.
    ///
    /// Test cases must be numbered by position (`cases[i].id == TestCaseId(i)`).
    pub fn build(cases: &[TestCase]) -> Result<Self> {
        for (i, case) in cases.iter().enumerate() {
            if case.id != TestCaseId(i) {
                return Err(HpctestError::ConfigError(format!(
                    "test case '{}' has id {} but is at position {i}",
                    case.name, case.id
                )));
            }
        }

        let edges = resolve_edges(cases)?;
        let names = cases.iter().map(|c| c.name.clone()).collect();
        Self::from_edges(names, &edges)
    }

    /// Build the graph from already-resolved edges.
    pub fn from_edges(names: Vec<String>, edges: &[DependencyEdge]) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(names.len(), edges.len());
        for i in 0..names.len() {
            graph.add_node(TestCaseId(i));
        }

        for edge in edges {
            let (from, to) = (edge.dependency.index(), edge.dependent.index());
            if from >= names.len() || to >= names.len() {
                return Err(HpctestError::ConfigError(format!(
                    "dependency edge {} -> {} refers to an unknown test case",
                    edge.dependent, edge.dependency
                )));
            }
            graph.update_edge(NodeIndex::new(from), NodeIndex::new(to), edge.kind);
        }

        if let Some(cycle) = find_cycle(&graph) {
            let path = cycle.into_iter().map(|i| names[i].clone()).collect();
            return Err(HpctestError::DependencyCycle { path });
        }

        let unresolved = (0..names.len())
            .map(|i| {
                graph
                    .neighbors_directed(NodeIndex::new(i), Direction::Incoming)
                    .count()
            })
            .collect();
        let resolved = vec![false; names.len()];

        Ok(Self {
            graph,
            names,
            unresolved,
            resolved,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name_of(&self, id: TestCaseId) -> &str {
        self.names.get(id.index()).map(String::as_str).unwrap_or("?")
    }

    /// Direct dependencies of `id`, in declaration order.
    pub fn dependencies_of(&self, id: TestCaseId) -> Vec<TestCaseId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of `id`, in declaration order.
    pub fn dependents_of(&self, id: TestCaseId) -> Vec<TestCaseId> {
        self.neighbors(id, Direction::Outgoing)
    }

    pub fn unresolved_count(&self, id: TestCaseId) -> usize {
        self.unresolved.get(id.index()).copied().unwrap_or(0)
    }

    pub fn is_ready(&self, id: TestCaseId) -> bool {
        self.unresolved_count(id) == 0
    }

    /// Test cases without dependencies, in declaration order.
    pub fn roots(&self) -> Vec<TestCaseId> {
        (0..self.len())
            .filter(|&i| self.unresolved[i] == 0)
            .map(TestCaseId)
            .collect()
    }

    /// Record that `id` passed. Returns the dependents that became ready,
    /// in declaration order.
    pub fn resolve(&mut self, id: TestCaseId) -> Vec<TestCaseId> {
        let Some(done) = self.resolved.get_mut(id.index()) else {
            warn!(test_case = %id, "resolve called for unknown test case");
            return Vec::new();
        };
        if *done {
            warn!(test = %self.names[id.index()], "test case resolved twice; ignoring");
            return Vec::new();
        }
        *done = true;

        let mut ready = Vec::new();
        for dependent in self.dependents_of(id) {
            let count = &mut self.unresolved[dependent.index()];
            *count = count.saturating_sub(1);
            if *count == 0 {
                ready.push(dependent);
            }
        }
        ready
    }

    /// A topological order that prefers declaration order among nodes that
    /// are simultaneously available.
    pub fn topological_order(&self) -> Vec<TestCaseId> {
        let mut indegree: Vec<usize> = (0..self.len())
            .map(|i| {
                self.graph
                    .neighbors_directed(NodeIndex::new(i), Direction::Incoming)
                    .count()
            })
            .collect();

        let mut heap: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(i)) = heap.pop() {
            order.push(TestCaseId(i));
            for next in self.dependents_of(TestCaseId(i)) {
                let d = &mut indegree[next.index()];
                *d -= 1;
                if *d == 0 {
                    heap.push(Reverse(next.index()));
                }
            }
        }
        order
    }

    fn neighbors(&self, id: TestCaseId, dir: Direction) -> Vec<TestCaseId> {
        if id.index() >= self.len() {
            return Vec::new();
        }
        let mut out: Vec<TestCaseId> = self
            .graph
            .neighbors_directed(NodeIndex::new(id.index()), dir)
            .map(|n| TestCaseId(n.index()))
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Depth-first search with white/gray/black coloring, following edges from
/// dependent to dependency. Returns the node indices of the first cycle
/// found, with the starting node repeated at the end.
fn find_cycle(graph: &DiGraph<TestCaseId, DependencyKind>) -> Option<Vec<usize>> {
    let successors = |n: usize| -> Vec<usize> {
        let mut s: Vec<usize> = graph
            .neighbors_directed(NodeIndex::new(n), Direction::Incoming)
            .map(|m| m.index())
            .collect();
        s.sort_unstable();
        s
    };

    let mut color = vec![Color::White; graph.node_count()];

    for start in 0..graph.node_count() {
        if color[start] != Color::White {
            continue;
        }

        color[start] = Color::Gray;
        let mut stack: Vec<(usize, Vec<usize>, usize)> = vec![(start, successors(start), 0)];

        loop {
            let next = match stack.last_mut() {
                None => break,
                Some((node, succs, pos)) => {
                    if *pos < succs.len() {
                        *pos += 1;
                        Some(succs[*pos - 1])
                    } else {
                        color[*node] = Color::Black;
                        None
                    }
                }
            };

            match next {
                None => {
                    stack.pop();
                }
                Some(s) => match color[s] {
                    Color::White => {
                        color[s] = Color::Gray;
                        stack.push((s, successors(s), 0));
                    }
                    Color::Gray => {
                        let from = stack.iter().position(|(n, _, _)| *n == s).unwrap_or(0);
                        let mut path: Vec<usize> = stack[from..].iter().map(|(n, _, _)| *n).collect();
                        path.push(s);
                        return Some(path);
                    }
                    Color::Black => {}
                },
            }
        }
    }

    None
}
