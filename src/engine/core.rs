// src/engine/core.rs

//! Pure core scheduler.
//!
//! Synchronous and deterministic: it owns the dependency graph, the ready
//! queue, the running set and the terminal status of every test case, and
//! decides what to admit next. It has no Tokio types and does no IO, so it
//! can be exercised exhaustively in unit and property tests.
//!
//! The async shell (`engine::runtime::Runtime`) drives pipelines and reports
//! completions back through [`CoreScheduler::complete`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use tracing::debug;

use crate::dag::{DependencyGraph, TestCaseId};
use crate::engine::event_handlers::{handle_abort, handle_completion};
use crate::engine::queue::ReadyQueue;
use crate::errors::{HpctestError, Result};
use crate::types::TestStatus;

/// Concurrency limits on admitted test cases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    pub max_jobs: usize,
    pub per_partition: BTreeMap<String, usize>,
}

impl Limits {
    pub fn global(max_jobs: usize) -> Self {
        Self {
            max_jobs: max_jobs.max(1),
            per_partition: BTreeMap::new(),
        }
    }
}

/// A test case skipped because `cause` did not pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkippedCase {
    pub id: TestCaseId,
    pub cause: TestCaseId,
}

/// Result of recording a completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreStep {
    /// Dependents whose last dependency just passed, in declaration order.
    pub newly_ready: Vec<TestCaseId>,
    /// Dependents (transitively) skipped by a non-passing completion.
    pub newly_skipped: Vec<SkippedCase>,
}

/// Counts by status, for progress displays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub pass: usize,
    pub fail: usize,
    pub skip: usize,
    pub aborted: usize,
}

impl Progress {
    pub fn finished(&self) -> usize {
        self.pass + self.fail + self.skip + self.aborted
    }
}

#[derive(Debug)]
pub struct CoreScheduler {
    pub(crate) graph: DependencyGraph,
    pub(crate) partitions: Vec<String>,
    pub(crate) statuses: Vec<TestStatus>,
    pub(crate) ready: ReadyQueue,
    pub(crate) running: BTreeSet<TestCaseId>,
    pub(crate) running_per_partition: HashMap<String, usize>,
    limits: Limits,
}

impl CoreScheduler {
    /// `partitions[i]` is the partition of test case `i`.
    pub fn new(graph: DependencyGraph, partitions: Vec<String>, limits: Limits) -> Result<Self> {
        if partitions.len() != graph.len() {
            return Err(HpctestError::ConfigError(format!(
                "scheduler got {} partitions for {} test cases",
                partitions.len(),
                graph.len()
            )));
        }

        let mut ready = ReadyQueue::new();
        ready.push_batch(graph.roots());

        Ok(Self {
            statuses: vec![TestStatus::Pending; graph.len()],
            graph,
            partitions,
            ready,
            running: BTreeSet::new(),
            running_per_partition: HashMap::new(),
            limits,
        })
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn status(&self, id: TestCaseId) -> TestStatus {
        self.statuses
            .get(id.index())
            .copied()
            .unwrap_or(TestStatus::Pending)
    }

    pub fn running(&self) -> impl Iterator<Item = TestCaseId> + '_ {
        self.running.iter().copied()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Move ready test cases into the running set, up to the global and
    /// per-partition limits. Returned in admission order.
    pub fn admit(&mut self) -> Vec<TestCaseId> {
        let capacity = self.limits.max_jobs.saturating_sub(self.running.len());
        if capacity == 0 || self.ready.is_empty() {
            return Vec::new();
        }

        let partitions = &self.partitions;
        let per_partition = &self.limits.per_partition;
        let mut counts = self.running_per_partition.clone();
        let admitted = self.ready.take_admissible(capacity, |id| {
            let part = &partitions[id.index()];
            let used = counts.entry(part.clone()).or_insert(0);
            match per_partition.get(part) {
                Some(&limit) if *used >= limit => false,
                _ => {
                    *used += 1;
                    true
                }
            }
        });

        for &id in &admitted {
            self.running.insert(id);
            self.statuses[id.index()] = TestStatus::Running;
            *self
                .running_per_partition
                .entry(self.partitions[id.index()].clone())
                .or_insert(0) += 1;
        }

        if !admitted.is_empty() {
            debug!(?admitted, running = self.running.len(), "admitted test cases");
        }
        admitted
    }

    /// Record the terminal status of a running test case.
    pub fn complete(&mut self, id: TestCaseId, status: TestStatus) -> CoreStep {
        handle_completion(self, id, status)
    }

    /// Mark every test case that has not been admitted as aborted. Running
    /// test cases are left to finish their own abort path.
    pub fn abort_pending(&mut self) -> Vec<TestCaseId> {
        handle_abort(self)
    }

    /// Every test case is terminal.
    pub fn is_finished(&self) -> bool {
        self.statuses.iter().all(|s| s.is_terminal())
    }

    /// Nothing runs and nothing can be admitted, yet some test cases are not
    /// terminal. Can't happen for an acyclic graph.
    pub fn is_stalled(&self) -> bool {
        !self.is_finished() && self.running.is_empty() && self.ready.is_empty()
    }

    pub fn progress(&self) -> Progress {
        let mut p = Progress {
            total: self.statuses.len(),
            ..Progress::default()
        };
        for status in &self.statuses {
            match status {
                TestStatus::Pending => p.pending += 1,
                TestStatus::Running => p.running += 1,
                TestStatus::Pass => p.pass += 1,
                TestStatus::Fail => p.fail += 1,
                TestStatus::Skip => p.skip += 1,
                TestStatus::Aborted => p.aborted += 1,
            }
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::DependencyEdge;
    use crate::types::DependencyKind;

    fn ids(raw: &[usize]) -> Vec<TestCaseId> {
        raw.iter().copied().map(TestCaseId).collect()
    }

    fn scheduler(n: usize, edges: &[(usize, usize)], limits: Limits) -> CoreScheduler {
        let edges: Vec<DependencyEdge> = edges
            .iter()
            .map(|&(dependent, dependency)| DependencyEdge {
                dependent: TestCaseId(dependent),
                dependency: TestCaseId(dependency),
                kind: DependencyKind::Strict,
            })
            .collect();
        let names = (0..n).map(|i| format!("t{i}")).collect();
        let graph = DependencyGraph::from_edges(names, &edges).expect("acyclic");
        CoreScheduler::new(graph, vec!["p".to_string(); n], limits).expect("scheduler")
    }

    #[test]
    fn failed_dependency_skips_dependent_without_admitting_it() {
        // B (1) depends on A (0).
        let mut core = scheduler(2, &[(1, 0)], Limits::global(4));
        assert_eq!(core.admit(), ids(&[0]));

        let step = core.complete(TestCaseId(0), TestStatus::Fail);
        assert!(step.newly_ready.is_empty());
        assert_eq!(
            step.newly_skipped,
            vec![SkippedCase {
                id: TestCaseId(1),
                cause: TestCaseId(0),
            }]
        );
        assert_eq!(core.status(TestCaseId(1)), TestStatus::Skip);
        assert!(core.admit().is_empty());
        assert!(core.is_finished());
    }

    #[test]
    fn skip_cascades_transitively() {
        // 0 <- 1 <- 2, and 3 is independent.
        let mut core = scheduler(4, &[(1, 0), (2, 1)], Limits::global(4));
        assert_eq!(core.admit(), ids(&[0, 3]));
        let step = core.complete(TestCaseId(0), TestStatus::Aborted);
        let skipped: Vec<_> = step.newly_skipped.iter().map(|s| (s.id.0, s.cause.0)).collect();
        assert_eq!(skipped, vec![(1, 0), (2, 1)]);
        assert_eq!(core.status(TestCaseId(3)), TestStatus::Running);
    }

    #[test]
    fn global_limit_admits_in_declaration_order() {
        let mut core = scheduler(3, &[], Limits::global(2));
        assert_eq!(core.admit(), ids(&[0, 1]));
        assert!(core.admit().is_empty());

        core.complete(TestCaseId(1), TestStatus::Pass);
        assert_eq!(core.admit(), ids(&[2]));
        assert_eq!(core.running_count(), 2);
    }

    #[test]
    fn partition_limit_does_not_block_other_partitions() {
        let graph = DependencyGraph::from_edges(
            (0..3).map(|i| format!("t{i}")).collect(),
            &[],
        )
        .expect("acyclic");
        let limits = Limits {
            max_jobs: 8,
            per_partition: BTreeMap::from([("gpu".to_string(), 1)]),
        };
        let parts = vec!["gpu".to_string(), "gpu".to_string(), "cpu".to_string()];
        let mut core = CoreScheduler::new(graph, parts, limits).expect("scheduler");

        assert_eq!(core.admit(), ids(&[0, 2]));
        core.complete(TestCaseId(0), TestStatus::Pass);
        assert_eq!(core.admit(), ids(&[1]));
    }

    #[test]
    fn passing_dependencies_release_dependents_together() {
        // 2 and 3 depend on 0; 1 independent.
        let mut core = scheduler(4, &[(3, 0), (2, 0)], Limits::global(1));
        assert_eq!(core.admit(), ids(&[0]));
        let step = core.complete(TestCaseId(0), TestStatus::Pass);
        assert_eq!(step.newly_ready, ids(&[2, 3]));
        // 1 was ready earlier, so it goes first.
        assert_eq!(core.admit(), ids(&[1]));
    }

    #[test]
    fn abort_marks_everything_not_admitted() {
        let mut core = scheduler(3, &[(2, 0)], Limits::global(1));
        assert_eq!(core.admit(), ids(&[0]));
        let aborted = core.abort_pending();
        assert_eq!(aborted, ids(&[1, 2]));
        assert_eq!(core.status(TestCaseId(0)), TestStatus::Running);

        core.complete(TestCaseId(0), TestStatus::Aborted);
        assert!(core.is_finished());
        let p = core.progress();
        assert_eq!((p.aborted, p.total), (3, 3));
    }

    #[test]
    fn duplicate_completion_is_ignored() {
        let mut core = scheduler(2, &[(1, 0)], Limits::global(2));
        core.admit();
        core.complete(TestCaseId(0), TestStatus::Pass);
        let again = core.complete(TestCaseId(0), TestStatus::Fail);
        assert_eq!(again, CoreStep::default());
        assert_eq!(core.status(TestCaseId(0)), TestStatus::Pass);
    }
}
