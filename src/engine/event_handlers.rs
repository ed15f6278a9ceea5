// src/engine/event_handlers.rs

//! State transitions of the core scheduler.

use tracing::{debug, info, warn};

use crate::dag::TestCaseId;
use crate::engine::core::{CoreScheduler, CoreStep, SkippedCase};
use crate::types::TestStatus;

/// Record a terminal status.
///
/// - `Pass` resolves the case in the dependency graph; dependents whose last
///   dependency this was become ready.
/// - Anything else skips every pending dependent, recursively.
///
/// Completions for test cases that are not running, or that are already
/// terminal, are ignored: a result never changes once recorded.
pub fn handle_completion(core: &mut CoreScheduler, id: TestCaseId, status: TestStatus) -> CoreStep {
    let Some(current) = core.statuses.get(id.index()).copied() else {
        warn!(test_case = %id, "completion for unknown test case");
        return CoreStep::default();
    };
    if current.is_terminal() {
        warn!(test = %core.graph.name_of(id), %current, %status, "test case already terminal; ignoring completion");
        return CoreStep::default();
    }
    if !status.is_terminal() {
        warn!(test = %core.graph.name_of(id), %status, "completion with non-terminal status; ignoring");
        return CoreStep::default();
    }

    if core.running.remove(&id) {
        if let Some(count) = core.running_per_partition.get_mut(&core.partitions[id.index()]) {
            *count = count.saturating_sub(1);
        }
    } else {
        debug!(test = %core.graph.name_of(id), "completion for test case that was not running");
    }

    core.statuses[id.index()] = status;
    info!(test = %core.graph.name_of(id), %status, "test case finished");

    if status == TestStatus::Pass {
        let newly_ready: Vec<TestCaseId> = core
            .graph
            .resolve(id)
            .into_iter()
            .filter(|dep| core.statuses[dep.index()] == TestStatus::Pending)
            .collect();
        core.ready.push_batch(newly_ready.clone());
        CoreStep {
            newly_ready,
            newly_skipped: Vec::new(),
        }
    } else {
        CoreStep {
            newly_ready: Vec::new(),
            newly_skipped: cascade_skip(core, id),
        }
    }
}

/// Skip all pending (transitive) dependents of `root`.
fn cascade_skip(core: &mut CoreScheduler, root: TestCaseId) -> Vec<SkippedCase> {
    let mut skipped = Vec::new();
    let mut stack = vec![root];

    while let Some(cause) = stack.pop() {
        for dependent in core.graph.dependents_of(cause) {
            if core.statuses[dependent.index()] != TestStatus::Pending {
                continue;
            }
            core.statuses[dependent.index()] = TestStatus::Skip;
            info!(
                test = %core.graph.name_of(dependent),
                dependency = %core.graph.name_of(cause),
                "skipping test case: dependency did not pass"
            );
            skipped.push(SkippedCase {
                id: dependent,
                cause,
            });
            stack.push(dependent);
        }
    }

    skipped.sort_by_key(|s| s.id);
    skipped
}

/// Abort everything that has not been admitted yet.
pub fn handle_abort(core: &mut CoreScheduler) -> Vec<TestCaseId> {
    core.ready.drain();

    let aborted: Vec<TestCaseId> = core
        .statuses
        .iter_mut()
        .enumerate()
        .filter(|(_, s)| **s == TestStatus::Pending)
        .map(|(i, s)| {
            *s = TestStatus::Aborted;
            TestCaseId(i)
        })
        .collect();

    if !aborted.is_empty() {
        info!(count = aborted.len(), "aborted pending test cases");
    }
    aborted
}
