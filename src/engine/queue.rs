// src/engine/queue.rs

use std::collections::VecDeque;

use tracing::debug;

use crate::dag::TestCaseId;

/// FIFO of test cases whose dependencies all passed.
///
/// Cases that become ready together are queued in declaration order, so the
/// admission order only depends on the plan and the order of completions.
#[derive(Debug, Default, Clone)]
pub struct ReadyQueue {
    items: VecDeque<TestCaseId>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append a batch of simultaneously ready cases, sorted by id.
    pub fn push_batch(&mut self, mut ids: Vec<TestCaseId>) {
        if ids.is_empty() {
            return;
        }
        ids.sort();
        ids.dedup();
        debug!(count = ids.len(), "test cases became ready");
        self.items.extend(ids);
    }

    /// Take up to `limit` cases from the front for which `admissible` holds.
    ///
    /// Cases that are not admissible right now keep their position, so a full
    /// partition does not hold back cases for other partitions.
    pub fn take_admissible(
        &mut self,
        limit: usize,
        mut admissible: impl FnMut(TestCaseId) -> bool,
    ) -> Vec<TestCaseId> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());

        while let Some(id) = self.items.pop_front() {
            if taken.len() < limit && admissible(id) {
                taken.push(id);
            } else {
                kept.push_back(id);
            }
        }

        self.items = kept;
        taken
    }

    /// Remove and return everything still queued.
    pub fn drain(&mut self) -> Vec<TestCaseId> {
        self.items.drain(..).collect()
    }
}
