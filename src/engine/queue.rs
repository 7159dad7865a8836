//! Priority-ordered waiting queue.
//!
//! A binary heap keyed by (priority descending, admission instant
//! ascending); entries with equal priority and admission instant dequeue
//! in submission order, but callers must treat them as unordered among
//! equals. Removal is by tombstone: the heap entry stays behind and is
//! discarded when popped, so `remove` stays cheap and idempotent.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use crate::request::RequestWrapper;

/// Smallest heap worth compacting; below this tombstones are harmless.
const COMPACT_MIN_HEAP: usize = 8;

struct QueueEntry(Arc<RequestWrapper>);

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // BinaryHeap pops the greatest entry first: greater means higher
    // priority, then earlier admission, then earlier submission id.
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .request()
            .priority()
            .cmp(&other.0.request().priority())
            .then_with(|| other.0.submitted_at().cmp(&self.0.submitted_at()))
            .then_with(|| other.0.id().cmp(&self.0.id()))
    }
}

/// Waiting queue for admitted-but-not-yet-activated wrappers.
pub(crate) struct WaitingQueue {
    heap: BinaryHeap<QueueEntry>,
    live: HashSet<u64>,
}

impl WaitingQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashSet::new(),
        }
    }

    /// Appends a wrapper.
    pub(crate) fn push(&mut self, wrapper: Arc<RequestWrapper>) {
        self.live.insert(wrapper.id());
        self.heap.push(QueueEntry(wrapper));
    }

    /// Removes a wrapper by id. Idempotent: returns false if absent.
    ///
    /// Compacts the heap once tombstones outnumber live entries, so
    /// removed wrappers are not kept alive by stale heap entries while
    /// the queue stays populated.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        let removed = self.live.remove(&id);
        if removed && self.heap.len() >= COMPACT_MIN_HEAP && self.heap.len() >= 2 * self.live.len()
        {
            let live = &self.live;
            self.heap.retain(|entry| live.contains(&entry.0.id()));
        }
        removed
    }

    /// Pops the highest-priority live wrapper, discarding tombstones.
    pub(crate) fn pop(&mut self) -> Option<Arc<RequestWrapper>> {
        while let Some(entry) = self.heap.pop() {
            if self.live.remove(&entry.0.id()) {
                return Some(entry.0);
            }
        }
        None
    }

    /// Number of live entries.
    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether no live entries remain.
    pub(crate) fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
