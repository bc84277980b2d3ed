//! Priority queue feeding execution requests to the executor fleet.
//!
//! A thread-safe min-heap keyed by a composite priority vector. Consumers
//! poll with `try_pop`; there is no blocking variant.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Composite request priority.
///
/// A lexicographically ordered vector of integers; smaller compares first
/// and is served first. The first component is the base priority of the
/// originating job class, the second (appended via [`Priority::save_id`])
/// is the job id, so that among jobs of equal base priority the older one
/// drains first. A bare base priority sorts before any annotated sibling
/// at the same base (a shorter vector is a strict prefix and therefore
/// smaller).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(SmallVec<[i64; 2]>);

impl Priority {
    pub fn base(base: i64) -> Self {
        let mut v = SmallVec::new();
        v.push(base);
        Priority(v)
    }

    /// Attach the job sub-id as the tie-breaking component.
    pub fn save_id(&mut self, id: i64) {
        self.0.push(id);
    }
}

struct Item<V> {
    prio: Priority,
    value: V,
}

// BinaryHeap is a max-heap; invert the comparison so that the smallest
// priority vector is popped first.
impl<V> Ord for Item<V> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.prio.cmp(&self.prio)
    }
}

impl<V> PartialOrd for Item<V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<V> PartialEq for Item<V> {
    fn eq(&self, other: &Self) -> bool {
        self.prio == other.prio
    }
}

impl<V> Eq for Item<V> {}

/// Min-heap of (priority, value) pairs, safe for concurrent push and pop.
pub struct PriorityQueue<V> {
    heap: Mutex<BinaryHeap<Item<V>>>,
}

impl<V> PriorityQueue<V> {
    pub fn new() -> Self {
        PriorityQueue { heap: Mutex::new(BinaryHeap::new()) }
    }

    pub fn push(&self, value: V, prio: Priority) {
        self.heap.lock().push(Item { prio, value });
    }

    /// Pop the highest-priority value, or `None` if the queue is empty.
    pub fn try_pop(&self) -> Option<V> {
        self.heap.lock().pop().map(|item| item.value)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Default for PriorityQueue<V> {
    fn default() -> Self {
        Self::new()
    }
}
