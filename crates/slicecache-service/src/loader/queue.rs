use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::types::{FrameKey, Origin};

/// A load waiting for a free slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct QueuedLoad {
    pub origin: Origin,
    /// Lower is more urgent.
    pub priority: u32,
    /// Monotonic enqueue counter, identifies the queue position of a load.
    pub ticket: u64,
    pub key: FrameKey,
}

impl QueuedLoad {
    /// The sort key, where greater means more urgent.
    fn urgency(&self) -> (bool, Reverse<u32>, Reverse<u64>) {
        (
            self.origin == Origin::Demand,
            Reverse(self.priority),
            Reverse(self.ticket),
        )
    }
}

impl Ord for QueuedLoad {
    fn cmp(&self, other: &Self) -> Ordering {
        self.urgency().cmp(&other.urgency())
    }
}

impl PartialOrd for QueuedLoad {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The dispatch order of pending loads.
///
/// Demand loads always go before prefetch loads, then lower priority numbers, then first come
/// first served. A load that is upgraded is pushed again with a new ticket, the stale position is
/// skipped by the coordinator when it is popped.
#[derive(Debug, Default)]
pub(super) struct LoadQueue {
    heap: BinaryHeap<QueuedLoad>,
    next_ticket: u64,
}

impl LoadQueue {
    /// Enqueues a load and returns its ticket.
    pub fn push(&mut self, key: FrameKey, origin: Origin, priority: u32) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.heap.push(QueuedLoad {
            origin,
            priority,
            ticket,
            key,
        });
        ticket
    }

    pub fn pop(&mut self) -> Option<QueuedLoad> {
        self.heap.pop()
    }

    pub fn retain(&mut self, f: impl FnMut(&QueuedLoad) -> bool) {
        self.heap.retain(f);
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}
