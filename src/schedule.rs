//! The future-event set: a min-heap of unprocessed events ordered by
//! `(time, id)`. Storage is unbounded, so insertion never fails; the only
//! structural operation beyond the usual heap trio is the linear-scan removal
//! of a positive event by its anti-event's negated id. Anti-messages are rare
//! relative to normal traffic, so the scan is not worth an index.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::event::{Event, VirtualTime};

#[derive(Debug, Default)]
pub struct EventSchedule {
    heap: BinaryHeap<Reverse<Event>>,
}

impl EventSchedule {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn insert(&mut self, event: Event) {
        self.heap.push(Reverse(event));
    }

    /// Timestamp of the earliest pending event, if any.
    pub fn peek_min_time(&self) -> Option<VirtualTime> {
        self.heap.peek().map(|entry| entry.0.time)
    }

    pub fn extract_min(&mut self) -> Option<Event> {
        self.heap.pop().map(|entry| entry.0)
    }

    /// Remove and return the positive counterpart of `anti`, i.e. the event
    /// whose id is the negation of the anti-event's. `None` means the
    /// positive has not arrived here yet.
    pub fn delete_by_anti_id(&mut self, anti: &Event) -> Option<Event> {
        let target = -anti.id;
        let found = self.heap.iter().map(|entry| entry.0).find(|e| e.id == target)?;
        self.heap.retain(|entry| entry.0.id != target);
        Some(found)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
