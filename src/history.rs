//! Time-ordered collections backing the rollback machinery: processed events,
//! sent-message copies, unacknowledged output, epoch-acked output, and parked
//! anti-events all keep their entries sorted by timestamp. Both hot deletions
//! are end-biased (fossil collection eats the old front, rollback truncates
//! the speculative back), so a deque is the right shape.

use std::collections::VecDeque;

use crate::event::{Timed, VirtualTime};

#[derive(Debug)]
pub struct TimedList<T: Timed> {
    items: VecDeque<T>,
}

impl<T: Timed> Default for TimedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Timed> TimedList<T> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    /// Insert keeping timestamps non-decreasing. Entries arrive mostly in
    /// order, so the scan from the back is usually a single comparison.
    pub fn insert(&mut self, item: T) {
        let t = item.time();
        let mut idx = self.items.len();
        while idx > 0 && self.items[idx - 1].time() > t {
            idx -= 1;
        }
        self.items.insert(idx, item);
    }

    /// Timestamp of the oldest entry, if any.
    pub fn min_time(&self) -> Option<VirtualTime> {
        self.items.front().map(Timed::time)
    }

    /// Fossil collection: drop every entry strictly older than `t`.
    pub fn delete_before(&mut self, t: VirtualTime) {
        while self.items.front().is_some_and(|item| item.time() < t) {
            self.items.pop_front();
        }
    }

    /// Rollback truncation: remove and return every entry with timestamp at
    /// or after `t`, newest first.
    pub fn drain_back_from(&mut self, t: VirtualTime) -> Vec<T> {
        let mut drained = Vec::new();
        while self.items.back().is_some_and(|item| item.time() >= t) {
            if let Some(item) = self.items.pop_back() {
                drained.push(item);
            }
        }
        drained
    }

    pub fn find<P>(&self, pred: P) -> Option<&T>
    where
        P: Fn(&T) -> bool,
    {
        self.items.iter().find(|item| pred(item))
    }

    /// Remove and return the first (oldest) entry matching `pred`.
    pub fn remove_where<P>(&mut self, pred: P) -> Option<T>
    where
        P: Fn(&T) -> bool,
    {
        let idx = self.items.iter().position(pred)?;
        self.items.remove(idx)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}
