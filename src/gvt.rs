//! The distributed GVT reduction. One epoch at a time: some LP opens it,
//! every live LP writes a local minimum into its slot, and whichever
//! contribution completes the table commits the global minimum. The whole
//! slot table sits behind a single mutex; the completion check runs inside
//! the critical section, so two LPs racing the "all slots filled" observation
//! cannot double-commit. The committed value and the epoch-active flag are
//! mirrored in atomics for the hot-path reads in the LP loop.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::event::{Pid, VirtualTime};

#[derive(Debug)]
struct MinTable {
    slots: Vec<Option<VirtualTime>>,
    // A retired LP has stopped for good and is excused from every future
    // epoch; without this a stopping LP would wedge an in-flight reduction.
    retired: Vec<bool>,
    active: bool,
    gvt: VirtualTime,
}

#[derive(Debug)]
pub struct GvtClock {
    table: Mutex<MinTable>,
    evaluating: AtomicBool,
    committed: AtomicU64,
    epochs: AtomicUsize,
}

impl GvtClock {
    pub fn new(lps: usize) -> Self {
        Self {
            table: Mutex::new(MinTable {
                slots: vec![None; lps],
                retired: vec![false; lps],
                active: false,
                gvt: 0,
            }),
            evaluating: AtomicBool::new(false),
            committed: AtomicU64::new(0),
            epochs: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MinTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new epoch. Returns false if one is already collecting, in which
    /// case the caller should simply participate instead of broadcasting.
    pub fn start_epoch(&self) -> bool {
        let mut table = self.lock();
        if table.active {
            return false;
        }
        for slot in &mut table.slots {
            *slot = None;
        }
        table.active = true;
        self.evaluating.store(true, Ordering::SeqCst);
        true
    }

    /// True while an epoch is still collecting contributions.
    pub fn is_evaluating(&self) -> bool {
        self.evaluating.load(Ordering::SeqCst)
    }

    /// Record `local_min` for `pid`. The epoch commits the moment every
    /// non-retired LP has reported.
    pub fn contribute(&self, pid: Pid, local_min: VirtualTime) {
        let mut table = self.lock();
        if !table.active {
            return;
        }
        if let Some(slot) = table.slots.get_mut(pid) {
            *slot = Some(local_min);
        }
        self.try_commit(&mut table);
    }

    /// Permanently excuse a stopped LP from the reduction. May complete an
    /// epoch that was only waiting on the retiree.
    pub fn retire(&self, pid: Pid) {
        let mut table = self.lock();
        if let Some(flag) = table.retired.get_mut(pid) {
            *flag = true;
        }
        if table.active {
            self.try_commit(&mut table);
        }
    }

    fn try_commit(&self, table: &mut MinTable) {
        let complete = table
            .slots
            .iter()
            .zip(&table.retired)
            .all(|(slot, retired)| slot.is_some() || *retired);
        if !complete {
            return;
        }
        let gvt = table
            .slots
            .iter()
            .flatten()
            .min()
            .copied()
            .unwrap_or(VirtualTime::MAX);
        table.gvt = gvt;
        for slot in &mut table.slots {
            *slot = None;
        }
        table.active = false;
        self.committed.store(gvt, Ordering::SeqCst);
        self.evaluating.store(false, Ordering::SeqCst);
        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(gvt, epoch, "gvt committed");
    }

    /// The last committed GVT, or `None` while an epoch is still collecting.
    pub fn committed(&self) -> Option<VirtualTime> {
        if self.is_evaluating() {
            None
        } else {
            Some(self.committed.load(Ordering::SeqCst))
        }
    }

    /// How many epochs have committed so far.
    pub fn epochs(&self) -> usize {
        self.epochs.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_slot_epoch_commits_on_first_contribution() {
        let clock = GvtClock::new(1);
        assert!(clock.start_epoch());
        assert!(clock.is_evaluating());
        assert_eq!(clock.committed(), None);

        clock.contribute(0, 17);
        assert!(!clock.is_evaluating());
        assert_eq!(clock.committed(), Some(17));
        assert_eq!(clock.epochs(), 1);
    }

    #[test]
    fn epoch_waits_for_every_live_lp() {
        let clock = GvtClock::new(3);
        assert!(clock.start_epoch());
        assert!(!clock.start_epoch());

        clock.contribute(0, 40);
        clock.contribute(2, 25);
        assert_eq!(clock.committed(), None);

        clock.contribute(1, 33);
        assert_eq!(clock.committed(), Some(25));
    }

    #[test]
    fn retirement_completes_a_stalled_epoch() {
        let clock = GvtClock::new(2);
        assert!(clock.start_epoch());
        clock.contribute(0, 50);
        assert_eq!(clock.committed(), None);

        clock.retire(1);
        assert_eq!(clock.committed(), Some(50));

        // A retired LP is excused from later epochs entirely.
        assert!(clock.start_epoch());
        clock.contribute(0, 60);
        assert_eq!(clock.committed(), Some(60));
        assert_eq!(clock.epochs(), 2);
    }

    #[test]
    fn contributions_outside_an_epoch_are_ignored() {
        let clock = GvtClock::new(2);
        clock.contribute(0, 5);
        assert_eq!(clock.committed(), Some(0));
        assert_eq!(clock.epochs(), 0);
    }
}
