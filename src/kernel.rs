//! Shared scheduler state and the thread-per-LP run harness. Everything the
//! original-style design would keep as process globals (the per-LP state
//! array, the GVT slot table, the channel table, rollback counters) lives in
//! one `Kernel` value shared by reference with every worker.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crate::comms::ChannelTable;
use crate::config::KernelConfig;
use crate::event::{Event, Message, Pid, Signal, VirtualTime};
use crate::gvt::GvtClock;
use crate::lp::Lp;
use crate::KairosError;

/// Scheduling state of one LP. Written only by the owning worker, read by
/// everyone; plain atomic loads and stores are all the synchronization it
/// needs. `Stopped` is terminal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LpState {
    NotStarted = 0,
    Running = 1,
    Idle = 2,
    EvalGvt = 3,
    Stopped = 4,
}

impl LpState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LpState::NotStarted,
            1 => LpState::Running,
            2 => LpState::Idle,
            3 => LpState::EvalGvt,
            _ => LpState::Stopped,
        }
    }
}

/// The user event handler, registered once at setup and shared by every LP.
///
/// A handler may call [`Lp::notice_event`] any number of times to publish new
/// events. It must not block and must not mutate scheduler structures by any
/// other route. Because rollback restores an LP by replaying its committed
/// events, any state the handler keeps must be derivable from the event
/// stream it has been shown (interior mutability is fine, checkpoints are the
/// handler's own problem).
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event, lp: &mut Lp);
}

impl<F> EventHandler for F
where
    F: Fn(&Event, &mut Lp) + Send + Sync,
{
    fn handle(&self, event: &Event, lp: &mut Lp) {
        self(event, lp)
    }
}

/// Summary a worker returns once its LP has stopped.
#[derive(Clone, Debug)]
pub struct LpReport {
    pub pid: Pid,
    pub processed: u64,
    pub rollbacks: usize,
    pub sim_time: VirtualTime,
    pub gvt: VirtualTime,
}

pub struct Kernel {
    config: KernelConfig,
    handler: Arc<dyn EventHandler>,
    channels: ChannelTable,
    gvt: GvtClock,
    states: Vec<AtomicU8>,
    rollbacks: Vec<AtomicUsize>,
    // Set by a worker that hit a fatal error; everyone else winds down.
    poisoned: AtomicBool,
}

impl Kernel {
    /// One-time global setup: allocates the channel table, the GVT slot
    /// table, and the shared state arrays, and registers the handler.
    pub fn setup(
        config: KernelConfig,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Arc<Self>, KairosError> {
        if config.lps == 0 {
            return Err(KairosError::Config("at least one LP is required".into()));
        }
        if config.channel_capacity == 0 {
            return Err(KairosError::Config(
                "channel capacity must be non-zero".into(),
            ));
        }
        let channels = ChannelTable::new(config.lps, config.channel_capacity);
        let gvt = GvtClock::new(config.lps);
        let states = (0..config.lps)
            .map(|_| AtomicU8::new(LpState::NotStarted as u8))
            .collect();
        let rollbacks = (0..config.lps).map(|_| AtomicUsize::new(0)).collect();
        tracing::info!(lps = config.lps, end_time = config.end_time, "kernel ready");
        Ok(Arc::new(Self {
            config,
            handler,
            channels,
            gvt,
            states,
            rollbacks,
            poisoned: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn end_time(&self) -> VirtualTime {
        self.config.end_time
    }

    pub fn state_of(&self, pid: Pid) -> LpState {
        LpState::from_u8(self.states[pid].load(Ordering::SeqCst))
    }

    /// Number of committed GVT epochs.
    pub fn gvt_epochs(&self) -> usize {
        self.gvt.epochs()
    }

    pub fn rollback_count(&self, pid: Pid) -> usize {
        self.rollbacks[pid].load(Ordering::SeqCst)
    }

    pub fn total_rollbacks(&self) -> usize {
        self.rollbacks
            .iter()
            .map(|count| count.load(Ordering::SeqCst))
            .sum()
    }

    pub(crate) fn gvt(&self) -> &GvtClock {
        &self.gvt
    }

    pub(crate) fn handler(&self) -> Arc<dyn EventHandler> {
        Arc::clone(&self.handler)
    }

    pub(crate) fn set_state(&self, pid: Pid, state: LpState) {
        // Only the owning worker writes its own slot, so this check is not a
        // race: Stopped is terminal.
        if self.state_of(pid) == LpState::Stopped && state != LpState::Stopped {
            return;
        }
        self.states[pid].store(state as u8, Ordering::SeqCst);
    }

    /// Global idleness check for termination. A stopped LP counts as idle:
    /// it can never produce another event, so it must not keep its surviving
    /// peers spinning forever.
    pub(crate) fn all_idle(&self) -> bool {
        self.states.iter().all(|state| {
            let state = LpState::from_u8(state.load(Ordering::SeqCst));
            state == LpState::Idle || state == LpState::Stopped
        })
    }

    pub(crate) fn send(&self, msg: Message) -> Result<(), KairosError> {
        self.channels.send(msg)
    }

    /// Cooperative shutdown: abort to every peer. Used by the termination
    /// winner once global idleness has been observed. Already-stopped peers
    /// get a best-effort send only; their queues are never drained again.
    pub(crate) fn broadcast_abort(&self, from: Pid) -> Result<(), KairosError> {
        for pid in 0..self.config.lps {
            if pid == from {
                continue;
            }
            let msg = Message {
                from,
                to: pid,
                body: Signal::Abort,
            };
            if self.state_of(pid) == LpState::Stopped {
                self.channels.try_send(msg);
            } else {
                self.send(msg)?;
            }
        }
        Ok(())
    }

    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Best-effort abort used when a worker is unwinding with a fatal error;
    /// a full queue must not deadlock the teardown.
    pub(crate) fn abort_all_best_effort(&self, from: Pid) {
        for pid in 0..self.config.lps {
            if pid != from {
                self.channels.try_send(Message {
                    from,
                    to: pid,
                    body: Signal::Abort,
                });
            }
        }
    }

    pub(crate) fn add_rollback(&self, pid: Pid) {
        self.rollbacks[pid].fetch_add(1, Ordering::SeqCst);
    }

    /// Per-LP init: hands out the LP's input channel and marks it running.
    /// Seed initial events with [`Lp::schedule`] before calling
    /// [`Lp::simulate`].
    pub fn initialize(self: &Arc<Self>, pid: Pid) -> Result<Lp, KairosError> {
        if pid >= self.config.lps {
            return Err(KairosError::UnknownLp(pid));
        }
        if self.state_of(pid) != LpState::NotStarted {
            return Err(KairosError::AlreadyInitialized(pid));
        }
        let rx = self.channels.receiver(pid)?;
        self.set_state(pid, LpState::Running);
        Ok(Lp::new(Arc::clone(self), pid, rx))
    }

    /// Convenience harness: initializes every LP, lets `seed` inject initial
    /// events, runs one worker thread per LP, and joins them all. The first
    /// worker error (or panic) wins; a failing worker has already broadcast
    /// abort, so its siblings unwind rather than deadlock.
    pub fn run<S>(self: &Arc<Self>, seed: S) -> Result<Vec<LpReport>, KairosError>
    where
        S: Fn(&mut Lp) -> Result<(), KairosError>,
    {
        let mut workers = Vec::with_capacity(self.config.lps);
        for pid in 0..self.config.lps {
            let mut lp = self.initialize(pid)?;
            seed(&mut lp)?;
            workers.push(lp);
        }
        thread::scope(|scope| {
            let handles: Vec<_> = workers
                .into_iter()
                .map(|mut lp| {
                    scope.spawn(move || -> Result<LpReport, KairosError> {
                        lp.simulate()?;
                        Ok(lp.report())
                    })
                })
                .collect();
            let mut reports = Vec::with_capacity(handles.len());
            for handle in handles {
                match handle.join() {
                    Ok(Ok(report)) => reports.push(report),
                    Ok(Err(err)) => return Err(err),
                    Err(_) => return Err(KairosError::ThreadPanic),
                }
            }
            Ok(reports)
        })
    }
}
