//! # Kairos
//!
//! An optimistic parallel discrete-event simulation kernel implementing the
//! Time Warp synchronization protocol. Logical processes (LPs) run one per OS
//! thread, speculate past unsynchronized events, and repair causality
//! violations by rolling back local history and chasing already-sent messages
//! with anti-messages. A distributed Global Virtual Time (GVT) reduction
//! bounds how much history has to be retained; everything older is fossil
//! collected.
//!
//! ## Architecture
//!
//! - [`kernel`] - shared scheduler state, setup, and the thread-per-LP harness
//! - [`lp`] - the LP main loop: dispatch, rollback, annihilation, idle
//! - [`gvt`] - the one-shot distributed GVT min-reduction
//! - [`schedule`] / [`history`] - the future-event set and rollback history
//! - [`event`] - event, message, and signal value types
//!
//! ## Handler contract
//!
//! There is no checkpoint API: rollback restores an LP purely by re-executing
//! its committed event stream. Any state a handler mutates must therefore be
//! derivable from the events it has been shown, or snapshotted by the handler
//! itself. Handlers must not block and must not touch the scheduler's
//! structures except through [`lp::Lp::notice_event`].

use thiserror::Error;

pub mod config;
pub mod event;
pub mod gvt;
pub mod history;
pub mod kernel;
pub mod lp;
pub mod schedule;

mod comms;

pub mod prelude {
    pub use crate::config::KernelConfig;
    pub use crate::event::{AckKind, EntityId, Event, Flag, Message, Pid, Signal, VirtualTime};
    pub use crate::kernel::{EventHandler, Kernel, LpReport, LpState};
    pub use crate::lp::Lp;
    pub use crate::KairosError;
}

use event::{Pid, VirtualTime};

/// Error enum for everything that can go wrong inside the kernel.
///
/// The consistency variants are fatal at LP scope: they mean a protocol
/// invariant broke, and the failing worker aborts the whole simulation rather
/// than limp on with a corrupt virtual clock.
#[derive(Debug, Error)]
pub enum KairosError {
    #[error("lp {lp} dequeued an event from the past ({event_time} < local clock {sim_time})")]
    PastEvent {
        lp: Pid,
        event_time: VirtualTime,
        sim_time: VirtualTime,
    },
    #[error("lp {lp} was handed a GVT of {committed}, below the previously committed {previous}")]
    GvtRegression {
        lp: Pid,
        committed: VirtualTime,
        previous: VirtualTime,
    },
    #[error("no LP with index {0} exists in this kernel")]
    UnknownLp(Pid),
    #[error("lp {0} has already been initialized once")]
    AlreadyInitialized(Pid),
    #[error("channel for lp {0} is closed; the kernel it belonged to is gone")]
    ChannelClosed(Pid),
    #[error("an LP worker thread panicked")]
    ThreadPanic,
    #[error("configuration error: {0}")]
    Config(String),
}
