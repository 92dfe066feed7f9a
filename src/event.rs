//! Value types carried between LPs: timestamped events, the signals that ride
//! the inter-LP channels, and the send-time-stamped message copies kept for
//! rollback. Everything here is a plain `Copy` value; ownership transfers when
//! a message is enqueued and the sender keeps explicit copies where the
//! protocol needs them.

use std::cmp::Ordering;

/// Simulation time. Monotonically non-decreasing per LP outside of rollback.
pub type VirtualTime = u64;

/// Dense LP index in `[0, lps)`.
pub type Pid = usize;

/// Opaque workload-level entity identifier; the kernel never interprets it.
pub type EntityId = u32;

/// Polarity of an event. An anti-event carries the negated id of the positive
/// it cancels.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Flag {
    Normal,
    Anti,
}

/// A timestamped unit of simulation work addressed to an entity.
#[derive(Copy, Clone, Debug)]
pub struct Event {
    pub id: i32,
    pub time: VirtualTime,
    pub from: EntityId,
    pub to: EntityId,
    pub flag: Flag,
}

impl Event {
    pub fn new(id: i32, time: VirtualTime, from: EntityId, to: EntityId) -> Self {
        Self {
            id,
            time,
            from,
            to,
            flag: Flag::Normal,
        }
    }

    /// The anti-event that cancels this one: same coordinates, negated id.
    pub fn anti(&self) -> Event {
        Event {
            id: -self.id,
            flag: Flag::Anti,
            ..*self
        }
    }

    pub fn is_anti(&self) -> bool {
        self.flag == Flag::Anti
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.id == other.id
    }
}

impl Eq for Event {}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// How an ACK settles ownership of the acknowledged message.
///
/// `Mine` releases the sender completely. `Yours` tells the sender a GVT
/// epoch was running at the receiver when the message landed, so the sender
/// must still count the message's send time in its next local-min report;
/// otherwise the reduction could commit a GVT above an in-flight event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AckKind {
    Mine,
    Yours,
}

/// Payload of an inter-LP message. Control traffic (GVT ticks, ACKs, abort)
/// travels the same FIFO channels as events so it cannot overtake them.
#[derive(Copy, Clone, Debug)]
pub enum Signal {
    Event(Event),
    GvtTick,
    Ack { id: i32, kind: AckKind },
    Abort,
}

/// One unit of channel traffic between two LPs.
#[derive(Copy, Clone, Debug)]
pub struct Message {
    pub from: Pid,
    pub to: Pid,
    pub body: Signal,
}

impl Message {
    pub fn event(&self) -> Option<&Event> {
        match &self.body {
            Signal::Event(event) => Some(event),
            _ => None,
        }
    }

    pub fn event_id(&self) -> Option<i32> {
        self.event().map(|event| event.id)
    }
}

/// A message copy stamped with the sender's virtual clock at send time. These
/// are what rollback walks to decide which anti-messages to emit, and what
/// the GVT local-min computation reads for unacknowledged traffic.
#[derive(Copy, Clone, Debug)]
pub struct TimedMessage {
    pub message: Message,
    pub at: VirtualTime,
}

/// Timestamp access for anything that lives in a time-ordered collection.
pub trait Timed {
    fn time(&self) -> VirtualTime;
}

impl Timed for Event {
    fn time(&self) -> VirtualTime {
        self.time
    }
}

impl Timed for TimedMessage {
    fn time(&self) -> VirtualTime {
        self.at
    }
}
