//! Inter-LP transport: one bounded FIFO per destination LP, created once at
//! setup. Multiple producers, one consuming worker. `send` blocks when the
//! destination queue is full, which is the kernel's only backpressure against
//! runaway optimism in a fast sender.

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::event::{Message, Pid};
use crate::KairosError;

pub(crate) struct ChannelTable {
    senders: Vec<Sender<Message>>,
    // Clones of every receiver are parked here so a channel never disconnects
    // while a straggling ACK or duplicate abort is still addressed to an LP
    // whose worker has already finished.
    receivers: Vec<Receiver<Message>>,
}

impl ChannelTable {
    pub(crate) fn new(lps: usize, capacity: usize) -> Self {
        let mut senders = Vec::with_capacity(lps);
        let mut receivers = Vec::with_capacity(lps);
        for _ in 0..lps {
            let (tx, rx) = bounded(capacity);
            senders.push(tx);
            receivers.push(rx);
        }
        Self { senders, receivers }
    }

    /// Blocking send with backpressure.
    pub(crate) fn send(&self, msg: Message) -> Result<(), KairosError> {
        let tx = self
            .senders
            .get(msg.to)
            .ok_or(KairosError::UnknownLp(msg.to))?;
        tx.send(msg).map_err(|_| KairosError::ChannelClosed(msg.to))
    }

    /// Best-effort send for teardown paths; a full or missing queue is not an
    /// error when the simulation is already unwinding.
    pub(crate) fn try_send(&self, msg: Message) {
        if let Some(tx) = self.senders.get(msg.to) {
            let _ = tx.try_send(msg);
        }
    }

    pub(crate) fn receiver(&self, pid: Pid) -> Result<Receiver<Message>, KairosError> {
        self.receivers
            .get(pid)
            .cloned()
            .ok_or(KairosError::UnknownLp(pid))
    }
}
