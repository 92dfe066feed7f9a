//! The logical process: one worker thread around a virtual clock. Each pass
//! of the main loop drains the input channel completely (anti-messages and
//! control traffic get priority over local progress), dispatches at most one
//! event to the handler, and commits any GVT epoch that finished. Causality
//! violations are repaired locally: a straggler rolls the clock back,
//! processed events are resurrected into the future set, and every message
//! sent from the undone stretch of virtual time is chased with an
//! anti-message.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, TryRecvError};

use crate::event::{AckKind, Event, Message, Pid, Signal, TimedMessage, VirtualTime};
use crate::history::TimedList;
use crate::kernel::{Kernel, LpReport, LpState};
use crate::schedule::EventSchedule;
use crate::KairosError;

/// Per-LP mutable state. Owned by exactly one worker; peers only ever see
/// this LP through the shared state array and its input channel.
struct LocalData {
    index: Pid,
    sim_time: VirtualTime,
    gvt: VirtualTime,
    /// Unprocessed events, min-ordered.
    future: EventSchedule,
    /// Locally committed events, kept until fossil collection so rollback can
    /// resurrect them.
    processed: TimedList<Event>,
    /// Send-time-stamped copies of everything published from here; rollback
    /// walks these to synthesize anti-messages.
    sent: TimedList<TimedMessage>,
    /// Outbound messages still awaiting their ACK.
    unacked: TimedList<TimedMessage>,
    /// Messages ACKed with `Yours`: the receiver has them, but their send
    /// times must still weigh into this LP's next local-min report.
    acked: TimedList<TimedMessage>,
    /// Anti-events that arrived before their positives, stamped with the
    /// local clock at arrival. They do not contribute to local-min; their
    /// positives, still in flight, are counted on the sender's side.
    parked_antis: TimedList<Event>,
    /// Latched once this LP has reported into the running GVT epoch.
    gvt_flag: bool,
    n_processed: u64,
}

pub struct Lp {
    kernel: Arc<Kernel>,
    rx: Receiver<Message>,
    data: LocalData,
    /// Epoch count at the last quiescence-driven GVT request, so idling asks
    /// for at most one fresh epoch per committed one.
    last_quiesce_epoch: Option<usize>,
}

impl Lp {
    pub(crate) fn new(kernel: Arc<Kernel>, index: Pid, rx: Receiver<Message>) -> Self {
        Self {
            kernel,
            rx,
            data: LocalData {
                index,
                sim_time: 0,
                gvt: 0,
                future: EventSchedule::new(),
                processed: TimedList::new(),
                sent: TimedList::new(),
                unacked: TimedList::new(),
                acked: TimedList::new(),
                parked_antis: TimedList::new(),
                gvt_flag: false,
                n_processed: 0,
            },
            last_quiesce_epoch: None,
        }
    }

    pub fn index(&self) -> Pid {
        self.data.index
    }

    /// Current local virtual time.
    pub fn now(&self) -> VirtualTime {
        self.data.sim_time
    }

    /// Last GVT this LP committed.
    pub fn gvt(&self) -> VirtualTime {
        self.data.gvt
    }

    pub fn processed_count(&self) -> u64 {
        self.data.n_processed
    }

    /// Seed an event directly into the future set. Meant for initial
    /// population before [`Lp::simulate`] starts.
    pub fn schedule(&mut self, event: Event) {
        self.data.future.insert(event);
    }

    pub fn report(&self) -> LpReport {
        LpReport {
            pid: self.data.index,
            processed: self.data.n_processed,
            rollbacks: self.kernel.rollback_count(self.data.index),
            sim_time: self.data.sim_time,
            gvt: self.data.gvt,
        }
    }

    fn state(&self) -> LpState {
        self.kernel.state_of(self.data.index)
    }

    fn set_state(&self, state: LpState) {
        self.kernel.set_state(self.data.index, state);
    }

    /// Run until the simulation stops. On a fatal consistency error the LP
    /// aborts the whole simulation (best-effort) before propagating, so the
    /// sibling workers unwind instead of deadlocking on a silent peer.
    pub fn simulate(&mut self) -> Result<(), KairosError> {
        let result = self.run_loop();
        if let Err(ref err) = result {
            tracing::error!(lp = self.data.index, %err, "lp failed, aborting simulation");
            self.kernel.poison();
            self.kernel.abort_all_best_effort(self.data.index);
            self.halt();
        }
        result
    }

    fn run_loop(&mut self) -> Result<(), KairosError> {
        let end = self.kernel.end_time();
        loop {
            if self.state() == LpState::Stopped {
                return Ok(());
            }
            if self.kernel.is_poisoned() {
                self.halt();
                return Ok(());
            }

            self.drain_inputs()?;

            if self.data.gvt_flag && !self.kernel.gvt().is_evaluating() {
                if let Some(gvt) = self.kernel.gvt().committed() {
                    self.commit_gvt(gvt)?;
                }
            }

            if self.data.sim_time >= end {
                self.go_idle()?;
                continue;
            }

            if self.stalled() {
                // Throttled: keep serving the reduction so the frontier can
                // catch up, but dispatch nothing.
                if !self.kernel.gvt().is_evaluating() && !self.data.gvt_flag {
                    self.ask_for_new_gvt()?;
                }
                thread::yield_now();
                continue;
            }

            let advanced = self.manage_next_event()?;
            if !advanced {
                if self.data.future.is_empty()
                    && self.data.unacked.is_empty()
                    && self.rx.is_empty()
                {
                    // Nothing local, nothing in flight from here: quiesce.
                    self.go_idle()?;
                } else {
                    thread::yield_now();
                }
            }
        }
    }

    fn stalled(&self) -> bool {
        match self.kernel.config().optimism_window {
            Some(window) => self.data.sim_time > self.data.gvt.saturating_add(window),
            None => false,
        }
    }

    /// Empty the input channel completely before touching local events.
    fn drain_inputs(&mut self) -> Result<(), KairosError> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => self.dispatch(msg)?,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    return Err(KairosError::ChannelClosed(self.data.index))
                }
            }
        }
    }

    fn dispatch(&mut self, msg: Message) -> Result<(), KairosError> {
        match msg.body {
            Signal::GvtTick => {
                if self.state() != LpState::Stopped {
                    self.evaluate_local_min();
                }
                Ok(())
            }
            Signal::Abort => {
                self.halt();
                Ok(())
            }
            Signal::Ack { id, kind } => {
                self.got_ack(msg.from, id, kind);
                Ok(())
            }
            Signal::Event(event) => self.accept_event(msg.from, event),
        }
    }

    /// Incoming event path: acknowledge, annihilate against a parked anti,
    /// run anti-message cancellation, roll back on a straggler, and only then
    /// insert into the future set.
    fn accept_event(&mut self, from: Pid, event: Event) -> Result<(), KairosError> {
        self.send_ack(from, event.id)?;

        if self.match_parked_anti(&event) {
            return Ok(());
        }
        if event.is_anti() {
            return self.annihilate(event);
        }
        if event.time < self.data.sim_time {
            self.rollback(event.time)?;
        }
        self.data.future.insert(event);
        Ok(())
    }

    /// Every received event is acknowledged immediately. While this LP has a
    /// local-min report outstanding the ACK says `Yours`: the sender must
    /// keep counting the message in the running epoch, or the reduction could
    /// commit a GVT above it.
    fn send_ack(&mut self, to: Pid, id: i32) -> Result<(), KairosError> {
        let kind = if self.data.gvt_flag {
            AckKind::Yours
        } else {
            AckKind::Mine
        };
        self.kernel.send(Message {
            from: self.data.index,
            to,
            body: Signal::Ack { id, kind },
        })
    }

    fn got_ack(&mut self, from: Pid, id: i32, kind: AckKind) {
        let matched = self
            .data
            .unacked
            .remove_where(|tm| tm.message.to == from && tm.message.event_id() == Some(id));
        match matched {
            Some(tm) => {
                if kind == AckKind::Yours {
                    self.data.acked.insert(tm);
                }
            }
            // Benign: the matching entry can be gone when the ACK crossed a
            // rollback that already re-sent this message.
            None => tracing::warn!(
                lp = self.data.index,
                ack_id = id,
                from,
                "ack without a matching outgoing message"
            ),
        }
    }

    /// Dispatch at most one event. Returns false when nothing was dispatched:
    /// empty future set, or the next event lies at or past the horizon.
    fn manage_next_event(&mut self) -> Result<bool, KairosError> {
        let end = self.kernel.end_time();
        let t = match self.data.future.peek_min_time() {
            Some(t) => t,
            None => return Ok(false),
        };
        if t >= end {
            self.go_idle()?;
            return Ok(false);
        }
        if t > self.data.sim_time {
            self.data.sim_time = t;
        } else if t < self.data.sim_time {
            // Stragglers are caught on the incoming path before insertion, so
            // a past event here means the kernel itself is broken.
            return Err(KairosError::PastEvent {
                lp: self.data.index,
                event_time: t,
                sim_time: self.data.sim_time,
            });
        }
        let event = match self.data.future.extract_min() {
            Some(event) => event,
            None => return Ok(false),
        };

        let handler = self.kernel.handler();
        handler.handle(&event, self);

        self.data.n_processed += 1;
        self.data.processed.insert(event);
        if self.data.processed.len() > self.kernel.config().fossil_threshold
            && self.state() != LpState::EvalGvt
        {
            self.ask_for_new_gvt()?;
        }
        Ok(true)
    }

    /// Publish a newly produced event. Self-addressed events go straight into
    /// the local future set; anything else is enqueued on the receiver's
    /// channel. Either way a send-time-stamped copy is kept so rollback can
    /// chase it with an anti-message.
    pub fn notice_event(&mut self, event: Event, receiver: Pid) -> Result<(), KairosError> {
        let msg = Message {
            from: self.data.index,
            to: receiver,
            body: Signal::Event(event),
        };
        if receiver == self.data.index {
            self.data.future.insert(event);
        } else {
            self.send_tracked(msg)?;
        }
        self.data.sent.insert(TimedMessage {
            message: msg,
            at: self.data.sim_time,
        });
        if self.data.sent.len() > self.kernel.config().fossil_threshold
            && self.state() != LpState::EvalGvt
        {
            self.ask_for_new_gvt()?;
        }
        Ok(())
    }

    /// Enqueue on the receiver's channel and remember the message until its
    /// ACK settles ownership.
    fn send_tracked(&mut self, msg: Message) -> Result<(), KairosError> {
        self.data.unacked.insert(TimedMessage {
            message: msg,
            at: self.data.sim_time,
        });
        if self.data.unacked.len() > self.kernel.config().fossil_threshold
            && self.state() != LpState::EvalGvt
        {
            self.ask_for_new_gvt()?;
        }
        self.kernel.send(msg)
    }

    /// Repair a causality violation: rewind the clock to `t`, resurrect every
    /// processed event at or after it, and chase every message sent from the
    /// undone stretch with an anti-message. Self-addressed messages
    /// annihilate directly.
    fn rollback(&mut self, t: VirtualTime) -> Result<(), KairosError> {
        tracing::debug!(
            lp = self.data.index,
            from = self.data.sim_time,
            to = t,
            "rollback"
        );
        self.data.sim_time = t;

        for event in self.data.processed.drain_back_from(t) {
            self.data.future.insert(event);
            self.data.n_processed -= 1;
        }

        for tm in self.data.sent.drain_back_from(t) {
            if let Some(event) = tm.message.event() {
                let anti = event.anti();
                if tm.message.to == self.data.index {
                    self.annihilate(anti)?;
                } else {
                    self.send_tracked(Message {
                        from: self.data.index,
                        to: tm.message.to,
                        body: Signal::Event(anti),
                    })?;
                }
            }
        }

        self.kernel.add_rollback(self.data.index);
        Ok(())
    }

    /// Cancel the positive counterpart of `anti`. If it was already
    /// processed, first roll back to its time so it is sitting in the future
    /// set again; if it has not arrived yet, park the anti until it does.
    fn annihilate(&mut self, anti: Event) -> Result<(), KairosError> {
        let positive_id = -anti.id;
        let processed_at = self
            .data
            .processed
            .find(|event| event.id == positive_id)
            .map(|event| event.time);
        if let Some(t) = processed_at {
            self.rollback(t)?;
        }

        if self.data.future.delete_by_anti_id(&anti).is_none() {
            // Positive still in flight; stamp with the local clock and wait.
            let parked = Event {
                time: self.data.sim_time,
                ..anti
            };
            self.data.parked_antis.insert(parked);
        }
        Ok(())
    }

    /// True when `event` just annihilated with an anti that arrived first.
    fn match_parked_anti(&mut self, event: &Event) -> bool {
        self.data
            .parked_antis
            .remove_where(|anti| anti.id == -event.id)
            .is_some()
    }

    /// Open a GVT epoch: broadcast a tick to every live peer, then report our
    /// own local minimum. A lost race to open simply means someone else's
    /// tick is already on its way to us.
    fn ask_for_new_gvt(&mut self) -> Result<(), KairosError> {
        if self.state() == LpState::Stopped {
            return Ok(());
        }
        if !self.kernel.gvt().start_epoch() {
            return Ok(());
        }
        let me = self.data.index;
        for pid in 0..self.kernel.config().lps {
            if pid != me && self.kernel.state_of(pid) != LpState::Stopped {
                self.kernel.send(Message {
                    from: me,
                    to: pid,
                    body: Signal::GvtTick,
                })?;
            }
        }
        self.evaluate_local_min();
        Ok(())
    }

    /// Report into the running epoch: the minimum over the earliest pending
    /// event, the oldest unacknowledged send, and the oldest `Yours`-acked
    /// send of this epoch. Parked anti-events are deliberately excluded;
    /// their positives are counted by the LP that sent them.
    fn evaluate_local_min(&mut self) {
        self.set_state(LpState::EvalGvt);
        let mut mintime = VirtualTime::MAX;
        let candidates = [
            self.data.future.peek_min_time(),
            self.data.unacked.min_time(),
            self.data.acked.min_time(),
        ];
        for t in candidates.into_iter().flatten() {
            mintime = mintime.min(t);
        }
        self.kernel.gvt().contribute(self.data.index, mintime);
        self.data.gvt_flag = true;
        self.data.acked.clear();
    }

    /// Adopt a committed GVT: fossil-collect history below it and return to
    /// normal running.
    fn commit_gvt(&mut self, gvt: VirtualTime) -> Result<(), KairosError> {
        if self.state() == LpState::Stopped {
            return Ok(());
        }
        if gvt < self.data.gvt {
            return Err(KairosError::GvtRegression {
                lp: self.data.index,
                committed: gvt,
                previous: self.data.gvt,
            });
        }
        self.data.gvt_flag = false;
        self.data.gvt = gvt;
        self.data.processed.delete_before(gvt);
        self.data.sent.delete_before(gvt);
        self.data.acked.clear();
        self.set_state(LpState::Running);
        tracing::debug!(lp = self.data.index, gvt, "gvt adopted");
        Ok(())
    }

    /// Horizon or quiescence reached. The LP first makes sure the frontier
    /// has caught up (one fresh epoch per committed one while GVT is below
    /// the horizon), refuses to idle while its own output is unacknowledged
    /// (an in-flight event pins its sender, which is what makes the all-idle
    /// check sound), then either wins termination or parks on the channel.
    fn go_idle(&mut self) -> Result<(), KairosError> {
        if self.state() == LpState::Stopped {
            return Ok(());
        }
        let end = self.kernel.end_time();

        if self.data.gvt < end && !self.data.gvt_flag && !self.kernel.gvt().is_evaluating() {
            let epoch = self.kernel.gvt().epochs();
            if self.last_quiesce_epoch != Some(epoch) {
                self.last_quiesce_epoch = Some(epoch);
                return self.ask_for_new_gvt();
            }
        }

        if !self.data.unacked.is_empty() {
            thread::yield_now();
            return Ok(());
        }

        self.set_state(LpState::Idle);
        // Killing while a reduction is still collecting would strand peers
        // with a stale frontier; the epoch's last contributor is always awake
        // afterwards to re-run this check, so waiting is safe.
        if self.kernel.all_idle() && !self.kernel.gvt().is_evaluating() {
            tracing::debug!(lp = self.data.index, "all idle, broadcasting abort");
            self.kernel.broadcast_abort(self.data.index)?;
            self.halt();
            return Ok(());
        }

        if self.kernel.is_poisoned() {
            self.halt();
            return Ok(());
        }
        let msg = self
            .rx
            .recv()
            .map_err(|_| KairosError::ChannelClosed(self.data.index))?;
        self.dispatch(msg)?;
        if self.state() != LpState::Stopped {
            self.set_state(LpState::Running);
        }
        Ok(())
    }

    /// Terminal transition. Adopts the latest committed GVT for one final
    /// fossil collection, then retires from the reduction for good.
    /// Idempotent; abort messages may arrive more than once.
    fn halt(&mut self) {
        if let Some(gvt) = self.kernel.gvt().committed() {
            if gvt > self.data.gvt {
                self.data.gvt = gvt;
                self.data.gvt_flag = false;
                self.data.processed.delete_before(gvt);
                self.data.sent.delete_before(gvt);
            }
        }
        self.set_state(LpState::Stopped);
        self.kernel.gvt().retire(self.data.index);
    }
}
