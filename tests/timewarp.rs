//! End-to-end simulations exercising the whole kernel: deterministic
//! ping-pong, forced stragglers with anti-message cleanup, ring and random
//! cross-traffic, fossil-threshold-driven GVT epochs, and the termination
//! boundaries.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use kairos::prelude::*;

/// Two LPs bounce one event chain back and forth with a +5 increment.
struct PingPong {
    step: u64,
    ids: AtomicI32,
}

impl EventHandler for PingPong {
    fn handle(&self, event: &Event, lp: &mut Lp) {
        let peer = 1 - lp.index();
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        let next = Event::new(id, event.time + self.step, event.to, peer as EntityId);
        lp.notice_event(next, peer).expect("send failed");
    }
}

#[test]
fn ping_pong_runs_clean_to_the_horizon() {
    let handler = Arc::new(PingPong {
        step: 5,
        ids: AtomicI32::new(1000),
    });
    let kernel = Kernel::setup(KernelConfig::new(2, 100), handler).unwrap();
    let reports = kernel
        .run(|lp| {
            if lp.index() == 0 {
                lp.schedule(Event::new(1, 0, 0, 0));
            }
            Ok(())
        })
        .unwrap();

    let total: u64 = reports.iter().map(|r| r.processed).sum();
    assert_eq!(total, 20); // events at t = 0, 5, ..., 95
    for report in &reports {
        assert_eq!(report.rollbacks, 0);
        assert!(report.gvt >= 100, "gvt stalled at {}", report.gvt);
        assert_eq!(kernel.state_of(report.pid), LpState::Stopped);
    }
    assert!(kernel.gvt_epochs() >= 1);
}

/// LP1 holds its reply until it has watched LP0 advance past virtual time 10,
/// then sends an event stamped 3: a guaranteed straggler. LP0 must roll back,
/// chase its sent messages with anti-messages, and re-execute; the committed
/// event counts end up identical to a serial execution.
struct StragglerHandler {
    watched: AtomicU64,
    ids: AtomicI32,
}

impl EventHandler for StragglerHandler {
    fn handle(&self, event: &Event, lp: &mut Lp) {
        if event.to == 0 {
            self.watched.fetch_max(event.time, Ordering::SeqCst);
            let id = self.ids.fetch_add(1, Ordering::Relaxed);
            lp.notice_event(Event::new(id, event.time + 5, 0, 1), 1)
                .expect("send failed");
        } else if event.time == 2 {
            while self.watched.load(Ordering::SeqCst) < 10 {
                thread::yield_now();
            }
            let id = self.ids.fetch_add(1, Ordering::Relaxed);
            lp.notice_event(Event::new(id, 3, 1, 0), 0).expect("send failed");
        }
    }
}

#[test]
fn straggler_forces_rollback_with_consistent_final_counts() {
    let handler = Arc::new(StragglerHandler {
        watched: AtomicU64::new(0),
        ids: AtomicI32::new(1000),
    });
    let kernel = Kernel::setup(KernelConfig::new(2, 40), handler).unwrap();
    let reports = kernel
        .run(|lp| {
            match lp.index() {
                0 => {
                    for t in 1..=30 {
                        lp.schedule(Event::new(t as i32, t, 0, 0));
                    }
                }
                _ => lp.schedule(Event::new(500, 2, 1, 1)),
            }
            Ok(())
        })
        .unwrap();

    // Serial execution: LP0 commits its 30 seeds plus the straggler; LP1
    // commits its seed plus 30 forwarded events plus the straggler's reply.
    assert_eq!(reports[0].processed, 31);
    assert_eq!(reports[1].processed, 32);
    assert!(reports[0].rollbacks >= 1, "no rollback happened");
    for report in &reports {
        assert!(report.gvt >= 40);
        assert_eq!(kernel.state_of(report.pid), LpState::Stopped);
    }
}

/// One event chain around a four-LP ring; entity i lives on LP i.
struct Ring {
    lps: usize,
    ids: AtomicI32,
}

impl EventHandler for Ring {
    fn handle(&self, event: &Event, lp: &mut Lp) {
        let next_entity = (event.to as usize + 1) % self.lps;
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        lp.notice_event(
            Event::new(id, event.time + 3, event.to, next_entity as EntityId),
            next_entity,
        )
        .expect("send failed");
    }
}

#[test]
fn ring_traffic_distributes_and_terminates() {
    let handler = Arc::new(Ring {
        lps: 4,
        ids: AtomicI32::new(1000),
    });
    let kernel = Kernel::setup(KernelConfig::new(4, 300), handler).unwrap();
    let reports = kernel
        .run(|lp| {
            if lp.index() == 0 {
                lp.schedule(Event::new(1, 0, 0, 0));
            }
            Ok(())
        })
        .unwrap();

    let total: u64 = reports.iter().map(|r| r.processed).sum();
    assert_eq!(total, 100); // t = 0, 3, ..., 297
    for report in &reports {
        assert_eq!(report.processed, 25);
        assert_eq!(report.rollbacks, 0);
        assert!(report.gvt >= 300);
    }
}

/// Uniform cross-LP traffic from a seeded generator; eight entities in
/// two-entity blocks across four LPs. Rollbacks are allowed here, but the
/// simulation must terminate with every frontier past the horizon and
/// rollback work bounded by useful work.
struct RandomTraffic {
    entities: usize,
    rng: Mutex<u64>,
    ids: AtomicI32,
}

impl RandomTraffic {
    fn next(&self, bound: u64) -> u64 {
        let mut state = self.rng.lock().unwrap();
        // xorshift64*, plenty for a workload generator
        *state ^= *state << 13;
        *state ^= *state >> 7;
        *state ^= *state << 17;
        (*state).wrapping_mul(0x2545_f491_4f6c_dd1d) % bound
    }

    fn owner(&self, entity: usize) -> Pid {
        entity / 2
    }
}

impl EventHandler for RandomTraffic {
    fn handle(&self, event: &Event, lp: &mut Lp) {
        let mut dest = self.next(self.entities as u64) as usize;
        if dest == event.to as usize {
            dest = (dest + 1) % self.entities;
        }
        let dt = 1 + self.next(9);
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        lp.notice_event(
            Event::new(id, event.time + dt, event.to, dest as EntityId),
            self.owner(dest),
        )
        .expect("send failed");
    }
}

#[test]
fn random_cross_traffic_converges() {
    let handler = Arc::new(RandomTraffic {
        entities: 8,
        rng: Mutex::new(0x9e37_79b9_7f4a_7c15),
        ids: AtomicI32::new(1000),
    });
    let traffic: Arc<dyn EventHandler> = handler.clone() as Arc<dyn EventHandler>;
    let kernel = Kernel::setup(KernelConfig::new(4, 300), traffic).unwrap();
    let reports = kernel
        .run(|lp| {
            for entity in 0..8usize {
                if handler.owner(entity) == lp.index() {
                    lp.schedule(Event::new(entity as i32 + 1, 0, 0, entity as EntityId));
                }
            }
            Ok(())
        })
        .unwrap();

    let total: u64 = reports.iter().map(|r| r.processed).sum();
    assert!(total > 100, "suspiciously little work: {total}");
    assert!(
        kernel.total_rollbacks() as u64 <= total,
        "more rollbacks ({}) than committed events ({total})",
        kernel.total_rollbacks()
    );
    for report in &reports {
        assert!(report.gvt >= 300, "lp {} gvt stalled at {}", report.pid, report.gvt);
        assert_eq!(kernel.state_of(report.pid), LpState::Stopped);
    }
}

#[test]
fn fossil_threshold_drives_gvt_epochs() {
    let handler = Arc::new(PingPong {
        step: 1,
        ids: AtomicI32::new(1000),
    });
    let config = KernelConfig::new(2, 3000).with_fossil_threshold(64);
    let kernel = Kernel::setup(config, handler).unwrap();
    let reports = kernel
        .run(|lp| {
            if lp.index() == 0 {
                lp.schedule(Event::new(1, 0, 0, 0));
            }
            Ok(())
        })
        .unwrap();

    let total: u64 = reports.iter().map(|r| r.processed).sum();
    assert_eq!(total, 3000);
    assert!(
        kernel.gvt_epochs() >= 2,
        "history growth never forced an epoch: {}",
        kernel.gvt_epochs()
    );
    for report in &reports {
        assert_eq!(report.rollbacks, 0);
        assert!(report.gvt >= 3000);
    }
}

#[test]
fn optimism_window_still_reaches_the_horizon() {
    let handler = Arc::new(PingPong {
        step: 5,
        ids: AtomicI32::new(1000),
    });
    let config = KernelConfig::new(2, 200).with_optimism_window(25);
    let kernel = Kernel::setup(config, handler).unwrap();
    let reports = kernel
        .run(|lp| {
            if lp.index() == 0 {
                lp.schedule(Event::new(1, 0, 0, 0));
            }
            Ok(())
        })
        .unwrap();

    let total: u64 = reports.iter().map(|r| r.processed).sum();
    assert_eq!(total, 40); // t = 0, 5, ..., 195
    for report in &reports {
        assert!(report.gvt >= 200);
        assert_eq!(kernel.state_of(report.pid), LpState::Stopped);
    }
}

#[test]
fn empty_start_terminates_within_one_broadcast() {
    let handler = Arc::new(|_: &Event, _: &mut Lp| {});
    let kernel = Kernel::setup(KernelConfig::new(3, 100), handler).unwrap();
    let reports = kernel.run(|_| Ok(())).unwrap();

    for report in &reports {
        assert_eq!(report.processed, 0);
        assert_eq!(report.rollbacks, 0);
        assert_eq!(kernel.state_of(report.pid), LpState::Stopped);
    }
    assert!(kernel.gvt_epochs() >= 1);
}

#[test]
fn zero_horizon_stops_before_any_event() {
    let handler = Arc::new(|_: &Event, _: &mut Lp| {
        panic!("no event may be dispatched with a zero horizon");
    });
    let kernel = Kernel::setup(KernelConfig::new(2, 0), handler).unwrap();
    let reports = kernel
        .run(|lp| {
            lp.schedule(Event::new(lp.index() as i32 + 1, 0, 0, 0));
            Ok(())
        })
        .unwrap();

    for report in &reports {
        assert_eq!(report.processed, 0);
        assert_eq!(kernel.state_of(report.pid), LpState::Stopped);
    }
}

/// A single LP degenerates to a sequential event loop: no rollbacks and
/// exactly one GVT epoch, requested at quiescence.
#[test]
fn single_lp_is_a_sequential_event_loop() {
    let ids = AtomicI32::new(1000);
    let handler = Arc::new(move |event: &Event, lp: &mut Lp| {
        let id = ids.fetch_add(1, Ordering::Relaxed);
        lp.notice_event(Event::new(id, event.time + 7, 0, 0), 0)
            .expect("self send failed");
    });
    let kernel = Kernel::setup(KernelConfig::new(1, 1000), handler).unwrap();
    let reports = kernel
        .run(|lp| {
            lp.schedule(Event::new(1, 0, 0, 0));
            Ok(())
        })
        .unwrap();

    assert_eq!(reports[0].processed, 143); // t = 0, 7, ..., 994
    assert_eq!(reports[0].rollbacks, 0);
    assert_eq!(kernel.gvt_epochs(), 1);
    assert!(reports[0].gvt >= 1000);
}
