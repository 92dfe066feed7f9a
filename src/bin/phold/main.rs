//! PHOLD synthetic benchmark driver. Entities are spread across the LPs in
//! contiguous blocks; every processed event regenerates exactly one new event
//! for a uniformly chosen other entity, with an exponentially distributed
//! time increment and a configurable amount of floating-point busy-work.

mod lcg;

use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use clap::Parser;

use kairos::prelude::*;
use lcg::Lcg16807;

#[derive(Parser, Debug)]
#[command(name = "phold", about = "PHOLD benchmark on the kairos Time Warp kernel")]
struct Args {
    /// Number of LPs; 0 means one per available CPU core.
    lps: usize,
    /// Number of simulated entities (must be at least 2 and >= the LP count).
    entities: usize,
    /// Path to the workload configuration file.
    #[arg(long, default_value = "phold.conf")]
    config: PathBuf,
}

/// Workload parameters read from the configuration file: three numeric
/// lines (event density, end time, FP ops per event), each optionally
/// followed by a `# comment`.
struct PholdConf {
    density: f64,
    end_time: VirtualTime,
    fp_ops: usize,
}

fn read_conf(path: &PathBuf) -> Result<PholdConf, Box<dyn Error>> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("cannot open workload configuration {path:?}: {e}"))?;
    let mut values = text
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|value| !value.is_empty());

    let density: f64 = values
        .next()
        .ok_or("configuration is missing the event density line")?
        .parse()?;
    let end_time: VirtualTime = values
        .next()
        .ok_or("configuration is missing the end time line")?
        .parse()?;
    let fp_ops: usize = values
        .next()
        .ok_or("configuration is missing the FP ops line")?
        .parse()?;
    Ok(PholdConf {
        density,
        end_time,
        fp_ops,
    })
}

/// Map an entity to the LP that owns it: contiguous blocks, with the first
/// `entities % lps` blocks one entity larger.
fn entity_to_lp(entity: usize, entities: usize, lps: usize) -> Pid {
    let rem = entities % lps;
    let base = entities / lps;
    if rem == 0 {
        entity / base
    } else if entity < rem * (base + 1) {
        entity / (base + 1)
    } else {
        rem + (entity - rem * (base + 1)) / base
    }
}

struct PholdDriver {
    lps: usize,
    entities: usize,
    fp_ops: usize,
    rng: Mutex<Lcg16807>,
    next_id: AtomicI32,
}

impl PholdDriver {
    fn new(lps: usize, entities: usize, fp_ops: usize) -> Self {
        Self {
            lps,
            entities,
            fp_ops,
            rng: Mutex::new(Lcg16807::new((lps + entities) as i64)),
            next_id: AtomicI32::new(1),
        }
    }

    /// Every event in the system is generated here. A fresh event starts at a
    /// random entity at time zero; a regenerated one continues from the
    /// entity and timestamp of the event it replaces.
    fn generate_event(&self, prev: Option<&Event>) -> Event {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let top = self.entities as i32 - 1;
        let (from, base_time) = match prev {
            Some(event) => (event.to, event.time),
            None => (rng.rand_int_uniform(0, top) as EntityId, 0),
        };
        let mut to = rng.rand_int_uniform(0, top) as EntityId;
        while to == from {
            to = rng.rand_int_uniform(0, top) as EntityId;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let time = base_time + rng.rand_int_exponential() as VirtualTime;
        Event::new(id, time, from, to)
    }

    /// FP busy-work standing in for real model computation: a few Newton
    /// iterations for an inverse square root.
    fn compute(&self) -> f64 {
        let z = 2.0_f64;
        let mut x = 0.5_f64;
        for _ in 0..self.fp_ops / 5 {
            x = 0.5 * x * (3.0 - z * x * x);
        }
        x
    }
}

impl EventHandler for PholdDriver {
    fn handle(&self, event: &Event, lp: &mut Lp) {
        let next = self.generate_event(Some(event));
        let receiver = entity_to_lp(next.to as usize, self.entities, self.lps);
        if let Err(err) = lp.notice_event(next, receiver) {
            tracing::error!(lp = lp.index(), %err, "failed to publish a regenerated event");
        }
        self.compute();
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("phold: {err}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let lps = if args.lps == 0 {
        let cores = thread::available_parallelism()?.get();
        println!("PHOLD: 0 LPs requested, using one per core ({cores})");
        cores
    } else {
        args.lps
    };
    if args.entities < 2 {
        return Err("at least two entities are required".into());
    }
    if args.entities < lps {
        return Err("there must be at least one entity per LP".into());
    }

    let conf = read_conf(&args.config)?;
    println!(
        "PHOLD: {} LPs, {} entities, density {}, end time {}, {} FP ops/event",
        lps, args.entities, conf.density, conf.end_time, conf.fp_ops
    );

    let n_events = (args.entities as f64 * conf.density) as usize;
    let driver = Arc::new(PholdDriver::new(lps, args.entities, conf.fp_ops));
    let initial: Vec<Event> = (0..n_events).map(|_| driver.generate_event(None)).collect();

    let handler: Arc<dyn EventHandler> = driver.clone() as Arc<dyn EventHandler>;
    let kernel = Kernel::setup(KernelConfig::new(lps, conf.end_time), handler)?;

    let entities = args.entities;
    let start = Instant::now();
    let reports = kernel.run(|lp| {
        let lp_index = lp.index();
        for event in initial
            .iter()
            .filter(|event| entity_to_lp(event.from as usize, entities, lps) == lp_index)
        {
            lp.schedule(*event);
        }
        Ok(())
    })?;
    let elapsed = start.elapsed();

    for report in &reports {
        println!("|----------------------------------------------|");
        println!("LOGICAL PROCESS {}", report.pid);
        println!("Number of processed events = {}", report.processed);
        println!("Number of rollbacks        = {}", report.rollbacks);
    }
    println!("|----------------------------------------------|");
    println!(
        "SIMULATION COMPLETED: virtual time reached {}",
        conf.end_time
    );
    println!("Wall clock time spent (ms): {}", elapsed.as_millis());
    println!("Number of GVT evaluations:  {}", kernel.gvt_epochs());
    println!("Total number of rollbacks:  {}", kernel.total_rollbacks());
    let total: u64 = reports.iter().map(|r| r.processed).sum();
    println!("Total processed events:     {total}");

    Ok(())
}
