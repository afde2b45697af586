//! Load generator for the scheduler.
//!
//! Spawns a scheduler and a number of producer threads that send fixed-size
//! packets as fast as they are admitted, then prints what got through and
//! the scheduler's counters.
//!
//! # Usage
//!
//! ```sh
//! scheduler_load --producers 4 --seconds 5 --rate 125000000 --size 1500 --mode batch
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use txarb::{
    DropReason, Scheduler, SchedulerConfig, SchedulerError, SchedulerHandle, SendError,
    TransmitMode,
};

/// Errors surfaced to the command line.
#[derive(Debug, thiserror::Error)]
enum LoadError {
    #[error("{0}")]
    Args(String),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("failed to encode statistics: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Command line options.
#[derive(Debug)]
struct Options {
    producers: usize,
    seconds: u64,
    rate: u64,
    size: usize,
    mode: TransmitMode,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            producers: 2,
            seconds: 3,
            rate: 0,
            size: 1500,
            mode: TransmitMode::BatchDispatch,
        }
    }
}

/// Per-producer outcome.
#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    admitted: u64,
    backpressure: u64,
    mailbox_full: u64,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("scheduler_load: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), LoadError> {
    txarb::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;
    eprintln!("scheduler_load: {options:?}");

    let config = SchedulerConfig {
        queues: options.producers.max(1),
        mode: options.mode,
        rate: options.rate,
        ..SchedulerConfig::default()
    };

    let transmitted_bytes = Arc::new(AtomicU64::new(0));
    let sink_bytes = Arc::clone(&transmitted_bytes);
    let sink = move |packet: Vec<u8>| {
        sink_bytes.fetch_add(packet.len() as u64, Ordering::Relaxed);
    };

    let handle = SchedulerHandle::<Vec<u8>>::new();
    let scheduler = Scheduler::spawn(&handle, config, sink)?;

    let deadline = Instant::now() + Duration::from_secs(options.seconds);
    let producers: Vec<_> = (0..options.producers)
        .map(|cpu| {
            let handle = handle.clone();
            let size = options.size;
            std::thread::spawn(move || produce(&handle, cpu, size, deadline))
        })
        .collect();

    let mut total = Tally::default();
    for producer in producers {
        let tally = producer.join().unwrap_or_default();
        total.admitted += tally.admitted;
        total.backpressure += tally.backpressure;
        total.mailbox_full += tally.mailbox_full;
    }

    let stats = Arc::clone(scheduler.stats());
    let discarded = scheduler.shutdown();
    let snapshot = stats.snapshot();

    let bytes = transmitted_bytes.load(Ordering::Relaxed);
    let elapsed = options.seconds.max(1);
    eprintln!(
        "scheduler_load: admitted={} backpressure={} mailbox_full={} discarded={}",
        total.admitted, total.backpressure, total.mailbox_full, discarded
    );
    eprintln!(
        "scheduler_load: transmitted {} bytes ({} B/s)",
        bytes,
        bytes / elapsed
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    Ok(())
}

fn produce(handle: &SchedulerHandle<Vec<u8>>, cpu: usize, size: usize, deadline: Instant) -> Tally {
    let mut client = handle.client(cpu);
    let mut tally = Tally::default();

    while Instant::now() < deadline {
        match client.send(vec![0u8; size]) {
            Ok(()) => tally.admitted += 1,
            Err(SendError::Dropped(DropReason::Backpressure)) => {
                tally.backpressure += 1;
                std::thread::yield_now();
            }
            Err(SendError::Dropped(DropReason::MailboxFull)) => {
                tally.mailbox_full += 1;
                std::thread::yield_now();
            }
            Err(SendError::Inactive(_) | SendError::Config(_)) => break,
        }
    }

    client.exit();
    tally
}

/// Parses command line arguments into [`Options`].
fn parse_args(args: &[String]) -> Result<Options, LoadError> {
    let mut options = Options::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        if matches!(flag, "--help" | "-h") {
            print_usage();
            std::process::exit(0);
        }

        i += 1;
        let value = args
            .get(i)
            .ok_or_else(|| LoadError::Args(format!("missing value for {flag}")))?;
        let invalid = |_| LoadError::Args(format!("invalid value for {flag}: {value}"));

        match flag {
            "--producers" | "-p" => options.producers = value.parse().map_err(invalid)?,
            "--seconds" | "-s" => options.seconds = value.parse().map_err(invalid)?,
            "--rate" | "-r" => options.rate = value.parse().map_err(invalid)?,
            "--size" => options.size = value.parse().map_err(invalid)?,
            "--mode" | "-m" => {
                options.mode = match value.as_str() {
                    "immediate" => TransmitMode::ImmediateSend,
                    "batch" => TransmitMode::BatchDispatch,
                    _ => return Err(LoadError::Args(format!("unknown mode: {value}"))),
                }
            }
            arg => return Err(LoadError::Args(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    Ok(options)
}

fn print_usage() {
    eprintln!(
        r#"scheduler_load - drive the transmit scheduler with synthetic producers

USAGE:
    scheduler_load [OPTIONS]

OPTIONS:
    -p, --producers <N>     Producer threads, one per-CPU queue each (default: 2)
    -s, --seconds <SECS>    Run time in seconds (default: 3)
    -r, --rate <BYTES/S>    Link rate, 0 for unlimited (default: 0)
        --size <BYTES>      Packet size (default: 1500)
    -m, --mode <MODE>       immediate | batch (default: batch)
    -h, --help              Print this help message

EXAMPLE:
    scheduler_load --producers 4 --seconds 5 --rate 125000000 --mode immediate
"#
    );
}
