//! Mailbox throughput and round-trip benchmark.
//!
//! Usage:
//!     cargo run --release --bin mailbox_bench
//!
//! Environment variables:
//!     PRODUCER_CPU=0  Pin producer to CPU 0 (default: 0)
//!     CONSUMER_CPU=2  Pin consumer to CPU 2 (default: 2)

use std::env;
use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use txarb::config::MailboxConfig;
use txarb::mailbox::{self, Consumer, Producer};
use txarb::runtime::topology::pin_to_core;

const ENTRIES: usize = 1 << 12;
const LINE_SIZE: usize = 64;
const ITERATIONS: usize = 1 << 22;

type Payload = Box<u64>;

fn get_cpu_affinity() -> (Option<usize>, Option<usize>) {
    let producer_cpu = env::var("PRODUCER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(0));
    let consumer_cpu = env::var("CONSUMER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(2));
    (producer_cpu, consumer_cpu)
}

fn pin_to_cpu(cpu: Option<usize>) {
    if let Some(id) = cpu {
        pin_to_core(id);
    }
}

fn channel() -> (Producer<Payload>, Consumer<Payload>) {
    mailbox::channel(MailboxConfig::new(ENTRIES, LINE_SIZE)).expect("valid geometry")
}

/// Inserts, spinning while the consumer has not cleared enough room.
fn insert_spin(producer: &Producer<Payload>, mut value: Payload) {
    loop {
        match producer.insert(value) {
            Ok(()) => return,
            Err(full) => value = full.into_inner(),
        }
        hint::spin_loop();
    }
}

/// Extracts, clearing consumed lines whenever the mailbox looks empty.
fn extract_spin(consumer: &Consumer<Payload>) -> Payload {
    loop {
        if let Some(value) = consumer.extract() {
            return value;
        }
        consumer.clear();
        hint::spin_loop();
    }
}

fn bench_throughput(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let (producer, consumer) = channel();

    let ready = Arc::new(AtomicBool::new(false));
    let ready_clone = ready.clone();

    // Consumer thread
    let consumer_thread = std::thread::spawn(move || {
        pin_to_cpu(consumer_cpu);
        ready_clone.store(true, Ordering::Release);

        for expected in 0..ITERATIONS as u64 {
            let value = extract_spin(&consumer);
            if *value != expected {
                panic!("Data corruption: expected {}, got {}", expected, *value);
            }
        }
        consumer.clear();
    });

    while !ready.load(Ordering::Acquire) {
        hint::spin_loop();
    }

    pin_to_cpu(producer_cpu);

    let start = Instant::now();

    for i in 0..ITERATIONS as u64 {
        insert_spin(&producer, Box::new(i));
    }

    consumer_thread.join().unwrap();
    let elapsed = start.elapsed();

    let ops_per_ms = ITERATIONS as u128 * 1_000_000 / elapsed.as_nanos();
    println!("{} ops/ms", ops_per_ms);
}

fn bench_rtt(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let (q1_producer, q1_consumer) = channel();
    let (q2_producer, q2_consumer) = channel();

    let ready = Arc::new(AtomicBool::new(false));
    let ready_clone = ready.clone();

    // Responder thread
    let responder = std::thread::spawn(move || {
        pin_to_cpu(consumer_cpu);
        ready_clone.store(true, Ordering::Release);

        for _ in 0..ITERATIONS {
            let value = extract_spin(&q1_consumer);
            insert_spin(&q2_producer, value);
        }
    });

    while !ready.load(Ordering::Acquire) {
        hint::spin_loop();
    }

    pin_to_cpu(producer_cpu);

    let start = Instant::now();

    let mut value = Box::new(0u64);
    for i in 0..ITERATIONS as u64 {
        *value = i;
        insert_spin(&q1_producer, value);
        value = extract_spin(&q2_consumer);
    }

    let elapsed = start.elapsed();
    responder.join().unwrap();

    let rtt_ns = elapsed.as_nanos() / ITERATIONS as u128;
    println!("{} ns RTT", rtt_ns);
}

fn main() {
    let (producer_cpu, consumer_cpu) = get_cpu_affinity();

    println!(
        "txarb mailbox (entries={}, line={}B, iters={}):",
        ENTRIES, LINE_SIZE, ITERATIONS
    );
    bench_throughput(producer_cpu, consumer_cpu);
    bench_rtt(producer_cpu, consumer_cpu);
}
