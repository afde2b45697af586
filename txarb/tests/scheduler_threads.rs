//! End-to-end tests with the arbiter and dispatcher on their own threads.
//!
//! # Running with tracing
//!
//! ```bash
//! cargo test --features tracing --test scheduler_threads -- --nocapture
//! ```

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use txarb::runtime::topology::CpuConfig;
use txarb::{
    MailboxConfig, Scheduler, SchedulerConfig, SchedulerError, SchedulerHandle, SendError,
    StatsSnapshot, TransmitMode,
};

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        txarb::init_tracing();
    });
}

const PRODUCERS: u64 = 4;
const PER_PRODUCER: u64 = 5_000;
const DEADLINE: Duration = Duration::from_secs(20);

type Packet = Vec<u8>;
type Sent = Arc<Mutex<Vec<Packet>>>;

fn config(mode: TransmitMode) -> SchedulerConfig {
    SchedulerConfig {
        queues: PRODUCERS as usize,
        client_mailbox: MailboxConfig::new(1024, 128),
        queue_mailbox: MailboxConfig::new(256, 64),
        dispatch_mailbox: MailboxConfig::new(8192, 128),
        mode,
        round_interval: Duration::from_micros(10),
        cpu: CpuConfig::Disabled,
        ..SchedulerConfig::default()
    }
}

fn recording_sink() -> (Sent, impl FnMut(Packet) + Send + 'static) {
    let sent: Sent = Arc::default();
    let out = Arc::clone(&sent);
    (sent, move |packet| out.lock().unwrap().push(packet))
}

fn encode(producer: u64, seq: u64) -> Packet {
    let mut packet = producer.to_le_bytes().to_vec();
    packet.extend_from_slice(&seq.to_le_bytes());
    packet
}

fn decode(packet: &[u8]) -> (u64, u64) {
    let (producer, seq) = packet.split_at(8);
    (
        u64::from_le_bytes(producer.try_into().unwrap()),
        u64::from_le_bytes(seq.try_into().unwrap()),
    )
}

/// Sends `count` packets, retrying refused ones with the same sequence
/// number. Returns how many were admitted.
fn produce(handle: SchedulerHandle<Packet>, producer: u64, count: u64) -> u64 {
    let mut client = handle.client(producer as usize);
    let mut seq = 0;
    while seq < count {
        match client.send(encode(producer, seq)) {
            Ok(()) => seq += 1,
            Err(SendError::Dropped(_)) => thread::yield_now(),
            Err(err) => panic!("producer {producer}: {err}"),
        }
    }
    client.exit();
    seq
}

/// Spins until `done` holds or the deadline passes.
fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < DEADLINE {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    done()
}

/// Every producer's packets are delivered in increasing sequence order.
fn assert_per_producer_order(sent: &[Packet]) -> HashMap<u64, u64> {
    let mut last: HashMap<u64, u64> = HashMap::new();
    let mut counts: HashMap<u64, u64> = HashMap::new();
    for packet in sent {
        let (producer, seq) = decode(packet);
        if let Some(prev) = last.insert(producer, seq) {
            assert!(seq > prev, "producer {producer}: {seq} after {prev}");
        }
        *counts.entry(producer).or_default() += 1;
    }
    counts
}

fn run_producers(handle: &SchedulerHandle<Packet>) -> u64 {
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let handle = handle.clone();
            thread::spawn(move || produce(handle, producer, PER_PRODUCER))
        })
        .collect();
    producers.into_iter().map(|p| p.join().unwrap()).sum()
}

fn settled(stats: &StatsSnapshot, sent: &Sent, admitted: u64) -> bool {
    let delivered = sent.lock().unwrap().len() as u64;
    delivered + stats.total_queue_drops() == admitted
}

#[test]
fn batch_dispatch_delivers_in_order() {
    init_test_tracing();
    let handle = SchedulerHandle::new();
    let (sent, sink) = recording_sink();
    let scheduler = Scheduler::spawn(&handle, config(TransmitMode::BatchDispatch), sink).unwrap();
    assert!(handle.is_active());

    let admitted = run_producers(&handle);
    assert_eq!(admitted, PRODUCERS * PER_PRODUCER);

    let stats = Arc::clone(scheduler.stats());
    assert!(
        wait_for(|| settled(&stats.snapshot(), &sent, admitted)),
        "packets went missing: {:?}",
        stats.snapshot()
    );
    // Exited clients are freed by the next idle round.
    assert!(wait_for(|| stats.snapshot().reclaimed == PRODUCERS));
    assert_eq!(scheduler.shutdown(), 0);
    assert!(!handle.is_active());

    let snap = stats.snapshot();
    let sent = sent.lock().unwrap();
    let counts = assert_per_producer_order(&sent);
    assert_eq!(counts.values().sum::<u64>() + snap.total_queue_drops(), admitted);
    assert_eq!(snap.transmitted, sent.len() as u64);
    assert_eq!(snap.dispatched, snap.forwarded);
    assert_eq!(snap.reclaimed, PRODUCERS);
}

#[test]
fn immediate_send_delivers_in_order() {
    init_test_tracing();
    let handle = SchedulerHandle::new();
    let (sent, sink) = recording_sink();
    let scheduler = Scheduler::spawn(&handle, config(TransmitMode::ImmediateSend), sink).unwrap();

    let admitted = run_producers(&handle);

    let stats = Arc::clone(scheduler.stats());
    assert!(wait_for(|| settled(&stats.snapshot(), &sent, admitted)));
    assert_eq!(scheduler.shutdown(), 0);

    let snap = stats.snapshot();
    assert_eq!(snap.dispatched, 0);
    assert_eq!(snap.transmitted, snap.forwarded);
    assert_per_producer_order(&sent.lock().unwrap());
}

#[test]
fn second_scheduler_on_same_handle_is_rejected() {
    let handle = SchedulerHandle::<Packet>::new();
    let (_, sink) = recording_sink();
    let scheduler = Scheduler::spawn(&handle, config(TransmitMode::BatchDispatch), sink).unwrap();

    let (_, sink) = recording_sink();
    let err = Scheduler::spawn(&handle, config(TransmitMode::BatchDispatch), sink).unwrap_err();
    assert!(matches!(err, SchedulerError::AlreadyActive));

    scheduler.shutdown();

    let (_, sink) = recording_sink();
    let again = Scheduler::spawn(&handle, config(TransmitMode::BatchDispatch), sink).unwrap();
    again.shutdown();
}

#[test]
fn invalid_config_spawns_nothing() {
    let handle = SchedulerHandle::<Packet>::new();
    let (_, sink) = recording_sink();
    let bad = SchedulerConfig {
        dispatch_mailbox: MailboxConfig::new(100, 64),
        ..config(TransmitMode::BatchDispatch)
    };
    let err = Scheduler::spawn(&handle, bad, sink).unwrap_err();
    assert!(matches!(err, SchedulerError::Config(_)));
    assert!(!handle.is_active());
}

#[test]
fn clearing_enable_flag_retires_the_arbiter() {
    let handle = SchedulerHandle::new();
    let (_, sink) = recording_sink();
    let scheduler = Scheduler::spawn(&handle, config(TransmitMode::ImmediateSend), sink).unwrap();

    scheduler.enabled_flag().store(false, Ordering::Release);
    assert!(wait_for(|| !handle.is_active()));

    let mut client = handle.client(0);
    match client.send(encode(0, 0)) {
        Err(SendError::Inactive(packet)) => assert_eq!(decode(&packet), (0, 0)),
        other => panic!("expected Inactive, got {other:?}"),
    }
    scheduler.shutdown();
}

/// Disables, re-enables and checks that the same sink receives traffic
/// from the new arbiter.
fn disable_then_enable(mode: TransmitMode) {
    init_test_tracing();
    let handle = SchedulerHandle::new();
    let (sent, sink) = recording_sink();
    let scheduler = Scheduler::spawn(&handle, config(mode), sink).unwrap();
    let stats = Arc::clone(scheduler.stats());
    let flag = scheduler.enabled_flag();

    let mut client = handle.client(2);
    client.send(encode(2, 0)).unwrap();
    assert!(wait_for(|| sent.lock().unwrap().len() == 1));

    flag.store(false, Ordering::Release);
    assert!(wait_for(|| !handle.is_active()));
    assert!(matches!(client.send(encode(2, 1)), Err(SendError::Inactive(_))));

    flag.store(true, Ordering::Release);
    assert!(wait_for(|| handle.is_active()), "arbiter was not re-enabled");
    client.send(encode(2, 2)).unwrap();
    assert!(
        wait_for(|| sent.lock().unwrap().len() == 2),
        "nothing delivered after re-enable: {:?}",
        stats.snapshot()
    );

    // A second cycle works the same way.
    flag.store(false, Ordering::Release);
    assert!(wait_for(|| !handle.is_active()));
    flag.store(true, Ordering::Release);
    assert!(wait_for(|| handle.is_active()));
    client.send(encode(2, 3)).unwrap();
    assert!(wait_for(|| sent.lock().unwrap().len() == 3));

    assert_eq!(scheduler.shutdown(), 0);
    assert!(!handle.is_active());

    let seqs: Vec<u64> = sent.lock().unwrap().iter().map(|p| decode(p).1).collect();
    assert_eq!(seqs, vec![0, 2, 3]);
    assert_eq!(stats.snapshot().transmitted, 3);
}

#[test]
fn reenabling_batch_dispatch_resumes_delivery() {
    disable_then_enable(TransmitMode::BatchDispatch);
}

#[test]
fn reenabling_immediate_send_resumes_delivery() {
    disable_then_enable(TransmitMode::ImmediateSend);
}

#[test]
fn dropping_a_disabled_scheduler_stops_its_threads() {
    let handle = SchedulerHandle::<Packet>::new();
    let (_, sink) = recording_sink();
    let scheduler = Scheduler::spawn(&handle, config(TransmitMode::BatchDispatch), sink).unwrap();
    let flag = scheduler.enabled_flag();
    flag.store(false, Ordering::Release);
    assert!(wait_for(|| !handle.is_active()));
    drop(scheduler);

    // The arbiter thread is gone, so setting the flag installs nothing.
    flag.store(true, Ordering::Release);
    thread::sleep(Duration::from_millis(50));
    assert!(!handle.is_active());

    let (_, sink) = recording_sink();
    Scheduler::spawn(&handle, config(TransmitMode::BatchDispatch), sink)
        .unwrap()
        .shutdown();
}

#[test]
fn sends_after_shutdown_are_refused() {
    let handle = SchedulerHandle::new();
    let (sent, sink) = recording_sink();
    let scheduler = Scheduler::spawn(&handle, config(TransmitMode::BatchDispatch), sink).unwrap();

    let mut client = handle.client(1);
    client.send(encode(1, 0)).unwrap();
    assert!(wait_for(|| sent.lock().unwrap().len() == 1));

    scheduler.shutdown();
    assert!(matches!(client.send(encode(1, 1)), Err(SendError::Inactive(_))));
    assert_eq!(sent.lock().unwrap().len(), 1);
}

#[test]
fn rate_limited_link_stays_near_its_rate() {
    const RATE: u64 = 1_000_000;
    const SIZE: usize = 1_000;
    const RUN: Duration = Duration::from_millis(200);

    let handle = SchedulerHandle::new();
    let (sent, sink) = recording_sink();
    let config = SchedulerConfig {
        rate: RATE,
        arbiter_batch: 4,
        ..config(TransmitMode::ImmediateSend)
    };
    let scheduler = Scheduler::spawn(&handle, config, sink).unwrap();

    let start = Instant::now();
    let mut client = handle.client(0);
    while start.elapsed() < RUN {
        let _ = client.send(vec![0; SIZE]);
        thread::sleep(Duration::from_micros(50));
    }
    let elapsed = start.elapsed();
    scheduler.shutdown();

    let bound = (RATE as f64 * elapsed.as_secs_f64() / SIZE as f64).floor() as usize + 4;
    let transmitted = sent.lock().unwrap().len();
    assert!(transmitted <= bound, "{transmitted} > {bound}");
}
