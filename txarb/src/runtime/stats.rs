//! Counters published by the arbiter, the dispatcher and clients.
//!
//! Everything is a relaxed atomic: the counters are read by an external
//! reporting layer and never drive scheduling decisions.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared statistics for one arbiter instance.
#[derive(Debug)]
pub struct SchedulerStats {
    /// Packets dropped because the forward buffer was full, per queue.
    queue_drops: Box<[AtomicU64]>,
    /// Sends refused because the client's backpressure flag was set.
    backpressure_drops: AtomicU64,
    /// Sends refused because the client's own mailbox was full.
    mailbox_full_drops: AtomicU64,
    /// Mailbox references that did not fit in a per-CPU queue.
    notify_failures: AtomicU64,
    /// Exiting clients that could not hand their mailbox to the arbiter.
    handover_failures: AtomicU64,
    /// Packets the arbiter moved into the forward buffer.
    forwarded: AtomicU64,
    /// Packets handed to the transmit sink.
    transmitted: AtomicU64,
    /// Packets dequeued by the dispatcher.
    dispatched: AtomicU64,
    /// Dead mailboxes released by the arbiter.
    reclaimed: AtomicU64,
    /// Rounds executed.
    rounds: AtomicU64,
    /// Average round duration over the last published window.
    round_avg_ns: AtomicU64,
    /// Longest round in the last published window.
    round_max_ns: AtomicU64,
    /// Average requests per round over the last published window, as `f64` bits.
    requests_per_round: AtomicU64,
}

impl SchedulerStats {
    #[must_use]
    pub fn new(queues: usize) -> Self {
        Self {
            queue_drops: (0..queues).map(|_| AtomicU64::new(0)).collect(),
            backpressure_drops: AtomicU64::new(0),
            mailbox_full_drops: AtomicU64::new(0),
            notify_failures: AtomicU64::new(0),
            handover_failures: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            transmitted: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            rounds: AtomicU64::new(0),
            round_avg_ns: AtomicU64::new(0),
            round_max_ns: AtomicU64::new(0),
            requests_per_round: AtomicU64::new(0f64.to_bits()),
        }
    }

    #[inline]
    pub(crate) fn record_queue_drop(&self, queue: usize) {
        if let Some(counter) = self.queue_drops.get(queue) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn record_backpressure_drop(&self) {
        self.backpressure_drops.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_mailbox_full_drop(&self) {
        self.mailbox_full_drops.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_notify_failure(&self) {
        self.notify_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_handover_failure(&self) {
        self.handover_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_forwarded(&self, n: u64) {
        self.forwarded.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_transmitted(&self, n: u64) {
        self.transmitted.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_dispatched(&self, n: u64) {
        self.dispatched.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_reclaimed(&self, n: u64) {
        self.reclaimed.fetch_add(n, Ordering::Relaxed);
    }

    /// Drops recorded against one per-CPU queue.
    #[must_use]
    pub fn queue_drops(&self, queue: usize) -> u64 {
        self.queue_drops
            .get(queue)
            .map_or(0, |counter| counter.load(Ordering::Relaxed))
    }

    /// Copies every counter into a plain struct.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queue_drops: self
                .queue_drops
                .iter()
                .map(|counter| counter.load(Ordering::Relaxed))
                .collect(),
            backpressure_drops: self.backpressure_drops.load(Ordering::Relaxed),
            mailbox_full_drops: self.mailbox_full_drops.load(Ordering::Relaxed),
            notify_failures: self.notify_failures.load(Ordering::Relaxed),
            handover_failures: self.handover_failures.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            transmitted: self.transmitted.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            rounds: self.rounds.load(Ordering::Relaxed),
            round_avg_ns: self.round_avg_ns.load(Ordering::Relaxed),
            round_max_ns: self.round_max_ns.load(Ordering::Relaxed),
            requests_per_round: f64::from_bits(self.requests_per_round.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of [`SchedulerStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub queue_drops: Vec<u64>,
    pub backpressure_drops: u64,
    pub mailbox_full_drops: u64,
    pub notify_failures: u64,
    pub handover_failures: u64,
    pub forwarded: u64,
    pub transmitted: u64,
    pub dispatched: u64,
    pub reclaimed: u64,
    pub rounds: u64,
    pub round_avg_ns: u64,
    pub round_max_ns: u64,
    pub requests_per_round: f64,
}

impl StatsSnapshot {
    /// Sum of all per-queue forward drops.
    #[must_use]
    pub fn total_queue_drops(&self) -> u64 {
        self.queue_drops.iter().sum()
    }
}

/// Arbiter-local accumulator published every `window` rounds.
#[derive(Debug)]
pub(crate) struct RollingWindow {
    window: u64,
    rounds: u64,
    total_ns: u64,
    max_ns: u64,
    requests: u64,
}

impl RollingWindow {
    pub(crate) fn new(window: u64) -> Self {
        Self {
            window: window.max(1),
            rounds: 0,
            total_ns: 0,
            max_ns: 0,
            requests: 0,
        }
    }

    /// Accounts one round; publishes and resets when the window is full.
    pub(crate) fn record(&mut self, duration_ns: u64, requests: u64, stats: &SchedulerStats) {
        stats.rounds.fetch_add(1, Ordering::Relaxed);

        self.rounds += 1;
        self.total_ns = self.total_ns.saturating_add(duration_ns);
        self.max_ns = self.max_ns.max(duration_ns);
        self.requests = self.requests.saturating_add(requests);

        if self.rounds < self.window {
            return;
        }

        stats.round_avg_ns.store(self.total_ns / self.rounds, Ordering::Relaxed);
        stats.round_max_ns.store(self.max_ns, Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let avg_requests = self.requests as f64 / self.rounds as f64;
        stats
            .requests_per_round
            .store(avg_requests.to_bits(), Ordering::Relaxed);

        self.rounds = 0;
        self.total_ns = 0;
        self.max_ns = 0;
        self.requests = 0;
    }
}
