//! The arbiter: round-robin drain, rate limit, forward, reclaim.
//!
//! One [`Arbiter`] owns every per-CPU queue of a handle. Each call to
//! [`Arbiter::run_round`] visits the queues in index order, moves every
//! available packet into the forward buffer, and frees dead mailboxes only
//! after a round in which no queue produced anything.
//!
//! In [`TransmitMode::ImmediateSend`] the forward buffer is drained by the
//! arbiter itself through a byte-rate limiter. In
//! [`TransmitMode::BatchDispatch`] it is the input of a [`Dispatcher`].
//!
//! The forward buffer, the transmit side and the counters live in a
//! `Backend` that outlives a single activation: a stopped arbiter gives it
//! back so the next one installed in the same handle transmits through the
//! same sink.

use std::sync::Arc;

use crate::config::{SchedulerConfig, TransmitMode};
use crate::handle::{Registry, SchedulerHandle};
use crate::mailbox::{self, Consumer, Producer};
use crate::packet::{Packet, TransmitSink};
use crate::runtime::clock::{Clock, MonotonicClock};
use crate::runtime::dispatcher::Dispatcher;
use crate::runtime::queue::{self, MailboxRef, PerCpuQueue, drain_mailbox};
use crate::runtime::stats::{RollingWindow, SchedulerStats};
use crate::scheduler::SchedulerError;
use crate::trace::{debug, error, info, trace};

/// What one round did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// Packets taken from client mailboxes.
    pub requests: usize,
    /// Packets dropped because the forward buffer was full.
    pub dropped: usize,
    /// Packets handed to the sink (immediate mode only).
    pub transmitted: usize,
    /// Dead mailboxes released.
    pub reclaimed: usize,
}

impl RoundReport {
    /// True if the round moved nothing at all.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.requests == 0 && self.transmitted == 0
    }
}

/// Where forwarded packets go.
enum Egress<P: Packet, S> {
    /// The arbiter drains its own forward buffer into the sink.
    Immediate {
        buffer: Consumer<Box<P>>,
        sink: S,
        limiter: RateLimiter,
    },
    /// A dispatcher drains the forward buffer.
    Batch,
}

/// Virtual link clock in picoseconds.
#[derive(Debug)]
struct RateLimiter {
    picos_per_byte: u128,
    /// Instant the link becomes idle.
    link_idle: u128,
}

impl RateLimiter {
    fn new(picos_per_byte: u64) -> Self {
        Self {
            picos_per_byte: u128::from(picos_per_byte),
            link_idle: 0,
        }
    }

    #[inline]
    fn ready(&self, now: u128) -> bool {
        self.link_idle <= now
    }

    #[inline]
    fn consume(&mut self, bytes: usize) {
        self.link_idle += bytes as u128 * self.picos_per_byte;
    }

    /// Idle time never accrues as credit: a link that went quiet restarts
    /// from `now`.
    #[inline]
    fn settle(&mut self, now: u128) {
        if self.link_idle < now {
            self.link_idle = now;
        }
    }

    /// Forgets the virtual clock; a new activation starts a new time base.
    fn reset(&mut self) {
        self.link_idle = 0;
    }
}

/// State an arbiter hands from one activation to the next.
pub(crate) struct Backend<P: Packet, S: TransmitSink<P>> {
    forward: Producer<Box<P>>,
    egress: Egress<P, S>,
    stats: Arc<SchedulerStats>,
}

impl<P: Packet, S: TransmitSink<P>> Backend<P, S> {
    /// Validates `config` and builds the forward buffer and transmit side.
    ///
    /// Returns the dispatcher as well in batch-dispatch mode. It keeps
    /// draining the same forward buffer for every later activation.
    #[allow(clippy::type_complexity)]
    pub(crate) fn new(
        config: &SchedulerConfig,
        sink: S,
    ) -> Result<(Self, Option<Dispatcher<P, S>>), SchedulerError> {
        if let Err(err) = config.validate() {
            error!(%err, "scheduler configuration rejected");
            return Err(err.into());
        }

        let stats = Arc::new(SchedulerStats::new(config.queues));
        let (forward, buffer) = mailbox::channel(config.dispatch_mailbox)?;

        let (egress, dispatcher) = match config.mode {
            TransmitMode::ImmediateSend => {
                let limiter = RateLimiter::new(config.picos_per_byte());
                (Egress::Immediate { buffer, sink, limiter }, None)
            }
            TransmitMode::BatchDispatch => {
                let dispatcher =
                    Dispatcher::new(buffer, sink, config.dispatcher_batch, Arc::clone(&stats));
                (Egress::Batch, Some(dispatcher))
            }
        };

        let backend = Self {
            forward,
            egress,
            stats,
        };
        Ok((backend, dispatcher))
    }

    /// Discards what the arbiter forwarded but did not transmit itself.
    fn discard_forwarded(&mut self) -> usize {
        let Egress::Immediate { buffer, .. } = &self.egress else {
            return 0;
        };
        let mut discarded = 0;
        while buffer.extract().is_some() {
            discarded += 1;
        }
        buffer.clear();
        discarded
    }
}

/// Keeps one registry installed in a handle; retires it when dropped.
struct Activation<P: Packet> {
    handle: SchedulerHandle<P>,
    registry: Arc<Registry<P>>,
}

impl<P: Packet> Drop for Activation<P> {
    fn drop(&mut self) {
        self.handle.retire(self.registry.epoch);
    }
}

/// The scheduling core.
///
/// Dropping an arbiter retires it from its handle without draining.
pub struct Arbiter<P: Packet, S: TransmitSink<P>, C: Clock = MonotonicClock> {
    activation: Activation<P>,
    queues: Box<[PerCpuQueue<P>]>,
    /// Dead, empty mailboxes waiting for an all-empty round.
    deferred: Vec<MailboxRef<P>>,
    backend: Backend<P, S>,
    arbiter_batch: usize,
    clock: C,
    window: RollingWindow,
}

impl<P: Packet, S: TransmitSink<P>> Arbiter<P, S> {
    /// Builds an arbiter on the monotonic clock and installs it in `handle`.
    ///
    /// Returns the dispatcher as well in batch-dispatch mode.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Config`] for an invalid configuration and
    /// [`SchedulerError::AlreadyActive`] if `handle` already has an arbiter.
    #[allow(clippy::type_complexity)]
    pub fn new(
        handle: &SchedulerHandle<P>,
        config: &SchedulerConfig,
        sink: S,
    ) -> Result<(Self, Option<Dispatcher<P, S>>), SchedulerError> {
        Self::with_clock(handle, config, sink, MonotonicClock::new())
    }
}

impl<P: Packet, S: TransmitSink<P>, C: Clock> Arbiter<P, S, C> {
    /// Same as [`Arbiter::new`] with an explicit time source.
    ///
    /// # Errors
    ///
    /// See [`Arbiter::new`].
    #[allow(clippy::type_complexity)]
    pub fn with_clock(
        handle: &SchedulerHandle<P>,
        config: &SchedulerConfig,
        sink: S,
        clock: C,
    ) -> Result<(Self, Option<Dispatcher<P, S>>), SchedulerError> {
        let (backend, dispatcher) = Backend::new(config, sink)?;
        let arbiter = Self::install(handle, config, backend, clock).map_err(|(err, _)| err)?;
        Ok((arbiter, dispatcher))
    }

    /// Installs a fresh arbiter in `handle` on top of an existing backend.
    ///
    /// Clients bound to an earlier activation rebind on their next send.
    /// On failure the backend is handed back untouched.
    pub(crate) fn install(
        handle: &SchedulerHandle<P>,
        config: &SchedulerConfig,
        mut backend: Backend<P, S>,
        clock: C,
    ) -> Result<Self, (SchedulerError, Backend<P, S>)> {
        let mut inboxes = Vec::with_capacity(config.queues);
        let mut queues = Vec::with_capacity(config.queues);
        for index in 0..config.queues {
            match queue::pair(index, config.queue_mailbox) {
                Ok((inbox, queue)) => {
                    inboxes.push(inbox);
                    queues.push(queue);
                }
                Err(err) => return Err((err.into(), backend)),
            }
        }

        let activated = handle.activate(|epoch| Registry {
            epoch,
            client_mailbox: config.client_mailbox,
            inboxes: inboxes.into_boxed_slice(),
            stats: Arc::clone(&backend.stats),
        });
        let registry = match activated {
            Ok(registry) => registry,
            Err(err) => return Err((err, backend)),
        };

        if let Egress::Immediate { limiter, .. } = &mut backend.egress {
            limiter.reset();
        }

        info!(
            epoch = registry.epoch,
            queues = config.queues,
            mode = ?config.mode,
            rate = config.rate,
            "arbiter active"
        );

        Ok(Self {
            activation: Activation {
                handle: handle.clone(),
                registry,
            },
            queues: queues.into_boxed_slice(),
            deferred: Vec::new(),
            backend,
            arbiter_batch: config.arbiter_batch,
            clock,
            window: RollingWindow::new(config.stats_window),
        })
    }

    /// Shared counters of this arbiter.
    #[must_use]
    pub fn stats(&self) -> &Arc<SchedulerStats> {
        &self.backend.stats
    }

    /// Runs one scheduling round.
    pub fn run_round(&mut self) -> RoundReport {
        let start = self.clock.now();
        let mut report = RoundReport::default();
        let mut all_empty = true;

        for index in 0..self.queues.len() {
            if let Some(next) = self.queues.get(index + 1) {
                next.prefetch();
            }

            let queue = &mut self.queues[index];
            let mut served = 0;
            while let Some(packet) = queue.next_packet(&mut self.deferred) {
                served += 1;
                if self.backend.forward.insert(packet).is_err() {
                    queue.throttle_current();
                    self.backend.stats.record_queue_drop(queue.index());
                    report.dropped += 1;
                    trace!(queue = queue.index(), "forward buffer full, packet dropped");
                }
            }

            if served > 0 {
                all_empty = false;
                report.requests += served;
            }
        }

        if all_empty && !self.deferred.is_empty() {
            report.reclaimed = self.reclaim();
        }

        for queue in self.queues.iter_mut() {
            queue.ack();
        }

        self.backend
            .stats
            .add_forwarded((report.requests - report.dropped) as u64);

        report.transmitted = self.transmit();

        let elapsed = self.clock.now().since(start);
        self.window
            .record(elapsed, report.requests as u64, &self.backend.stats);

        report
    }

    /// Releases deferred mailboxes that are still dead and empty.
    fn reclaim(&mut self) -> usize {
        let before = self.deferred.len();
        // SAFETY: the arbiter is the only consumer of every deferred mailbox.
        self.deferred
            .retain(|mailbox| !(mailbox.is_dead() && unsafe { mailbox.is_empty() }));
        let reclaimed = before - self.deferred.len();

        self.backend.stats.add_reclaimed(reclaimed as u64);
        debug!(reclaimed, "dead mailboxes reclaimed");
        reclaimed
    }

    /// Drains the forward buffer through the rate limiter (immediate mode).
    fn transmit(&mut self) -> usize {
        let Egress::Immediate {
            buffer,
            sink,
            limiter,
        } = &mut self.backend.egress
        else {
            return 0;
        };

        let now = self.clock.now().as_picos();
        limiter.settle(now);
        let mut sent = 0;
        while sent < self.arbiter_batch && limiter.ready(now) {
            let Some(packet) = buffer.extract() else {
                break;
            };
            limiter.consume(packet.wire_len());
            sink.transmit(*packet);
            sent += 1;
        }
        buffer.clear();

        if sent > 0 {
            self.backend.stats.add_transmitted(sent as u64);
        }
        sent
    }

    /// Retires the arbiter and discards every packet it can reach.
    ///
    /// Producers see no active arbiter from this point on. Returns the number
    /// of packets discarded. Statistics are left untouched.
    pub fn shutdown(self) -> usize {
        self.stop().0
    }

    /// Same as [`Arbiter::shutdown`], also returning the backend so a later
    /// activation can reuse it.
    pub(crate) fn stop(self) -> (usize, Backend<P, S>) {
        let Self {
            activation,
            mut queues,
            mut deferred,
            mut backend,
            ..
        } = self;
        info!(epoch = activation.registry.epoch, "arbiter retiring");
        drop(activation);

        let mut discarded: usize = queues.iter_mut().map(PerCpuQueue::drain).sum();
        discarded += deferred
            .drain(..)
            .map(|mailbox| drain_mailbox(&mailbox))
            .sum::<usize>();
        discarded += backend.discard_forwarded();

        info!(discarded, "arbiter shut down");
        (discarded, backend)
    }
}
