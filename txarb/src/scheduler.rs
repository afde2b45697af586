//! Worker threads around an [`Arbiter`] and its [`Dispatcher`].
//!
//! # Architecture
//!
//! [`Scheduler::spawn`] starts up to two threads:
//! - **Arbiter thread** (`txarb-arbiter`): runs rounds while the enable flag
//!   is set, sleeping `round_interval` after rounds that moved nothing. When
//!   the flag clears it retires the arbiter, drains every queue and waits;
//!   when the flag is set again it installs a fresh arbiter on the same
//!   handle, transmitting through the same sink. The thread exits only on
//!   [`Scheduler::shutdown`] or drop.
//! - **Dispatcher thread** (`txarb-dispatcher`, batch-dispatch mode only):
//!   drains the forward buffer into the sink until told to stop, then
//!   discards what is left.
//!
//! Producers never block on either thread. They keep sending through their
//! [`Client`](crate::client::Client) and get
//! [`SendError::Inactive`](crate::client::SendError::Inactive) while no
//! arbiter is installed.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::{ConfigError, SchedulerConfig};
use crate::handle::SchedulerHandle;
use crate::packet::{Packet, TransmitSink};
use crate::runtime::arbiter::{Arbiter, Backend};
use crate::runtime::clock::MonotonicClock;
use crate::runtime::dispatcher::Dispatcher;
use crate::runtime::stats::SchedulerStats;
use crate::runtime::topology::pin_to_core;
use crate::trace::{debug, error, info, warn};

/// Errors raised while bringing a scheduler up.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// The handle already has an active arbiter.
    #[error("a scheduler is already active on this handle")]
    AlreadyActive,
    /// A worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Handle to running worker threads.
///
/// Dropping the handle stops both threads but does not wait for them to
/// exit. Use [`Scheduler::shutdown`] for a graceful shutdown with join.
pub struct Scheduler {
    /// Sampled by the arbiter thread once per round.
    enabled: Arc<AtomicBool>,
    /// Tells the arbiter thread to exit.
    arbiter_stop: Arc<AtomicBool>,
    /// Tells the dispatcher to stop once the arbiter is gone.
    dispatcher_stop: Arc<AtomicBool>,
    stats: Arc<SchedulerStats>,
    arbiter_handle: Option<JoinHandle<usize>>,
    dispatcher_handle: Option<JoinHandle<usize>>,
}

impl Scheduler {
    /// Installs an arbiter in `handle` and spawns its threads.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The configuration is invalid
    /// - `handle` already has an active arbiter
    /// - A worker thread cannot be spawned
    pub fn spawn<P, S>(
        handle: &SchedulerHandle<P>,
        config: SchedulerConfig,
        sink: S,
    ) -> Result<Self, SchedulerError>
    where
        P: Packet,
        S: TransmitSink<P>,
    {
        info!(
            queues = config.queues,
            mode = ?config.mode,
            rate = config.rate,
            round_interval_us = config.round_interval.as_micros() as u64,
            cpu = ?config.cpu,
            "scheduler starting"
        );

        let (arbiter, dispatcher) = Arbiter::new(handle, &config, sink)?;
        let stats = Arc::clone(arbiter.stats());
        let placement = config.cpu.resolve();
        debug!(
            strategy = %placement.strategy,
            arbiter_core = ?placement.arbiter_core,
            dispatcher_core = ?placement.dispatcher_core,
            "thread placement resolved"
        );

        let enabled = Arc::new(AtomicBool::new(true));
        let arbiter_stop = Arc::new(AtomicBool::new(false));
        let dispatcher_stop = Arc::new(AtomicBool::new(false));
        let interval = config.round_interval;

        let dispatcher_handle = match dispatcher {
            Some(dispatcher) => {
                debug!("spawning dispatcher thread");
                let stop = Arc::clone(&dispatcher_stop);
                let core = placement.dispatcher_core;
                let spawned = thread::Builder::new()
                    .name("txarb-dispatcher".into())
                    .spawn(move || dispatcher_main(dispatcher, &stop, interval, core));
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        error!(%err, "failed to spawn dispatcher thread");
                        arbiter.shutdown();
                        return Err(SchedulerError::Spawn(err));
                    }
                }
            }
            None => None,
        };

        debug!("spawning arbiter thread");
        let flags = ArbiterFlags {
            enabled: Arc::clone(&enabled),
            stop: Arc::clone(&arbiter_stop),
        };
        let core = placement.arbiter_core;
        let slot = handle.clone();
        let spawned = thread::Builder::new()
            .name("txarb-arbiter".into())
            .spawn(move || arbiter_main(arbiter, &slot, &config, &flags, core));
        let arbiter_handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                // The arbiter was dropped with the closure, which retired it.
                error!(%err, "failed to spawn arbiter thread");
                dispatcher_stop.store(true, Ordering::Release);
                if let Some(handle) = dispatcher_handle {
                    let _ = handle.join();
                }
                return Err(SchedulerError::Spawn(err));
            }
        };

        info!("scheduler started successfully");

        Ok(Self {
            enabled,
            arbiter_stop,
            dispatcher_stop,
            stats,
            arbiter_handle: Some(arbiter_handle),
            dispatcher_handle,
        })
    }

    /// Stops both threads and waits for them to exit.
    ///
    /// This method:
    /// 1. Stops the arbiter thread, which retires and drains the arbiter
    /// 2. Waits for it
    /// 3. Stops and waits for the dispatcher thread, which drains its buffer
    ///
    /// Returns the number of in-flight packets discarded, including those
    /// discarded by earlier disables.
    pub fn shutdown(mut self) -> usize {
        info!("scheduler shutdown initiated");
        self.arbiter_stop.store(true, Ordering::Release);

        let mut discarded = 0;
        if let Some(handle) = self.arbiter_handle.take() {
            debug!("waiting for arbiter thread to exit");
            discarded += join_worker(handle, "arbiter");
        }

        self.dispatcher_stop.store(true, Ordering::Release);
        if let Some(handle) = self.dispatcher_handle.take() {
            debug!("waiting for dispatcher thread to exit");
            discarded += join_worker(handle, "dispatcher");
        }

        info!(discarded, "scheduler shutdown complete");
        discarded
    }

    /// Counters of the running arbiter.
    #[must_use]
    pub fn stats(&self) -> &Arc<SchedulerStats> {
        &self.stats
    }

    /// Returns a clone of the enable flag for external control.
    ///
    /// Clearing it retires the arbiter and discards what it holds, as
    /// [`Scheduler::shutdown`] does, but the threads keep running. Setting it
    /// again installs a new arbiter on the same handle; clients rebind on
    /// their next send.
    #[must_use]
    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.enabled)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.arbiter_stop.store(true, Ordering::Release);
        self.dispatcher_stop.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("enabled", &self.enabled.load(Ordering::Relaxed))
            .field("stopping", &self.arbiter_stop.load(Ordering::Relaxed))
            .field("dispatcher", &self.dispatcher_handle.is_some())
            .finish_non_exhaustive()
    }
}

/// Controls shared with the arbiter thread.
struct ArbiterFlags {
    enabled: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

/// The arbiter thread either runs an installed arbiter or holds the backend
/// of a disabled one until the enable flag is set again.
enum Worker<P: Packet, S: TransmitSink<P>> {
    Active(Arbiter<P, S>),
    Disabled(Backend<P, S>),
}

#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
fn arbiter_main<P, S>(
    arbiter: Arbiter<P, S>,
    handle: &SchedulerHandle<P>,
    config: &SchedulerConfig,
    flags: &ArbiterFlags,
    core: Option<usize>,
) -> usize
where
    P: Packet,
    S: TransmitSink<P>,
{
    pin_worker("arbiter", core);
    info!("arbiter thread started");

    let interval = config.round_interval;
    let mut worker = Worker::Active(arbiter);
    let mut discarded = 0;

    while !flags.stop.load(Ordering::Acquire) {
        let enabled = flags.enabled.load(Ordering::Acquire);
        worker = match worker {
            Worker::Active(mut arbiter) if enabled => {
                if arbiter.run_round().is_idle() {
                    idle(interval);
                }
                Worker::Active(arbiter)
            }
            Worker::Active(arbiter) => {
                let (dropped, backend) = arbiter.stop();
                discarded += dropped;
                info!(discarded = dropped, "arbiter disabled");
                idle(interval);
                Worker::Disabled(backend)
            }
            Worker::Disabled(backend) if enabled => {
                match Arbiter::install(handle, config, backend, MonotonicClock::new()) {
                    Ok(arbiter) => {
                        info!("arbiter re-enabled");
                        Worker::Active(arbiter)
                    }
                    Err((err, backend)) => {
                        debug!(%err, "arbiter not re-enabled, retrying");
                        idle(interval);
                        Worker::Disabled(backend)
                    }
                }
            }
            Worker::Disabled(backend) => {
                idle(interval);
                Worker::Disabled(backend)
            }
        };
    }

    if let Worker::Active(arbiter) = worker {
        discarded += arbiter.stop().0;
    }
    info!(discarded, "arbiter thread exiting");
    discarded
}

fn dispatcher_main<P, S>(
    mut dispatcher: Dispatcher<P, S>,
    stop: &AtomicBool,
    interval: Duration,
    core: Option<usize>,
) -> usize
where
    P: Packet,
    S: TransmitSink<P>,
{
    pin_worker("dispatcher", core);
    info!("dispatcher thread started");

    while !stop.load(Ordering::Acquire) {
        if dispatcher.run() == 0 {
            idle(interval);
        }
    }

    let discarded = dispatcher.shutdown();
    info!(discarded, "dispatcher thread exiting");
    discarded
}

#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
fn pin_worker(name: &'static str, core: Option<usize>) {
    let Some(core) = core else {
        return;
    };
    if pin_to_core(core) {
        debug!(thread = name, core, "pinned");
    } else {
        warn!(thread = name, core, "failed to pin thread");
    }
}

#[inline]
fn idle(interval: Duration) {
    if interval.is_zero() {
        thread::yield_now();
    } else {
        thread::sleep(interval);
    }
}

#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
fn join_worker(handle: JoinHandle<usize>, name: &'static str) -> usize {
    handle.join().unwrap_or_else(|_| {
        error!(thread = name, "worker thread panicked");
        0
    })
}
