//! Producer side of the scheduler.
//!
//! A [`Client`] owns one mailbox, created lazily on the first send against
//! the active arbiter. Packets go into that mailbox without any lock; the
//! per-CPU queue is only touched when the arbiter has to be told that this
//! mailbox has data.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConfigError;
use crate::handle::{Registry, SchedulerHandle};
use crate::mailbox::Producer;
use crate::packet::Packet;
use crate::trace::{trace, warn};

/// Attempts made to hand a dead mailbox to the arbiter.
const EXIT_ATTEMPTS: u32 = 16;
/// First backoff between hand-over attempts.
const EXIT_BACKOFF_START: Duration = Duration::from_micros(1);
/// Backoff ceiling.
const EXIT_BACKOFF_MAX: Duration = Duration::from_millis(1);

/// Why a packet was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The arbiter dropped an earlier packet of this client and asked it to
    /// throttle. The request is consumed by the send that reports it.
    Backpressure,
    /// The client's own mailbox has no room.
    MailboxFull,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backpressure => f.write_str("backpressure"),
            Self::MailboxFull => f.write_str("mailbox full"),
        }
    }
}

/// Error returned by [`Client::send`].
pub enum SendError<P> {
    /// No arbiter is active. The packet is handed back untouched.
    Inactive(P),
    /// The packet was dropped.
    Dropped(DropReason),
    /// The client mailbox could not be created.
    Config(ConfigError),
}

impl<P> SendError<P> {
    /// Returns the packet if it was handed back.
    pub fn into_packet(self) -> Option<P> {
        match self {
            Self::Inactive(packet) => Some(packet),
            Self::Dropped(_) | Self::Config(_) => None,
        }
    }
}

impl<P> fmt::Debug for SendError<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive(_) => f.write_str("Inactive(..)"),
            Self::Dropped(reason) => f.debug_tuple("Dropped").field(reason).finish(),
            Self::Config(err) => f.debug_tuple("Config").field(err).finish(),
        }
    }
}

impl<P> fmt::Display for SendError<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive(_) => f.write_str("no active scheduler"),
            Self::Dropped(reason) => write!(f, "packet dropped: {reason}"),
            Self::Config(err) => write!(f, "cannot create client mailbox: {err}"),
        }
    }
}

impl<P> std::error::Error for SendError<P> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Inactive(_) | Self::Dropped(_) => None,
        }
    }
}

impl<P> From<ConfigError> for SendError<P> {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

/// Mailbox bound to one arbiter epoch.
struct Bound<P: Packet> {
    producer: Producer<Box<P>>,
    epoch: u64,
}

/// A packet producer.
///
/// `Send` but not `Sync`: a client is the single producer of its mailbox.
/// Dropping a client runs [`Client::exit`].
pub struct Client<P: Packet> {
    handle: SchedulerHandle<P>,
    cpu: usize,
    mailbox: Option<Bound<P>>,
}

impl<P: Packet> Client<P> {
    pub(crate) fn new(handle: SchedulerHandle<P>, cpu: usize) -> Self {
        Self {
            handle,
            cpu,
            mailbox: None,
        }
    }

    /// Per-CPU queue index this client was bound to, before wrapping.
    #[must_use]
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Offers a packet to the active arbiter. Never blocks.
    ///
    /// # Errors
    ///
    /// - [`SendError::Inactive`] with the packet when no arbiter is active
    /// - [`SendError::Dropped`] when the packet was not admitted
    /// - [`SendError::Config`] when the mailbox could not be created
    pub fn send(&mut self, packet: P) -> Result<(), SendError<P>> {
        let Some(registry) = self.handle.current() else {
            return Err(SendError::Inactive(packet));
        };
        let cpu = self.cpu;
        let producer = self.bind(&registry)?;

        if producer.take_backpressure() {
            registry.stats.record_backpressure_drop();
            trace!(cpu, "send refused, backpressure");
            return Err(SendError::Dropped(DropReason::Backpressure));
        }

        if producer.insert(Box::new(packet)).is_err() {
            registry.stats.record_mailbox_full_drop();
            trace!(cpu, "send refused, mailbox full");
            return Err(SendError::Dropped(DropReason::MailboxFull));
        }

        registry.inbox(cpu).notify(producer.mailbox(), &registry.stats);
        Ok(())
    }

    /// True if the arbiter has asked this client to throttle.
    ///
    /// Does not consume the request; the next [`Client::send`] does.
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.mailbox
            .as_ref()
            .is_some_and(|bound| bound.producer.has_backpressure())
    }

    /// Retires the mailbox and hands it to the arbiter for reclamation.
    ///
    /// Packets already sent are still delivered.
    pub fn exit(mut self) {
        self.retire();
    }

    /// Returns the producer for the active arbiter, creating it on first use
    /// or after the arbiter changed.
    fn bind(&mut self, registry: &Registry<P>) -> Result<&Producer<Box<P>>, ConfigError> {
        let bound = match self.mailbox.take() {
            Some(bound) if bound.epoch == registry.epoch => bound,
            stale => {
                if let Some(old) = stale {
                    // The arbiter that consumed it is gone.
                    old.producer.mark_dead();
                }
                let producer = Producer::detached(registry.client_mailbox)?;
                trace!(cpu = self.cpu, epoch = registry.epoch, "client mailbox created");
                Bound {
                    producer,
                    epoch: registry.epoch,
                }
            }
        };

        Ok(&self.mailbox.insert(bound).producer)
    }

    fn retire(&mut self) {
        let Some(bound) = self.mailbox.take() else {
            return;
        };
        bound.producer.mark_dead();

        let registry = match self.handle.current() {
            Some(registry) if registry.epoch == bound.epoch => registry,
            // No arbiter holds a reference worth handing over; dropping the
            // producer releases the mailbox.
            _ => return,
        };

        let inbox = registry.inbox(self.cpu);
        let mut mailbox = Arc::clone(bound.producer.mailbox());
        let mut backoff = EXIT_BACKOFF_START;
        for attempt in 1..=EXIT_ATTEMPTS {
            match inbox.hand_over(mailbox) {
                Ok(()) => return,
                Err(full) => mailbox = full.into_inner(),
            }
            if attempt < EXIT_ATTEMPTS {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(EXIT_BACKOFF_MAX);
            }
        }

        // The arbiter still finds the mailbox dead through a reference it
        // already holds, or the last `Arc` goes away with the producer.
        registry.stats.record_handover_failure();
        warn!(cpu = self.cpu, "giving up handing dead mailbox to arbiter");
    }
}

impl<P: Packet> Drop for Client<P> {
    fn drop(&mut self) {
        self.retire();
    }
}

impl<P: Packet> fmt::Debug for Client<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("cpu", &self.cpu)
            .field("epoch", &self.mailbox.as_ref().map(|bound| bound.epoch))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SchedulerConfig, TransmitMode};
    use crate::runtime::arbiter::Arbiter;

    fn immediate() -> SchedulerConfig {
        SchedulerConfig {
            queues: 1,
            mode: TransmitMode::ImmediateSend,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn inactive_hands_packet_back() {
        let handle = SchedulerHandle::<Vec<u8>>::new();
        let mut client = handle.client(3);
        let err = client.send(vec![1, 2, 3]).unwrap_err();
        assert_eq!(err.to_string(), "no active scheduler");
        assert_eq!(err.into_packet(), Some(vec![1, 2, 3]));
        assert!(!client.is_throttled());
    }

    #[test]
    fn mailbox_created_lazily_per_epoch() {
        let handle = SchedulerHandle::<Vec<u8>>::new();
        let mut client = handle.client(0);
        assert!(client.mailbox.is_none());

        let (arbiter, _) = Arbiter::new(&handle, &immediate(), |_: Vec<u8>| {}).unwrap();
        client.send(vec![0]).unwrap();
        let first = client.mailbox.as_ref().map(|bound| bound.epoch);
        assert!(first.is_some());
        arbiter.shutdown();

        let (arbiter, _) = Arbiter::new(&handle, &immediate(), |_: Vec<u8>| {}).unwrap();
        client.send(vec![0]).unwrap();
        let second = client.mailbox.as_ref().map(|bound| bound.epoch);
        assert_ne!(first, second);
        arbiter.shutdown();
    }

    #[test]
    fn exit_without_arbiter_releases_mailbox() {
        let handle = SchedulerHandle::<Vec<u8>>::new();
        let (arbiter, _) = Arbiter::new(&handle, &immediate(), |_: Vec<u8>| {}).unwrap();
        let mut client = handle.client(0);
        client.send(vec![0]).unwrap();
        arbiter.shutdown();

        // Nothing to hand over to; must not block or panic.
        client.exit();
    }

    #[test]
    fn drop_reasons_display() {
        let err: SendError<Vec<u8>> = SendError::Dropped(DropReason::MailboxFull);
        assert_eq!(err.to_string(), "packet dropped: mailbox full");
        assert!(err.into_packet().is_none());
        assert_eq!(DropReason::Backpressure.to_string(), "backpressure");
    }
}
