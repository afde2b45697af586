//! The active-arbiter slot shared between producers and the control path.
//!
//! A [`SchedulerHandle`] holds at most one [`Registry`]: the part of an
//! arbiter that clients need (per-CPU inboxes, client mailbox geometry,
//! counters). Producers resolve it with a single atomic load per send. The
//! enable/disable path swaps it under a control lock that producers never
//! take.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::client::Client;
use crate::config::MailboxConfig;
use crate::packet::Packet;
use crate::runtime::queue::Inbox;
use crate::runtime::stats::SchedulerStats;
use crate::scheduler::SchedulerError;

/// Client-facing state of one arbiter instance.
pub(crate) struct Registry<P: Packet> {
    /// Distinguishes successive arbiters installed in the same handle.
    pub(crate) epoch: u64,
    /// Geometry of mailboxes created by clients.
    pub(crate) client_mailbox: MailboxConfig,
    pub(crate) inboxes: Box<[Inbox<P>]>,
    pub(crate) stats: Arc<SchedulerStats>,
}

impl<P: Packet> Registry<P> {
    /// Inbox a client bound to `cpu` notifies.
    #[inline]
    pub(crate) fn inbox(&self, cpu: usize) -> &Inbox<P> {
        &self.inboxes[cpu % self.inboxes.len()]
    }
}

struct Shared<P: Packet> {
    active: ArcSwapOption<Registry<P>>,
    control: Mutex<()>,
    epochs: AtomicU64,
}

/// Shared slot naming the currently active arbiter, if any.
///
/// Cheap to clone; every clone refers to the same slot. Pass one to each
/// producer through [`SchedulerHandle::client`].
pub struct SchedulerHandle<P: Packet> {
    shared: Arc<Shared<P>>,
}

impl<P: Packet> Clone for SchedulerHandle<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: Packet> Default for SchedulerHandle<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Packet> std::fmt::Debug for SchedulerHandle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("active", &self.is_active())
            .finish()
    }
}

impl<P: Packet> SchedulerHandle<P> {
    /// Creates an empty slot. No arbiter is active.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                active: ArcSwapOption::empty(),
                control: Mutex::new(()),
                epochs: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a producer bound to per-CPU queue `cpu % queues`.
    #[must_use]
    pub fn client(&self, cpu: usize) -> Client<P> {
        Client::new(self.clone(), cpu)
    }

    /// True while an arbiter is installed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.active.load().is_some()
    }

    /// Counters of the active arbiter.
    #[must_use]
    pub fn stats(&self) -> Option<Arc<SchedulerStats>> {
        self.shared
            .active
            .load()
            .as_ref()
            .map(|registry| Arc::clone(&registry.stats))
    }

    #[inline]
    pub(crate) fn current(&self) -> Option<Arc<Registry<P>>> {
        self.shared.active.load_full()
    }

    /// Installs a new registry built for a fresh epoch.
    pub(crate) fn activate(
        &self,
        build: impl FnOnce(u64) -> Registry<P>,
    ) -> Result<Arc<Registry<P>>, SchedulerError> {
        let _control = self.shared.control.lock();
        if self.shared.active.load().is_some() {
            return Err(SchedulerError::AlreadyActive);
        }

        let epoch = self.shared.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let registry = Arc::new(build(epoch));
        self.shared.active.store(Some(Arc::clone(&registry)));
        Ok(registry)
    }

    /// Empties the slot if it still holds the arbiter of `epoch`.
    pub(crate) fn retire(&self, epoch: u64) -> bool {
        let _control = self.shared.control.lock();
        let current = self.shared.active.load();
        match current.as_ref() {
            Some(registry) if registry.epoch == epoch => {
                drop(current);
                self.shared.active.store(None);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::queue;

    fn registry(epoch: u64) -> Registry<Vec<u8>> {
        let (inbox, _queue) = queue::pair(0, MailboxConfig::new(32, 32)).unwrap();
        Registry {
            epoch,
            client_mailbox: MailboxConfig::default(),
            inboxes: vec![inbox].into_boxed_slice(),
            stats: Arc::new(SchedulerStats::new(1)),
        }
    }

    #[test]
    fn starts_inactive() {
        let handle = SchedulerHandle::<Vec<u8>>::new();
        assert!(!handle.is_active());
        assert!(handle.current().is_none());
        assert!(handle.stats().is_none());
    }

    #[test]
    fn only_one_active_registry() {
        let handle = SchedulerHandle::<Vec<u8>>::new();
        let first = handle.activate(registry).unwrap();
        assert!(handle.is_active());
        assert!(matches!(
            handle.activate(registry),
            Err(SchedulerError::AlreadyActive)
        ));

        assert!(handle.retire(first.epoch));
        assert!(!handle.is_active());

        let second = handle.activate(registry).unwrap();
        assert!(second.epoch > first.epoch);
    }

    #[test]
    fn stale_retire_is_ignored() {
        let handle = SchedulerHandle::<Vec<u8>>::new();
        let first = handle.activate(registry).unwrap();
        assert!(handle.retire(first.epoch));
        let second = handle.activate(registry).unwrap();

        assert!(!handle.retire(first.epoch));
        assert!(handle.is_active());
        assert!(handle.retire(second.epoch));
    }

    #[test]
    fn clones_share_the_slot() {
        let handle = SchedulerHandle::<Vec<u8>>::new();
        let other = handle.clone();
        let registry = handle.activate(registry).unwrap();
        assert!(other.is_active());
        assert!(other.retire(registry.epoch));
        assert!(!handle.is_active());
    }

    #[test]
    fn inbox_index_wraps() {
        let registry = registry(1);
        assert!(std::ptr::eq(registry.inbox(0), registry.inbox(5)));
    }
}
