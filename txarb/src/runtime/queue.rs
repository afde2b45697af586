//! Per-CPU fan-in queues: mailboxes of mailbox references.
//!
//! Each queue is an ordinary [`Mailbox`] whose entries are `Arc` references to
//! client mailboxes. Clients bound to the same queue share its producer side
//! through an [`Inbox`]; the arbiter alone owns the [`PerCpuQueue`] consumer.
//!
//! The arbiter is also the single consumer of every client mailbox it receives
//! a reference to. Client mailboxes never reach more than one arbiter: a
//! client retires its mailbox when the active arbiter changes.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering, fence};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::{ConfigError, MailboxConfig};
use crate::mailbox::{self, Consumer, Full, Mailbox, Producer};
use crate::packet::Packet;
use crate::runtime::stats::SchedulerStats;
use crate::trace::trace;

/// A client mailbox as seen by the arbiter.
pub(crate) type PacketMailbox<P> = Mailbox<Box<P>>;

/// Reference to a client mailbox travelling through a per-CPU queue.
pub(crate) type MailboxRef<P> = Arc<PacketMailbox<P>>;

/// Creates one per-CPU queue and returns its client and arbiter sides.
pub(crate) fn pair<P: Packet>(
    index: usize,
    config: MailboxConfig,
) -> Result<(Inbox<P>, PerCpuQueue<P>), ConfigError> {
    let (producer, consumer) = mailbox::channel(config)?;

    let inbox = Inbox {
        index,
        last: AtomicPtr::new(ptr::null_mut()),
        producer: Mutex::new(InboxProducer {
            producer,
            last: Weak::new(),
        }),
    };
    let queue = PerCpuQueue {
        index,
        inbox: consumer,
        last_mailbox: None,
        pending_clear: Vec::new(),
        inbox_touched: false,
    };

    Ok((inbox, queue))
}

/// Client side of a per-CPU queue.
///
/// Several clients may be bound to the same queue, so the single producer
/// role is serialised by a short lock. The lock is only taken to push a
/// reference; a send whose mailbox is already the latest reference reads
/// `last` and returns.
pub(crate) struct Inbox<P: Packet> {
    #[cfg_attr(not(feature = "tracing"), allow(dead_code))]
    index: usize,
    /// Address of the last reference pushed, null after a failed push.
    ///
    /// Mirrors `InboxProducer::last`. That weak reference keeps the
    /// allocation alive, so an address published here is never reused by
    /// another mailbox.
    last: AtomicPtr<PacketMailbox<P>>,
    producer: Mutex<InboxProducer<P>>,
}

struct InboxProducer<P: Packet> {
    producer: Producer<MailboxRef<P>>,
    /// Last reference successfully pushed into this queue.
    last: Weak<PacketMailbox<P>>,
}

impl<P: Packet> Inbox<P> {
    /// Tells the arbiter that `mailbox` holds data.
    ///
    /// Skipped when `mailbox` is already the most recent reference in this
    /// queue: the arbiter keeps that one cached until a newer reference
    /// arrives. Returns `false` if the queue itself was full.
    pub(crate) fn notify(&self, mailbox: &MailboxRef<P>, stats: &SchedulerStats) -> bool {
        let addr = Arc::as_ptr(mailbox).cast_mut();
        if self.last.load(Ordering::Acquire) == addr {
            return true;
        }

        let mut inner = self.producer.lock();
        // Publish the packet stores before the reference becomes visible.
        fence(Ordering::SeqCst);
        match inner.producer.insert(Arc::clone(mailbox)) {
            Ok(()) => {
                self.publish(&mut inner, Arc::downgrade(mailbox));
                true
            }
            Err(_) => {
                self.publish(&mut inner, Weak::new());
                stats.record_notify_failure();
                trace!(queue = self.index, "per-cpu queue full, notification deferred");
                false
            }
        }
    }

    /// Pushes a reference unconditionally. Used to hand a dead mailbox over
    /// for reclamation.
    pub(crate) fn hand_over(&self, mailbox: MailboxRef<P>) -> Result<(), Full<MailboxRef<P>>> {
        let mut inner = self.producer.lock();
        fence(Ordering::SeqCst);
        let weak = Arc::downgrade(&mailbox);
        inner.producer.insert(mailbox)?;
        self.publish(&mut inner, weak);
        Ok(())
    }

    /// Records `last` as the newest reference. The previous weak reference
    /// is released only after the atomic stops naming it.
    fn publish(&self, inner: &mut InboxProducer<P>, last: Weak<PacketMailbox<P>>) {
        let addr = if last.strong_count() == 0 {
            ptr::null_mut()
        } else {
            last.as_ptr().cast_mut()
        };
        let previous = std::mem::replace(&mut inner.last, last);
        self.last.store(addr, Ordering::Release);
        drop(previous);
    }
}

/// Arbiter side of a per-CPU queue.
pub(crate) struct PerCpuQueue<P: Packet> {
    index: usize,
    inbox: Consumer<MailboxRef<P>>,
    /// Mailbox currently being drained.
    last_mailbox: Option<MailboxRef<P>>,
    /// Mailboxes extracted from this round, cleared in [`PerCpuQueue::ack`].
    pending_clear: Vec<MailboxRef<P>>,
    /// The queue's own slots were consumed this round.
    inbox_touched: bool,
}

impl<P: Packet> PerCpuQueue<P> {
    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Returns the mailbox to drain next.
    ///
    /// Keeps the cached mailbox while it has data, otherwise moves on to the
    /// next reference in the queue. A cached mailbox that is left behind dead
    /// and empty is queued for reclamation. When the queue has nothing new
    /// the cached mailbox is returned even if empty, so the caller can check
    /// whether it died.
    pub(crate) fn current_mailbox(
        &mut self,
        deferred: &mut Vec<MailboxRef<P>>,
    ) -> Option<&MailboxRef<P>> {
        // SAFETY: the arbiter owning this queue is the only consumer of every
        // mailbox referenced through it.
        let has_data = self
            .last_mailbox
            .as_ref()
            .is_some_and(|mailbox| unsafe { !mailbox.is_empty() });

        if !has_data && let Some(next) = self.inbox.extract() {
            self.inbox_touched = true;
            if let Some(previous) = self.last_mailbox.replace(next) {
                retire_if_reclaimable(previous, deferred);
            }
        }

        self.last_mailbox.as_ref()
    }

    /// Takes the next packet from this queue, if any.
    ///
    /// Returns `None` once the current mailbox is empty but alive, or when no
    /// mailbox is left. Dead, empty mailboxes met on the way go to `deferred`.
    pub(crate) fn next_packet(&mut self, deferred: &mut Vec<MailboxRef<P>>) -> Option<Box<P>> {
        loop {
            self.current_mailbox(deferred)?;
            let mailbox = self.last_mailbox.as_ref()?;

            // SAFETY: the arbiter is the only consumer (see module docs).
            if let Some(packet) = unsafe { mailbox.extract() } {
                let queued = self
                    .pending_clear
                    .last()
                    .is_some_and(|pending| Arc::ptr_eq(pending, mailbox));
                if !queued {
                    self.pending_clear.push(Arc::clone(mailbox));
                }
                return Some(packet);
            }

            if !mailbox.is_dead() {
                return None;
            }
            // Dead is published after the producer's last insert.
            // SAFETY: the arbiter is the only consumer.
            if unsafe { !mailbox.is_empty() } {
                continue;
            }

            let mailbox = self.last_mailbox.take()?;
            queue_for_reclaim(mailbox, deferred);
        }
    }

    /// Asks the producer of the mailbox being drained to throttle.
    #[inline]
    pub(crate) fn throttle_current(&self) {
        if let Some(mailbox) = &self.last_mailbox {
            mailbox.set_backpressure();
        }
    }

    /// Hints the cache about the cached mailbox's next slot.
    #[inline]
    pub(crate) fn prefetch(&self) {
        if let Some(mailbox) = &self.last_mailbox {
            // SAFETY: the arbiter is the only consumer.
            unsafe { mailbox.prefetch() };
        }
    }

    /// Releases every line consumed this round, including the queue's own.
    pub(crate) fn ack(&mut self) {
        for mailbox in self.pending_clear.drain(..) {
            // SAFETY: the arbiter is the only consumer.
            unsafe { mailbox.clear() };
        }
        if self.inbox_touched {
            self.inbox.clear();
            self.inbox_touched = false;
        }
    }

    /// Discards every packet reachable from this queue. Returns the count.
    pub(crate) fn drain(&mut self) -> usize {
        let mut discarded = 0;
        let mut current = self.last_mailbox.take();

        loop {
            if let Some(mailbox) = current.take() {
                discarded += drain_mailbox(&mailbox);
            }
            match self.inbox.extract() {
                Some(next) => current = Some(next),
                None => break,
            }
        }

        self.inbox.clear();
        self.inbox_touched = false;
        self.pending_clear.clear();
        discarded
    }
}

/// Extracts and drops everything left in `mailbox`.
pub(crate) fn drain_mailbox<P: Packet>(mailbox: &PacketMailbox<P>) -> usize {
    let mut discarded = 0;
    // SAFETY: only called by the arbiter, the single consumer.
    unsafe {
        while mailbox.extract().is_some() {
            discarded += 1;
        }
        mailbox.clear();
    }
    discarded
}

fn retire_if_reclaimable<P: Packet>(mailbox: MailboxRef<P>, deferred: &mut Vec<MailboxRef<P>>) {
    // SAFETY: the arbiter is the only consumer.
    if mailbox.is_dead() && unsafe { mailbox.is_empty() } {
        queue_for_reclaim(mailbox, deferred);
    }
}

fn queue_for_reclaim<P: Packet>(mailbox: MailboxRef<P>, deferred: &mut Vec<MailboxRef<P>>) {
    // SAFETY: the arbiter is the only consumer.
    if unsafe { mailbox.mark_reclaim_queued() } {
        trace!("dead mailbox queued for reclamation");
        deferred.push(mailbox);
    }
}
