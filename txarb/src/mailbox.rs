//! Lock-free SPSC mailboxes with deferred, cache-line-granular clearing.
//!
//! # Overview
//!
//! - [`Mailbox`] - the shared ring (unsafe, role-checked by the caller)
//! - [`Producer`] - write end, safe wrapper holding the producer role
//! - [`Consumer`] - read end, safe wrapper holding the consumer role
//!
//! Entries are owning pointers ([`Entry`]): `Box<T>` for packets and
//! `Arc<T>` for references to other mailboxes.
//!
//! # Example
//!
//! ```
//! use txarb::config::MailboxConfig;
//! use txarb::mailbox;
//!
//! let (tx, rx) = mailbox::channel::<Box<u64>>(MailboxConfig::new(64, 64)).unwrap();
//!
//! tx.insert(Box::new(42)).unwrap();
//! assert_eq!(rx.extract().map(|v| *v), Some(42));
//! rx.clear();
//! ```

mod ring;
mod slots;

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

pub use ring::{Entry, Full, Mailbox};

use crate::config::{ConfigError, MailboxConfig};

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of a mailbox.
///
/// `Send` but not `Sync`: it can move to another thread, but `&Producer`
/// cannot be shared, so there is never more than one concurrent writer.
pub struct Producer<E: Entry> {
    mailbox: Arc<Mailbox<E>>,
    _unsync: PhantomUnsync,
}

/// Read end of a mailbox. Same thread-safety rules as [`Producer`].
pub struct Consumer<E: Entry> {
    mailbox: Arc<Mailbox<E>>,
    _unsync: PhantomUnsync,
}

/// Creates a mailbox and returns its two ends.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] for a geometry that breaks the mailbox
/// invariants.
pub fn channel<E: Entry>(config: MailboxConfig) -> Result<(Producer<E>, Consumer<E>), ConfigError> {
    let mailbox = Arc::new(Mailbox::new(config)?);

    let producer = Producer {
        mailbox: Arc::clone(&mailbox),
        _unsync: PhantomData,
    };
    let consumer = Consumer {
        mailbox,
        _unsync: PhantomData,
    };

    Ok((producer, consumer))
}

impl<E: Entry> Producer<E> {
    /// Creates a mailbox whose consumer role is taken by whoever receives a
    /// reference to it through a per-CPU queue: the arbiter.
    pub(crate) fn detached(config: MailboxConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            mailbox: Arc::new(Mailbox::new(config)?),
            _unsync: PhantomData,
        })
    }

    /// Writes an entry (wait-free).
    ///
    /// # Errors
    ///
    /// Returns [`Full`] with the entry if the consumer has not cleared enough
    /// room yet.
    #[inline]
    pub fn insert(&self, entry: E) -> Result<(), Full<E>> {
        // SAFETY: this handle is the only producer and is not `Sync`.
        unsafe { self.mailbox.insert(entry) }
    }

    /// Marks the producer as gone. Idempotent.
    #[inline]
    pub fn mark_dead(&self) {
        self.mailbox.mark_dead();
    }

    /// Reads and clears the consumer's throttle request.
    #[inline]
    pub fn take_backpressure(&self) -> bool {
        self.mailbox.take_backpressure()
    }

    /// Peeks at the consumer's throttle request.
    #[inline]
    #[must_use]
    pub fn has_backpressure(&self) -> bool {
        self.mailbox.has_backpressure()
    }

    #[inline]
    pub(crate) fn mailbox(&self) -> &Arc<Mailbox<E>> {
        &self.mailbox
    }
}

impl<E: Entry> Consumer<E> {
    /// Takes the next entry, if any (wait-free).
    #[inline]
    #[must_use]
    pub fn extract(&self) -> Option<E> {
        // SAFETY: this handle is the only consumer and is not `Sync`.
        unsafe { self.mailbox.extract() }
    }

    /// Releases fully consumed lines back to the producer.
    #[inline]
    pub fn clear(&self) {
        // SAFETY: this handle is the only consumer and is not `Sync`.
        unsafe { self.mailbox.clear() }
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        // SAFETY: this handle is the only consumer and is not `Sync`.
        unsafe { self.mailbox.is_empty() }
    }

    #[inline]
    pub fn prefetch(&self) {
        // SAFETY: this handle is the only consumer and is not `Sync`.
        unsafe { self.mailbox.prefetch() }
    }

    #[inline]
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.mailbox.is_dead()
    }

    /// Asks the producer to throttle.
    #[inline]
    pub fn set_backpressure(&self) {
        self.mailbox.set_backpressure();
    }

    #[inline]
    #[must_use]
    pub fn usable_capacity(&self) -> usize {
        self.mailbox.usable_capacity()
    }
}
