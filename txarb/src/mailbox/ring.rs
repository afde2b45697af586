//! Core lock-free mailbox algorithm.
//!
//! A mailbox is a bounded single-producer single-consumer ring of owning
//! pointers. Slots are null when free and non-null when they hold an entry.
//! Unlike a head/tail ring, producer and consumer never read each other's
//! cursors: the producer only looks at slot contents, and the consumer resets
//! slots to null lazily, one whole cache line at a time.
//!
//! # Line protocol
//!
//! With `L` entries per line the cursors start at `cons_clear = 0`,
//! `cons_read = prod_write = L` and `prod_check = 2L`; line 0 is filled with a
//! non-null sentinel. When the producer reaches `prod_check` it reserves the
//! next line, but only if the line *after* it is entirely null. There is
//! therefore always one null line between the producer and the oldest
//! uncleared slot, which is what stops the consumer. The consumer nulls a line
//! only once `cons_read` has moved past it.
//!
//! # Safety
//!
//! The data-path methods are `unsafe` because the caller must uphold the SPSC
//! invariant: exactly one producer calls [`Mailbox::insert`], exactly one
//! consumer calls [`Mailbox::extract`], [`Mailbox::clear`],
//! [`Mailbox::is_empty`] and [`Mailbox::prefetch`].

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use super::slots::Slots;
use crate::config::{ConfigError, MailboxConfig};

/// Owning pointer types that can travel through a mailbox slot.
///
/// # Safety
///
/// `into_raw` must return a pointer that stays valid until it is passed back
/// to `from_raw` exactly once, and `from_raw` must rebuild the same value.
pub unsafe trait Entry: Send + Sized {
    /// Leaks the value into a raw pointer.
    fn into_raw(self) -> NonNull<()>;

    /// Rebuilds the value from a pointer produced by [`Entry::into_raw`].
    ///
    /// # Safety
    ///
    /// `raw` must come from `into_raw` and must not be used again afterwards.
    unsafe fn from_raw(raw: NonNull<()>) -> Self;
}

// SAFETY: Box::leak/Box::from_raw round-trip the same allocation.
unsafe impl<T: Send> Entry for Box<T> {
    #[inline]
    fn into_raw(self) -> NonNull<()> {
        NonNull::from(Box::leak(self)).cast()
    }

    #[inline]
    unsafe fn from_raw(raw: NonNull<()>) -> Self {
        // SAFETY: caller guarantees `raw` came from `into_raw` above.
        unsafe { Box::from_raw(raw.cast::<T>().as_ptr()) }
    }
}

// SAFETY: Arc::into_raw/Arc::from_raw round-trip one strong reference.
unsafe impl<T: Send + Sync> Entry for Arc<T> {
    #[inline]
    fn into_raw(self) -> NonNull<()> {
        // SAFETY: Arc::into_raw never returns null.
        unsafe { NonNull::new_unchecked(Arc::into_raw(self).cast_mut()) }.cast()
    }

    #[inline]
    unsafe fn from_raw(raw: NonNull<()>) -> Self {
        // SAFETY: caller guarantees `raw` came from `into_raw` above.
        unsafe { Arc::from_raw(raw.cast::<T>().as_ptr()) }
    }
}

/// Insert rejected because the producer would overwrite uncleared slots.
///
/// Carries the rejected entry back to the caller.
pub struct Full<E>(pub E);

impl<E> Full<E> {
    /// Returns the rejected entry.
    pub fn into_inner(self) -> E {
        self.0
    }
}

impl<E> fmt::Debug for Full<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Full(..)")
    }
}

impl<E> fmt::Display for Full<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("mailbox full")
    }
}

impl<E> std::error::Error for Full<E> {}

/// Role marker: fields owned exclusively by the producer.
enum ProducerRole {}

/// Role marker: fields owned exclusively by the consumer.
enum ConsumerRole {}

/// Interior-mutable cursor tagged with the role allowed to touch it.
#[repr(transparent)]
struct RoleCell<T, Role>(UnsafeCell<T>, PhantomData<Role>);

impl<T: Copy, Role> RoleCell<T, Role> {
    const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value), PhantomData)
    }

    /// # Safety
    ///
    /// Only the thread holding `Role` may call this.
    #[inline]
    unsafe fn get(&self) -> T {
        // SAFETY: the role owner is the only accessor.
        unsafe { *self.0.get() }
    }

    /// # Safety
    ///
    /// Only the thread holding `Role` may call this.
    #[inline]
    unsafe fn set(&self, value: T) {
        // SAFETY: the role owner is the only accessor.
        unsafe { *self.0.get() = value }
    }

    #[inline]
    fn get_mut(&mut self) -> &mut T {
        self.0.get_mut()
    }
}

/// Producer cursors.
#[repr(C, align(64))]
struct ProducerState {
    /// Next slot to write.
    write: RoleCell<usize, ProducerRole>,
    /// End of the currently reserved line.
    check: RoleCell<usize, ProducerRole>,
}

/// Consumer cursors.
#[repr(C, align(64))]
struct ConsumerState {
    /// Next slot to read.
    read: RoleCell<usize, ConsumerRole>,
    /// First slot not yet reset to null.
    clear: RoleCell<usize, ConsumerRole>,
    /// Set once the mailbox has been queued for reclamation.
    reclaim_queued: RoleCell<bool, ConsumerRole>,
}

/// Cross-role flags, kept away from both cursor lines.
#[repr(C, align(64))]
struct Flags {
    /// Producer has exited. Set once, never cleared.
    dead: AtomicBool,
    /// Consumer asks the producer to throttle.
    backpressure: AtomicBool,
}

/// Bounded SPSC mailbox with deferred, line-granular clearing.
pub struct Mailbox<E: Entry> {
    producer: ProducerState,
    consumer: ConsumerState,
    flags: Flags,
    line_entries: usize,
    line_mask: usize,
    entry_mask: usize,
    slots: Slots,
    _entries: PhantomData<E>,
}

impl<E: Entry> Mailbox<E> {
    /// Creates a mailbox with the given geometry.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the geometry breaks the power-of-two
    /// or more-than-two-lines invariant.
    pub fn new(config: MailboxConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let line_entries = config.entries_per_line();
        let slots = Slots::zeroed(config.entries, config.line_size)?;

        let sentinel = NonNull::<()>::dangling().as_ptr();
        for index in 0..line_entries {
            slots.get(index).store(sentinel, Ordering::Relaxed);
        }

        Ok(Self {
            producer: ProducerState {
                write: RoleCell::new(line_entries),
                check: RoleCell::new(2 * line_entries),
            },
            consumer: ConsumerState {
                read: RoleCell::new(line_entries),
                clear: RoleCell::new(0),
                reclaim_queued: RoleCell::new(false),
            },
            flags: Flags {
                dead: AtomicBool::new(false),
                backpressure: AtomicBool::new(false),
            },
            line_entries,
            line_mask: !(line_entries - 1),
            entry_mask: config.entries - 1,
            slots,
            _entries: PhantomData,
        })
    }

    /// Shorthand for [`Mailbox::new`] with an explicit geometry.
    ///
    /// # Errors
    ///
    /// See [`Mailbox::new`].
    pub fn with_geometry(entries: usize, line_size: usize) -> Result<Self, ConfigError> {
        Self::new(MailboxConfig::new(entries, line_size))
    }

    /// Total number of slots.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    #[must_use]
    pub fn entries_per_line(&self) -> usize {
        self.line_entries
    }

    /// Entries a fresh mailbox accepts before the consumer must clear.
    ///
    /// One line is kept empty ahead of the producer and one line trails the
    /// consumer until it is cleared.
    #[inline]
    #[must_use]
    pub fn usable_capacity(&self) -> usize {
        self.capacity() - 2 * self.line_entries
    }

    #[inline]
    fn slot(&self, cursor: usize) -> &AtomicPtr<()> {
        self.slots.get(cursor & self.entry_mask)
    }

    /// True if every slot of the line starting at `cursor` is null.
    #[inline]
    fn line_is_clear(&self, cursor: usize) -> bool {
        (0..self.line_entries)
            .all(|offset| self.slot(cursor.wrapping_add(offset)).load(Ordering::Acquire).is_null())
    }

    #[inline]
    fn prefetch_slot(&self, cursor: usize) {
        #[cfg(target_arch = "x86_64")]
        {
            use core::arch::x86_64::{_MM_HINT_T0, _mm_prefetch};
            let addr = self.slots.as_ptr(cursor & self.entry_mask).cast::<i8>();
            // SAFETY: prefetch is a hint; the address is inside the slot allocation.
            unsafe { _mm_prefetch::<_MM_HINT_T0>(addr) };
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = cursor;
    }

    /// Writes an entry at the producer cursor.
    ///
    /// # Errors
    ///
    /// Returns [`Full`] with the entry when the next line has not been cleared
    /// by the consumer yet. Nothing is written in that case.
    ///
    /// # Safety
    ///
    /// Only the single producer may call this.
    #[inline]
    pub unsafe fn insert(&self, entry: E) -> Result<(), Full<E>> {
        // SAFETY: producer-only cursors, caller is the producer.
        let write = unsafe { self.producer.write.get() };
        let check = unsafe { self.producer.check.get() };

        if write == check {
            let ahead = check.wrapping_add(self.line_entries);
            if !self.line_is_clear(ahead) {
                return Err(Full(entry));
            }
            // SAFETY: producer-only cursor.
            unsafe { self.producer.check.set(ahead) };
            self.prefetch_slot(ahead);
        }

        self.slot(write).store(entry.into_raw().as_ptr(), Ordering::Release);
        // SAFETY: producer-only cursor.
        unsafe { self.producer.write.set(write.wrapping_add(1)) };
        Ok(())
    }

    /// Takes the entry at the consumer cursor, if one has been written.
    ///
    /// The slot keeps its stale pointer until [`Mailbox::clear`] nulls it.
    ///
    /// # Safety
    ///
    /// Only the single consumer may call this.
    #[inline]
    pub unsafe fn extract(&self) -> Option<E> {
        // SAFETY: consumer-only cursor, caller is the consumer.
        let read = unsafe { self.consumer.read.get() };
        let raw = NonNull::new(self.slot(read).load(Ordering::Acquire))?;
        // SAFETY: consumer-only cursor.
        unsafe { self.consumer.read.set(read.wrapping_add(1)) };
        // SAFETY: the producer published this pointer with `into_raw` and the
        // read cursor moved past it, so it is handed out exactly once.
        Some(unsafe { E::from_raw(raw) })
    }

    /// Nulls every fully consumed line behind the read cursor.
    ///
    /// # Safety
    ///
    /// Only the single consumer may call this.
    pub unsafe fn clear(&self) {
        // SAFETY: consumer-only cursors.
        let read_line = unsafe { self.consumer.read.get() } & self.line_mask;
        let mut clear = unsafe { self.consumer.clear.get() };

        while clear & self.line_mask != read_line {
            self.slot(clear).store(ptr::null_mut(), Ordering::Release);
            clear = clear.wrapping_add(1);
        }

        // SAFETY: consumer-only cursor.
        unsafe { self.consumer.clear.set(clear) };
    }

    /// True if nothing has been written at the read cursor yet.
    ///
    /// # Safety
    ///
    /// Only the single consumer may call this.
    #[inline]
    #[must_use]
    pub unsafe fn is_empty(&self) -> bool {
        // SAFETY: consumer-only cursor.
        let read = unsafe { self.consumer.read.get() };
        self.slot(read).load(Ordering::Acquire).is_null()
    }

    /// Hints the cache about the next slot the consumer will read.
    ///
    /// # Safety
    ///
    /// Only the single consumer may call this.
    #[inline]
    pub unsafe fn prefetch(&self) {
        // SAFETY: consumer-only cursor.
        let read = unsafe { self.consumer.read.get() };
        self.prefetch_slot(read);
    }

    /// Marks the producer as gone. Idempotent.
    #[inline]
    pub fn mark_dead(&self) {
        self.flags.dead.store(true, Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.flags.dead.load(Ordering::Acquire)
    }

    /// Asks the producer to throttle. Called by the consumer.
    #[inline]
    pub fn set_backpressure(&self) {
        self.flags.backpressure.store(true, Ordering::Relaxed);
    }

    /// Reads and clears the backpressure request. Called by the producer.
    #[inline]
    pub fn take_backpressure(&self) -> bool {
        self.flags.backpressure.load(Ordering::Relaxed)
            && self.flags.backpressure.swap(false, Ordering::Relaxed)
    }

    /// Peeks at the backpressure request without clearing it.
    #[inline]
    #[must_use]
    pub fn has_backpressure(&self) -> bool {
        self.flags.backpressure.load(Ordering::Relaxed)
    }

    /// Records that the consumer queued this mailbox for reclamation.
    ///
    /// Returns `true` only the first time.
    ///
    /// # Safety
    ///
    /// Only the single consumer may call this.
    pub(crate) unsafe fn mark_reclaim_queued(&self) -> bool {
        // SAFETY: consumer-only flag.
        unsafe {
            if self.consumer.reclaim_queued.get() {
                return false;
            }
            self.consumer.reclaim_queued.set(true);
        }
        true
    }
}

impl<E: Entry> Drop for Mailbox<E> {
    fn drop(&mut self) {
        let write = *self.producer.write.get_mut();
        let mut read = *self.consumer.read.get_mut();

        while read != write {
            let raw = self.slots.get(read & self.entry_mask).swap(ptr::null_mut(), Ordering::Relaxed);
            if let Some(raw) = NonNull::new(raw) {
                // SAFETY: entries between the read and write cursors were never extracted.
                drop(unsafe { E::from_raw(raw) });
            }
            read = read.wrapping_add(1);
        }
    }
}

impl<E: Entry> fmt::Debug for Mailbox<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("capacity", &self.capacity())
            .field("entries_per_line", &self.line_entries)
            .field("dead", &self.is_dead())
            .field("backpressure", &self.has_backpressure())
            .finish_non_exhaustive()
    }
}

// SAFETY: cursors are only touched by their role owner (see module docs); slots
// are atomics; entries are `Send`.
unsafe impl<E: Entry> Send for Mailbox<E> {}
unsafe impl<E: Entry> Sync for Mailbox<E> {}
