//! Line-aligned slot storage for mailboxes.
//!
//! The slot array is allocated zeroed (every slot null) and aligned to the
//! configured line size, so logical lines line up with hardware cache lines
//! and clearing one line never touches its neighbour.

use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::ptr::NonNull;
use std::sync::atomic::AtomicPtr;

use crate::config::ConfigError;

pub(crate) struct Slots {
    base: NonNull<AtomicPtr<()>>,
    len: usize,
    layout: Layout,
}

impl Slots {
    /// Allocates `len` null slots aligned to `align` bytes.
    pub(crate) fn zeroed(len: usize, align: usize) -> Result<Self, ConfigError> {
        let layout = Layout::array::<AtomicPtr<()>>(len)
            .and_then(|layout| layout.align_to(align))
            .map(|layout| layout.pad_to_align())
            .map_err(|_| ConfigError::invalid("mailbox entries", "allocation too large"))?;

        // SAFETY: validated geometry guarantees a non-zero size. An all-zero
        // bit pattern is a valid null `AtomicPtr`.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(raw.cast::<AtomicPtr<()>>()) else {
            handle_alloc_error(layout);
        };

        Ok(Self { base, len, layout })
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Returns the slot at `index`, which must already be masked.
    #[inline]
    pub(crate) fn get(&self, index: usize) -> &AtomicPtr<()> {
        debug_assert!(index < self.len);
        // SAFETY: index < len and the allocation holds `len` initialized slots.
        unsafe { &*self.base.as_ptr().add(index) }
    }

    #[inline]
    pub(crate) fn as_ptr(&self, index: usize) -> *const AtomicPtr<()> {
        self.get(index)
    }
}

impl Drop for Slots {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with exactly this layout.
        unsafe { dealloc(self.base.as_ptr().cast::<u8>(), self.layout) };
    }
}

// SAFETY: Slots only hands out shared references to atomics.
unsafe impl Send for Slots {}
unsafe impl Sync for Slots {}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;

    #[test]
    fn slots_start_null_and_aligned() {
        let slots = Slots::zeroed(64, 128).unwrap();
        assert_eq!(slots.len(), 64);
        assert_eq!(slots.as_ptr(0) as usize % 128, 0);
        for i in 0..slots.len() {
            assert!(slots.get(i).load(Ordering::Relaxed).is_null());
        }
    }
}
