//! Reference-counted buffers that return to their pool instead of being freed.
//!
//! A [`PooledBuffer`] is a handle to a heap-allocated [`Shared`] record that
//! holds the reference count, the aligned storage, and a weak back-reference
//! to the owning pool. Cloning increments the count. When the last handle is
//! dropped, [`drop_or_recycle`] decides what happens to the storage:
//!
//! - the pool is alive and not flushing: the count is re-armed to one and the
//!   record is pushed onto the pool's free-list, untouched;
//! - the pool is flushing: the pool deallocates the record;
//! - the pool is gone (or the buffer was detached): the record is deallocated.
//!
//! Exactly one handle observes the count reaching zero, so the record is
//! recycled or freed exactly once. While idle, the free-list owns the record
//! and no handle to it exists.

use crate::{storage::AlignedBuffer, PoolInner};
use bytes::Bytes;
use std::{
    fmt,
    marker::PhantomData,
    mem,
    ptr::NonNull,
    sync::{
        atomic::{fence, AtomicUsize, Ordering},
        Weak,
    },
};
use tracing::trace;

/// A soft limit on the number of references to a buffer.
const MAX_REFCOUNT: usize = isize::MAX as usize;

/// State shared by every handle to the same buffer.
pub(crate) struct Shared {
    refs: AtomicUsize,
    storage: AlignedBuffer,
    pool: Weak<PoolInner>,
}

impl Shared {
    pub(crate) fn new(storage: AlignedBuffer, pool: Weak<PoolInner>) -> Box<Self> {
        Box::new(Self {
            refs: AtomicUsize::new(1),
            storage,
            pool,
        })
    }

    /// Re-arms the reference count of a buffer whose last handle was dropped.
    pub(crate) fn revive(&mut self) {
        *self.refs.get_mut() = 1;
    }
}

/// Returns a buffer whose last handle was dropped to its pool, or frees it.
pub(crate) fn drop_or_recycle(shared: Box<Shared>) {
    match shared.pool.upgrade() {
        Some(pool) => pool.recycle(shared),
        None => trace!(len = shared.storage.len(), "freeing unpooled buffer"),
    }
}

/// A fixed-size, aligned buffer borrowed from a [`crate::BufferPool`].
///
/// Handles are cheap to clone and can be sent to and dropped on any thread.
/// Dropping the last handle returns the buffer to its pool.
///
/// Recycled buffers are handed out as they were left: callers must not assume
/// the contents are zeroed.
pub struct PooledBuffer {
    ptr: NonNull<Shared>,
    _marker: PhantomData<Shared>,
}

// SAFETY: the shared record is only mutated through `&mut self` while unique
// and the reference count is atomic.
unsafe impl Send for PooledBuffer {}
// SAFETY: see above.
unsafe impl Sync for PooledBuffer {}

impl PooledBuffer {
    /// Wraps a record with a reference count of one.
    pub(crate) fn from_shared(shared: Box<Shared>) -> Self {
        debug_assert_eq!(shared.refs.load(Ordering::Relaxed), 1);
        Self {
            ptr: NonNull::from(Box::leak(shared)),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn shared(&self) -> &Shared {
        // SAFETY: the record lives as long as any handle does.
        unsafe { self.ptr.as_ref() }
    }

    /// Returns the size of the data region.
    #[inline]
    pub fn len(&self) -> usize {
        self.shared().storage.len()
    }

    /// Returns true if the data region is empty (never the case for pooled buffers).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a pointer to the start of the data region.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.shared().storage.as_ptr()
    }

    /// Returns the bytes reserved in front of the data region.
    pub fn prefix(&self) -> &[u8] {
        self.shared().storage.prefix()
    }

    /// Returns the bytes reserved after the data region.
    pub fn postfix(&self) -> &[u8] {
        self.shared().storage.postfix()
    }

    /// Returns the number of handles to this buffer (racy).
    pub fn ref_count(&self) -> usize {
        self.shared().refs.load(Ordering::Relaxed)
    }

    /// Returns true if this is the only handle to the buffer.
    pub fn is_unique(&self) -> bool {
        self.shared().refs.load(Ordering::Acquire) == 1
    }

    /// Returns the data region mutably if this is the only handle.
    pub fn get_mut(&mut self) -> Option<&mut [u8]> {
        if !self.is_unique() {
            return None;
        }
        // SAFETY: no other handle exists and `&mut self` excludes this one.
        let shared = unsafe { self.ptr.as_mut() };
        Some(shared.storage.data_mut())
    }

    /// Returns `true` if this buffer will return to a live pool when dropped.
    pub fn is_pooled(&self) -> bool {
        self.shared().pool.strong_count() > 0
    }

    /// Orphans the buffer from its pool.
    ///
    /// The pool stops counting the buffer against its maximum, and the buffer
    /// is deallocated when its last handle is dropped.
    ///
    /// Returns `false` (and leaves the buffer pooled) if other handles exist.
    pub fn detach(&mut self) -> bool {
        if !self.is_unique() {
            return false;
        }
        // SAFETY: no other handle exists and `&mut self` excludes this one.
        let shared = unsafe { self.ptr.as_mut() };
        if let Some(pool) = mem::take(&mut shared.pool).upgrade() {
            pool.forget();
        }
        true
    }

    /// Converts the buffer into [`Bytes`] for shipping downstream.
    ///
    /// The buffer returns to its pool when the last clone or slice of the
    /// returned `Bytes` is dropped.
    pub fn into_bytes(self) -> Bytes {
        Bytes::from_owner(self)
    }
}

impl Clone for PooledBuffer {
    fn clone(&self) -> Self {
        let previous = self.shared().refs.fetch_add(1, Ordering::Relaxed);
        if previous > MAX_REFCOUNT {
            std::process::abort();
        }
        Self {
            ptr: self.ptr,
            _marker: PhantomData,
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if self.shared().refs.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        // Synchronize with every other handle's release before touching the record.
        fence(Ordering::Acquire);

        // SAFETY: this was the last handle, so the record is exclusively ours.
        let shared = unsafe { Box::from_raw(self.ptr.as_ptr()) };
        drop_or_recycle(shared);
    }
}

impl AsRef<[u8]> for PooledBuffer {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.shared().storage.data()
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .field("refs", &self.ref_count())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BufferPoolConfig, NZUsize};

    fn unpooled(size: usize) -> PooledBuffer {
        let config = BufferPoolConfig {
            min_slots: 0,
            max_slots: 0,
            buffer_size: NZUsize!(size),
            prefix: 0,
            postfix: 0,
            alignment: NZUsize!(64),
        };
        let storage = AlignedBuffer::new(&config).unwrap();
        PooledBuffer::from_shared(Shared::new(storage, Weak::new()))
    }

    #[test]
    fn test_clone_shares_storage() {
        let buffer = unpooled(128);
        let clone = buffer.clone();
        assert_eq!(buffer.as_ptr(), clone.as_ptr());
        assert_eq!(buffer.ref_count(), 2);
        assert!(!buffer.is_unique());
        drop(clone);
        assert_eq!(buffer.ref_count(), 1);
        assert!(buffer.is_unique());
    }

    #[test]
    fn test_get_mut_requires_unique() {
        let mut buffer = unpooled(16);
        buffer.get_mut().unwrap().copy_from_slice(&[5; 16]);

        let clone = buffer.clone();
        assert!(buffer.get_mut().is_none());
        assert_eq!(clone.as_ref(), &[5; 16]);
        drop(clone);
        assert!(buffer.get_mut().is_some());
    }

    #[test]
    fn test_unpooled_buffer_frees_itself() {
        let buffer = unpooled(64);
        assert!(!buffer.is_pooled());
        assert_eq!(buffer.len(), 64);
        assert!(!buffer.is_empty());
        drop(buffer);
    }

    #[test]
    fn test_detach_requires_unique() {
        let mut buffer = unpooled(64);
        let clone = buffer.clone();
        assert!(!buffer.detach());
        drop(clone);
        assert!(buffer.detach());
    }

    #[test]
    fn test_debug() {
        let buffer = unpooled(32);
        assert_eq!(
            format!("{:?}", buffer),
            "PooledBuffer { len: 32, refs: 1, pooled: false }"
        );
    }
}
