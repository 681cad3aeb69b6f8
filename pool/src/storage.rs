use crate::BufferPoolConfig;
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    ptr::NonNull,
    slice,
};

/// Aligned backing memory of a single buffer.
///
/// The allocation is zeroed once, when it is created, so every byte is
/// initialized. Recycled buffers keep whatever their previous user wrote.
pub(crate) struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    /// Offset of the data region from the start of the allocation.
    offset: usize,
    len: usize,
    prefix: usize,
    postfix: usize,
}

// SAFETY: AlignedBuffer owns its memory and can be sent between threads.
unsafe impl Send for AlignedBuffer {}
// SAFETY: AlignedBuffer's memory is not shared (no interior mutability of pointer).
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocates a buffer shaped by `config`.
    ///
    /// Returns `None` if the layout is invalid or the allocator fails.
    pub(crate) fn new(config: &BufferPoolConfig) -> Option<Self> {
        let (layout, offset) = config.layout()?;

        // SAFETY: the layout has a non-zero size (the data region is non-empty).
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })?;

        Some(Self {
            ptr,
            layout,
            offset,
            len: config.buffer_size.get(),
            prefix: config.prefix,
            postfix: config.postfix,
        })
    }

    /// Returns the size of the data region.
    #[inline]
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    /// Returns a pointer to the start of the data region.
    #[inline]
    pub(crate) fn as_ptr(&self) -> *const u8 {
        // SAFETY: offset is within the allocation.
        unsafe { self.ptr.as_ptr().add(self.offset) }
    }

    #[inline]
    pub(crate) fn data(&self) -> &[u8] {
        // SAFETY: the whole allocation is initialized and `offset + len` is in bounds.
        unsafe { slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    #[inline]
    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `data`, and `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr().add(self.offset), self.len) }
    }

    /// The `prefix` bytes immediately before the data region.
    #[inline]
    pub(crate) fn prefix(&self) -> &[u8] {
        // SAFETY: `prefix <= offset`, so the range starts inside the allocation.
        unsafe { slice::from_raw_parts(self.as_ptr().sub(self.prefix), self.prefix) }
    }

    /// The `postfix` bytes immediately after the data region.
    #[inline]
    pub(crate) fn postfix(&self) -> &[u8] {
        // SAFETY: `offset + len + postfix` is the size of the allocation.
        unsafe { slice::from_raw_parts(self.as_ptr().add(self.len), self.postfix) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
