//! Shape of the buffers handed out by a pool.

use crate::Error;
use std::{alloc::Layout, num::NonZeroUsize};

/// Returns the system page size.
///
/// On Unix systems, queries the actual page size via `sysconf`.
/// On other systems (Windows), defaults to 4KB.
#[cfg(unix)]
pub fn page_size() -> usize {
    // SAFETY: sysconf is safe to call.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096 // Safe fallback if sysconf fails
    } else {
        size as usize
    }
}

#[cfg(not(unix))]
#[allow(clippy::missing_const_for_fn)]
pub fn page_size() -> usize {
    4096
}

/// Returns the cache line size for the current architecture.
///
/// Uses 128 bytes for x86_64 and aarch64 as a conservative estimate that
/// accounts for spatial prefetching. Uses 64 bytes for other architectures.
pub const fn cache_line_size() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))] {
            128
        } else {
            64
        }
    }
}

/// Configuration for a buffer pool.
///
/// Every buffer of a pool has the same shape:
///
/// ```text
/// [padding][prefix][data....................][postfix]
/// ^                ^
/// |                aligned to `alignment`
/// allocation start (aligned to `alignment`)
/// ```
///
/// Padding is only present when `prefix` is not a multiple of `alignment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferPoolConfig {
    /// Number of buffers allocated up front when the pool is configured.
    pub min_slots: usize,
    /// Maximum number of live buffers (idle or outstanding). Zero means unbounded.
    pub max_slots: usize,
    /// Size of the data region of each buffer.
    pub buffer_size: NonZeroUsize,
    /// Bytes reserved in front of the data region.
    pub prefix: usize,
    /// Bytes reserved after the data region.
    pub postfix: usize,
    /// Alignment of the data region. Must be a power of two.
    pub alignment: NonZeroUsize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self::for_audio()
    }
}

impl BufferPoolConfig {
    /// Audio preset: 4KB cache-line aligned buffers, 8 allocated up front,
    /// unbounded.
    ///
    /// Audio pipelines push many small periods (1024 stereo 16-bit frames fit
    /// in 4KB). Allocation is cheap at that size, so the pool is allowed to
    /// grow with the pipeline's latency.
    pub const fn for_audio() -> Self {
        let cache_line = crate::NZUsize!(cache_line_size());
        Self {
            min_slots: 8,
            max_slots: 0,
            buffer_size: crate::NZUsize!(4096),
            prefix: 0,
            postfix: 0,
            alignment: cache_line,
        }
    }

    /// Video preset: page-aligned 1080p RGBA frames, 2 allocated up front,
    /// at most 16 live.
    ///
    /// Frames are large, so the pool is bounded and callers are expected to
    /// apply backpressure when it is exhausted. A cache line of postfix leaves
    /// room for SIMD kernels that read past the last pixel.
    pub fn for_video() -> Self {
        Self {
            min_slots: 2,
            max_slots: 16,
            buffer_size: crate::NZUsize!(1920 * 1080 * 4),
            prefix: 0,
            postfix: cache_line_size(),
            alignment: crate::NZUsize!(page_size()),
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if:
    /// - `alignment` is not a power of two
    /// - `min_slots > max_slots` while `max_slots` is bounded
    /// - the buffer layout overflows
    pub fn validate(&self) -> Result<(), Error> {
        if !self.alignment.is_power_of_two() {
            return Err(Error::InvalidConfig("alignment must be a power of two"));
        }
        if self.max_slots != 0 && self.min_slots > self.max_slots {
            return Err(Error::InvalidConfig("min_slots must be <= max_slots"));
        }
        if self.layout().is_none() {
            return Err(Error::InvalidConfig("buffer layout overflows"));
        }
        Ok(())
    }

    /// Returns whether `live` buffers leave room for another one.
    pub(crate) const fn has_room(&self, live: usize) -> bool {
        self.max_slots == 0 || live < self.max_slots
    }

    /// Returns the allocation layout and the offset of the data region.
    pub(crate) fn layout(&self) -> Option<(Layout, usize)> {
        let alignment = self.alignment.get();
        let offset = self.prefix.checked_next_multiple_of(alignment)?;
        let size = offset
            .checked_add(self.buffer_size.get())?
            .checked_add(self.postfix)?;
        let layout = Layout::from_size_align(size, alignment).ok()?;
        Some((layout, offset))
    }
}
