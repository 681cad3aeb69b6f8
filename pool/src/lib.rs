//! Recycle fixed-shape aligned buffers through a lock-free free-list.
//!
//! # Overview
//!
//! A [`BufferPool`] hands out [`PooledBuffer`]s of a single shape (size,
//! alignment, and padding, see [`BufferPoolConfig`]). Idle buffers wait in a
//! [`recycle_queue::Queue`]; acquiring pops one, and dropping the last handle
//! to a buffer pushes it back. Fresh buffers are only allocated when the queue
//! is empty and the pool is below its `max_slots`, so a pipeline in steady
//! state performs no heap allocation and takes no lock.
//!
//! # Flushing
//!
//! [`BufferPool::set_flushing`] puts the pool in a draining state: acquires
//! fail with [`Error::Flushing`], idle buffers are freed, and buffers returned
//! late are freed instead of recycled. Dropping every pool handle has the same
//! effect on outstanding buffers, which free themselves once they find their
//! pool gone.
//!
//! # Example
//!
//! ```
//! use prometheus_client::registry::Registry;
//! use recycle_pool::{BufferPool, BufferPoolConfig};
//!
//! let mut registry = Registry::default();
//! let pool = BufferPool::new(BufferPoolConfig::for_audio(), &mut registry).unwrap();
//!
//! let mut buffer = pool.try_acquire().unwrap();
//! buffer.get_mut().unwrap()[0] = 1;
//! let frame = buffer.into_bytes();
//! assert_eq!(frame[0], 1);
//! drop(frame); // back in the pool
//! ```

use prometheus_client::registry::Registry;
use recycle_queue::Queue;
use std::{
    fmt, iter,
    num::NonZeroUsize,
    sync::{
        atomic::{fence, AtomicBool, AtomicUsize, Ordering},
        Arc, Condvar, Mutex, RwLock,
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, trace, warn};

mod buffer;
mod config;
mod metrics;
mod storage;

use buffer::Shared;
pub use buffer::PooledBuffer;
pub use config::{cache_line_size, page_size, BufferPoolConfig};
use metrics::Metrics;
use storage::AlignedBuffer;

/// Unwrap a value known to be non-zero, or panic.
#[macro_export]
macro_rules! NZUsize {
    ($val:expr) => {
        match ::std::num::NonZeroUsize::new($val) {
            Some(v) => v,
            None => panic!("value must be non-zero"),
        }
    };
}

/// Errors that can occur when acquiring buffers or configuring a pool.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("pool is flushing")]
    Flushing,
    #[error("pool exhausted")]
    Exhausted,
    #[error("timed out waiting for a buffer")]
    Timeout,
    #[error("buffer allocation failed")]
    AllocationFailure,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("pool already handed out buffers")]
    Configured,
}

/// Capacity of the free-list when the pool is unbounded and not prefilled.
const FREE_LIST_CAPACITY: NonZeroUsize = NZUsize!(16);

/// Threads blocked in [`BufferPool::acquire`] waiting for a release.
struct Waiters {
    count: AtomicUsize,
    lock: Mutex<()>,
    cv: Condvar,
}

impl Waiters {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Wakes one waiter, if any is registered.
    fn notify_one(&self) {
        // Pairs with the fence in `BufferPool::wait`: either the waiter sees
        // our change when it retries, or we see its registration.
        fence(Ordering::SeqCst);
        if self.count.load(Ordering::SeqCst) == 0 {
            return;
        }
        let _guard = self.lock.lock().unwrap();
        self.cv.notify_one();
    }

    /// Wakes every registered waiter.
    fn notify_all(&self) {
        fence(Ordering::SeqCst);
        if self.count.load(Ordering::SeqCst) == 0 {
            return;
        }
        let _guard = self.lock.lock().unwrap();
        self.cv.notify_all();
    }
}

/// State shared by every [`BufferPool`] handle and (weakly) by every buffer.
pub(crate) struct PoolInner {
    config: RwLock<BufferPoolConfig>,
    /// Idle buffers.
    queue: Queue<Box<Shared>>,
    /// Buffers owned by the pool, idle or outstanding.
    live: AtomicUsize,
    flushing: AtomicBool,
    /// Set by the first acquire. Freezes the configuration.
    started: AtomicBool,
    waiters: Waiters,
    metrics: Metrics,
}

impl PoolInner {
    /// Returns a buffer whose last handle was dropped to the free-list.
    pub(crate) fn recycle(&self, mut shared: Box<Shared>) {
        if self.flushing.load(Ordering::SeqCst) {
            self.destroy(shared);
            return;
        }

        shared.revive();
        self.queue.push(shared);
        self.metrics.recycled_total.inc();
        self.metrics.available.inc();
        trace!("recycled buffer");

        // A flush that started after the check above may have drained the
        // free-list before our push landed.
        fence(Ordering::SeqCst);
        if self.flushing.load(Ordering::SeqCst) {
            self.drain();
        }
        self.waiters.notify_one();
    }

    /// Stops accounting for a buffer that was detached from the pool.
    pub(crate) fn forget(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.metrics.allocated.dec();
        self.waiters.notify_one();
    }

    /// Frees a buffer owned by the pool.
    fn destroy(&self, shared: Box<Shared>) {
        drop(shared);
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.metrics.allocated.dec();
        self.metrics.freed_total.inc();
        self.waiters.notify_one();
    }

    /// Frees every idle buffer, returning how many were freed.
    fn drain(&self) -> usize {
        let mut freed = 0;
        while let Some(shared) = self.queue.pop() {
            self.metrics.available.dec();
            self.destroy(shared);
            freed += 1;
        }
        freed
    }
}

/// A pool of reusable, aligned buffers.
///
/// Cloning is cheap; every clone refers to the same pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("live", &self.live())
            .field("available", &self.available())
            .field("flushing", &self.is_flushing())
            .finish()
    }
}

impl BufferPool {
    /// Creates a pool, registers its metrics, and allocates `min_slots`
    /// buffers up front.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration does not validate
    /// and [`Error::AllocationFailure`] if a prefilled buffer cannot be allocated.
    pub fn new(config: BufferPoolConfig, registry: &mut Registry) -> Result<Self, Error> {
        config.validate()?;

        // A bounded pool never needs the free-list to grow.
        let capacity =
            NonZeroUsize::new(config.max_slots.max(config.min_slots)).unwrap_or(FREE_LIST_CAPACITY);
        let pool = Self {
            inner: Arc::new(PoolInner {
                config: RwLock::new(config),
                queue: Queue::new(capacity),
                live: AtomicUsize::new(0),
                flushing: AtomicBool::new(false),
                started: AtomicBool::new(false),
                waiters: Waiters::new(),
                metrics: Metrics::new(registry),
            }),
        };
        pool.prefill()?;
        Ok(pool)
    }

    /// Replaces the configuration, freeing idle buffers and prefilling with
    /// the new shape.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configured`] once the pool has served an acquire, and
    /// [`Error::InvalidConfig`] if `config` does not validate.
    pub fn configure(&self, config: BufferPoolConfig) -> Result<(), Error> {
        config.validate()?;
        let idle: Vec<_> = {
            let mut current = self.inner.config.write().unwrap();
            if self.inner.started.load(Ordering::SeqCst) {
                return Err(Error::Configured);
            }
            debug!(?config, "reconfigured buffer pool");
            *current = config;
            iter::from_fn(|| self.inner.queue.pop()).collect()
        };

        // Destroying notifies waiters, which must not happen under the config lock.
        for shared in idle {
            self.inner.metrics.available.dec();
            self.inner.destroy(shared);
        }
        self.prefill()
    }

    /// Returns the current configuration.
    pub fn config(&self) -> BufferPoolConfig {
        self.inner.config.read().unwrap().clone()
    }

    fn prefill(&self) -> Result<(), Error> {
        let config = self.config();
        for _ in 0..config.min_slots {
            let shared = self.allocate(&config)?;
            self.inner.queue.push(shared);
            self.inner.metrics.available.inc();
        }
        if config.min_slots > 0 {
            debug!(count = config.min_slots, "prefilled buffer pool");
        }
        Ok(())
    }

    /// Reserves a slot under `max_slots` and allocates a buffer for it.
    fn allocate(&self, config: &BufferPoolConfig) -> Result<Box<Shared>, Error> {
        let reserved = self
            .inner
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                config.has_room(live).then_some(live + 1)
            });
        if reserved.is_err() {
            return Err(Error::Exhausted);
        }

        let Some(storage) = AlignedBuffer::new(config) else {
            self.inner.live.fetch_sub(1, Ordering::AcqRel);
            warn!(size = config.buffer_size.get(), "buffer allocation failed");
            return Err(Error::AllocationFailure);
        };
        self.inner.metrics.allocated.inc();
        Ok(Shared::new(storage, Arc::downgrade(&self.inner)))
    }

    /// Acquires a buffer, optionally blocking while the pool is at `max_slots`.
    ///
    /// An idle buffer is reused if one exists. Otherwise a new one is
    /// allocated, unless the pool is at its maximum, in which case this either
    /// fails with [`Error::Exhausted`] (`wait == false`) or blocks until a
    /// buffer is released or the pool starts flushing (`wait == true`).
    ///
    /// # Errors
    ///
    /// - [`Error::Flushing`] if the pool is flushing (checked before anything else)
    /// - [`Error::Exhausted`] if the pool is at its maximum and `wait` is false
    /// - [`Error::AllocationFailure`] if a new buffer cannot be allocated
    pub fn acquire(&self, wait: bool) -> Result<PooledBuffer, Error> {
        match self.acquire_once() {
            Err(Error::Exhausted) if wait => self.wait(None),
            result => self.observe(result),
        }
    }

    /// Acquires a buffer without blocking. Equivalent to `acquire(false)`.
    pub fn try_acquire(&self) -> Result<PooledBuffer, Error> {
        self.acquire(false)
    }

    /// Acquires a buffer, blocking for at most `timeout` while the pool is at
    /// `max_slots`.
    ///
    /// # Errors
    ///
    /// As [`Self::acquire`], with [`Error::Timeout`] in place of [`Error::Exhausted`].
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PooledBuffer, Error> {
        match self.acquire_once() {
            Err(Error::Exhausted) => self.wait(Instant::now().checked_add(timeout)),
            result => self.observe(result),
        }
    }

    fn acquire_once(&self) -> Result<PooledBuffer, Error> {
        let inner = &self.inner;
        if inner.flushing.load(Ordering::SeqCst) {
            return Err(Error::Flushing);
        }
        // Held across the pop and the allocation so `configure` cannot swap
        // the shape between marking the pool started and handing out a buffer.
        let config = inner.config.read().unwrap();
        inner.started.store(true, Ordering::SeqCst);

        if let Some(shared) = inner.queue.pop() {
            inner.metrics.available.dec();
            return Ok(PooledBuffer::from_shared(shared));
        }

        let shared = self.allocate(&config)?;
        trace!(live = inner.live.load(Ordering::Relaxed), "allocated buffer");
        Ok(PooledBuffer::from_shared(shared))
    }

    /// Blocks until a buffer can be acquired, the pool starts flushing, or
    /// `deadline` passes (`None` waits forever).
    fn wait(&self, deadline: Option<Instant>) -> Result<PooledBuffer, Error> {
        let waiters = &self.inner.waiters;
        let mut guard = waiters.lock.lock().unwrap();
        waiters.count.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        let result = loop {
            match self.acquire_once() {
                Err(Error::Exhausted) => {}
                result => break result,
            }
            guard = match deadline {
                None => waiters.cv.wait(guard).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Err(Error::Timeout);
                    }
                    waiters.cv.wait_timeout(guard, deadline - now).unwrap().0
                }
            };
        };

        waiters.count.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
        self.observe(result)
    }

    /// Records the outcome of an acquire.
    fn observe(&self, result: Result<PooledBuffer, Error>) -> Result<PooledBuffer, Error> {
        let metrics = &self.inner.metrics;
        match &result {
            Ok(_) => {
                metrics.acquisitions_total.inc();
            }
            Err(Error::Exhausted | Error::Timeout) => {
                metrics.exhausted_total.inc();
            }
            Err(Error::Flushing) => {
                metrics.flushing_total.inc();
            }
            Err(_) => {}
        }
        result
    }

    /// Returns a buffer to the pool.
    ///
    /// Equivalent to dropping the handle: if it was the last one, the buffer
    /// is recycled (or freed while flushing).
    pub fn release(&self, buffer: PooledBuffer) {
        drop(buffer);
    }

    /// Enters or leaves the flushing state.
    ///
    /// Entering frees every idle buffer and wakes all waiters, which then fail
    /// with [`Error::Flushing`]. While flushing, buffers whose last handle is
    /// dropped are freed instead of recycled. Leaving resumes normal operation.
    pub fn set_flushing(&self, flushing: bool) {
        let previous = self.inner.flushing.swap(flushing, Ordering::SeqCst);
        if flushing {
            let freed = self.inner.drain();
            self.inner.waiters.notify_all();
            debug!(freed, live = self.live(), "buffer pool flushing");
        } else if previous {
            debug!("buffer pool resumed");
        }
    }

    /// Returns whether the pool is flushing.
    pub fn is_flushing(&self) -> bool {
        self.inner.flushing.load(Ordering::SeqCst)
    }

    /// Returns the number of buffers owned by the pool, idle or outstanding (racy).
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::Relaxed)
    }

    /// Returns the number of idle buffers (racy).
    pub fn available(&self) -> usize {
        self.inner.queue.len()
    }
}
