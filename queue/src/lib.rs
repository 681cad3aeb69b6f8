//! Grow an unbounded lock-free MPMC queue from linked, doubling segments.
//!
//! # Overview
//!
//! [`Queue`] stores items in a chain of segments. Each segment is a
//! fixed-capacity ring addressed by queue-wide cursors. When the newest
//! segment fills up it is closed and a successor with twice the capacity is
//! appended; existing items are never copied or moved. Readers drain the
//! oldest segment and step to its successor once it is empty and closed.
//!
//! Every state transition is a compare-and-swap on a cursor, a slot stamp, or
//! a segment pointer. No operation takes a lock. A popper that claims a cursor
//! whose pusher has not finished writing spins (with backoff) until the item
//! lands, and a pusher that claims a slot whose previous occupant is still
//! being read does the same.
//!
//! # Ordering
//!
//! A push happens-before the pop that returns its item. Items from a single
//! producer drained by a single consumer come out in push order. No order is
//! promised between items of different producers.
//!
//! # Reclamation
//!
//! Drained segments are retired rather than freed because a concurrent
//! operation may still hold a pointer into them. See [`Reclamation`] for the
//! available strategies.
//!
//! # Example
//!
//! ```
//! use recycle_queue::Queue;
//! use std::num::NonZeroUsize;
//!
//! let queue = Queue::new(NonZeroUsize::new(2).unwrap());
//! for frame in 0..5 {
//!     queue.push(frame);
//! }
//! assert_eq!(queue.len(), 5);
//! assert_eq!(queue.peek(), Some(0));
//! assert_eq!(queue.pop(), Some(0));
//! ```

use crossbeam_utils::{Backoff, CachePadded};
use std::{
    alloc::handle_alloc_error,
    fmt,
    num::NonZeroUsize,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};
use thiserror::Error;
use tracing::trace;

mod retired;
mod segment;

use retired::Retired;
use segment::{Head, Segment, Tail};

/// Errors that can occur when interacting with the queue.
#[derive(Error)]
pub enum Error<T> {
    /// A new segment could not be allocated. The item is handed back untouched.
    #[error("segment allocation failed")]
    AllocationFailure(T),
}

impl<T> fmt::Debug for Error<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationFailure(_) => f.write_str("AllocationFailure(..)"),
        }
    }
}

impl<T> Error<T> {
    /// Returns the item that could not be pushed.
    pub fn into_inner(self) -> T {
        match self {
            Self::AllocationFailure(item) => item,
        }
    }
}

/// How retired segments are reclaimed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Reclamation {
    /// Keep every retired segment until the queue is dropped.
    ///
    /// Peak memory is bounded by the number of growth events rather than by
    /// the number of live items. Because capacity doubles, a queue that once
    /// held `n` items retains at most about `2n` slots.
    #[default]
    Retain,
    /// Free retired segments whenever no operation is in flight.
    ///
    /// Every operation pays for two extra atomic updates on a shared counter,
    /// and segments are only freed during quiet moments, so a queue that is
    /// never idle behaves like [`Reclamation::Retain`].
    ReaderCounted,
}

/// Configuration for a [`Queue`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Capacity of the first segment, rounded up to a power of two.
    pub initial_capacity: NonZeroUsize,
    /// Strategy used to free retired segments.
    pub reclamation: Reclamation,
}

/// An unbounded multi-producer, multi-consumer lock-free queue.
pub struct Queue<T> {
    /// Oldest segment that may still hold unclaimed items.
    head: CachePadded<AtomicPtr<Segment<T>>>,
    /// Newest segment accepting pushes.
    tail: CachePadded<AtomicPtr<Segment<T>>>,
    retired: Retired<T>,
}

// SAFETY: items are moved between threads, never shared.
unsafe impl<T: Send> Send for Queue<T> {}
// SAFETY: all shared state is accessed through atomics and slot stamps.
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("retired", &self.retired())
            .finish()
    }
}

impl<T> Queue<T> {
    /// Creates an empty queue that retains retired segments until dropped.
    ///
    /// # Panics
    ///
    /// Panics if `initial_capacity` cannot be rounded up to a power of two.
    pub fn new(initial_capacity: NonZeroUsize) -> Self {
        Self::with_config(Config {
            initial_capacity,
            reclamation: Reclamation::Retain,
        })
    }

    /// Creates an empty queue with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics if `initial_capacity` cannot be rounded up to a power of two.
    pub fn with_config(config: Config) -> Self {
        let capacity = config
            .initial_capacity
            .get()
            .checked_next_power_of_two()
            .expect("initial capacity too large");
        let first = Segment::try_new(capacity, 0).unwrap_or_else(|| alloc_failed::<T>(capacity));
        let first = Box::into_raw(first);
        Self {
            head: CachePadded::new(AtomicPtr::new(first)),
            tail: CachePadded::new(AtomicPtr::new(first)),
            retired: Retired::new(config.reclamation),
        }
    }

    /// Appends an item to the back of the queue.
    ///
    /// Never blocks on other operations. If the queue has to grow and the
    /// allocator fails, this diverges through [`handle_alloc_error`], as
    /// `Vec::push` does. Use [`Self::try_push`] to observe the failure instead.
    pub fn push(&self, item: T) {
        if let Err((_, capacity)) = self.push_or_grow(item) {
            alloc_failed::<T>(capacity);
        }
    }

    /// Appends an item to the back of the queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailure`] with the item if the queue had to
    /// grow and the new segment could not be allocated. The queue is left
    /// exactly as it was.
    pub fn try_push(&self, item: T) -> Result<(), Error<T>> {
        self.push_or_grow(item).map_err(|(item, _)| Error::AllocationFailure(item))
    }

    /// Pushes `item`, growing the queue if needed. On failure, hands back the
    /// item and the capacity of the segment that could not be allocated.
    fn push_or_grow(&self, item: T) -> Result<(), (T, usize)> {
        let _guard = self.retired.enter();
        let backoff = Backoff::new();
        loop {
            let current = self.tail.load(Ordering::Acquire);
            // SAFETY: the guard keeps every segment reachable at entry alive.
            let segment = unsafe { &*current };
            match segment.claim_tail() {
                Tail::Claimed(cursor) => {
                    // SAFETY: the cursor was just claimed on this segment.
                    unsafe { segment.write(cursor, item) };
                    return Ok(());
                }
                Tail::Contended => backoff.spin(),
                Tail::Closed => {
                    let mut next = segment.next.load(Ordering::Acquire);
                    if next.is_null() {
                        let capacity = segment.capacity().checked_mul(2).unwrap_or(usize::MAX);
                        let grown = capacity
                            .is_power_of_two()
                            .then(|| Segment::try_new(capacity, segment.tail()))
                            .flatten();
                        let Some(grown) = grown else {
                            return Err((item, capacity));
                        };
                        let grown = Box::into_raw(grown);
                        match segment.next.compare_exchange(
                            ptr::null_mut(),
                            grown,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                trace!(
                                    capacity = segment.capacity() * 2,
                                    start = segment.tail(),
                                    "grew queue"
                                );
                                next = grown;
                            }
                            Err(existing) => {
                                // SAFETY: the losing segment was never published.
                                drop(unsafe { Box::from_raw(grown) });
                                next = existing;
                            }
                        }
                    }
                    let _ = self.tail.compare_exchange(
                        current,
                        next,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
            }
        }
    }

    /// Removes the item at the front of the queue.
    ///
    /// Returns `None` if the queue was empty when observed.
    pub fn pop(&self) -> Option<T> {
        let _guard = self.retired.enter();
        let backoff = Backoff::new();
        loop {
            let current = self.head.load(Ordering::Acquire);
            // SAFETY: the guard keeps every segment reachable at entry alive.
            let segment = unsafe { &*current };
            match segment.claim_head() {
                // SAFETY: the cursor was just claimed on this segment.
                Head::Claimed(cursor) => return Some(unsafe { segment.take(cursor) }),
                Head::Contended => backoff.spin(),
                Head::Drained { closed } => {
                    if !self.advance_head(current, closed) {
                        return None;
                    }
                }
            }
        }
    }

    /// Returns a clone of the item at the front of the queue without removing it.
    ///
    /// This is a best-effort snapshot: another thread may pop the returned item
    /// before the caller looks at it. Never base a correctness decision on it.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let _guard = self.retired.enter();
        let backoff = Backoff::new();
        loop {
            let current = self.head.load(Ordering::Acquire);
            // SAFETY: the guard keeps every segment reachable at entry alive.
            let segment = unsafe { &*current };
            let (head, tail, closed) = segment.cursors();
            if head == tail {
                if !self.advance_head(current, closed) {
                    return None;
                }
                continue;
            }
            if let Some(item) = segment.clone_at(head) {
                return Some(item);
            }
            // Either popped under us or not yet written.
            backoff.snooze();
        }
    }

    /// Returns an approximate number of queued items.
    ///
    /// The value is a racy snapshot: concurrent pushes, pops, and growth can
    /// make it stale the moment it is read. Once every operation has
    /// completed, it is exact.
    pub fn len(&self) -> usize {
        let _guard = self.retired.enter();
        // SAFETY: the guard keeps every segment reachable at entry alive.
        let head = unsafe { &*self.head.load(Ordering::Acquire) }.head();
        // SAFETY: as above.
        let tail = unsafe { &*self.tail.load(Ordering::Acquire) }.tail();
        tail.saturating_sub(head)
    }

    /// Returns whether the queue appeared empty. Subject to the same races as [`Self::len`].
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the capacity of the newest segment (racy).
    pub fn capacity(&self) -> usize {
        let _guard = self.retired.enter();
        // SAFETY: the guard keeps every segment reachable at entry alive.
        unsafe { &*self.tail.load(Ordering::Acquire) }.capacity()
    }

    /// Returns the number of segments reachable from the head (racy).
    pub fn segments(&self) -> usize {
        let _guard = self.retired.enter();
        let mut count = 0;
        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() {
            count += 1;
            // SAFETY: successors of a live segment are live.
            current = unsafe { &*current }.next.load(Ordering::Acquire);
        }
        count
    }

    /// Returns the number of retired segments not yet freed (racy).
    pub fn retired(&self) -> usize {
        self.retired.parked()
    }

    /// Moves the head root off a drained segment.
    ///
    /// Returns `false` if the queue is empty, `true` if the caller should retry.
    fn advance_head(&self, current: *mut Segment<T>, closed: bool) -> bool {
        if !closed {
            return false;
        }
        // SAFETY: the caller holds a guard and loaded `current` from the head root.
        let segment = unsafe { &*current };
        let next = segment.next.load(Ordering::Acquire);
        if next.is_null() {
            // Closed but the successor is still being appended: nothing newer exists yet.
            return false;
        }

        // Swing the tail first so the retired segment is unreachable from both roots.
        let _ = self
            .tail
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire);
        if self
            .head
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // SAFETY: this thread won the head exchange, so it alone retires the
            // segment, which neither root references anymore.
            unsafe { self.retired.retire(current) };
        }
        true
    }
}

/// Diverges after a segment of `capacity` slots could not be allocated.
fn alloc_failed<T>(capacity: usize) -> ! {
    match Segment::<T>::slots_layout(capacity) {
        Some(layout) => handle_alloc_error(layout),
        None => panic!("queue capacity overflow"),
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        while !current.is_null() {
            // SAFETY: exclusive access; live segments are owned by the chain.
            let mut segment = unsafe { Box::from_raw(current) };
            current = *segment.next.get_mut();
            drop(segment);
        }
        // Retired segments are freed when `self.retired` drops.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recycle_macros::test_traced;
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Barrier,
        },
        thread,
    };

    fn nz(value: usize) -> NonZeroUsize {
        NonZeroUsize::new(value).unwrap()
    }

    fn reader_counted(capacity: usize) -> Queue<u64> {
        Queue::with_config(Config {
            initial_capacity: nz(capacity),
            reclamation: Reclamation::ReaderCounted,
        })
    }

    #[test]
    fn test_empty_queue() {
        let queue = Queue::<u64>::new(nz(4));
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.peek(), None);
        assert_eq!(queue.len(), 0);
        assert!(queue.is_empty());
        assert_eq!(queue.segments(), 1);
    }

    #[test]
    fn test_capacity_rounds_up() {
        let queue = Queue::<u64>::new(nz(5));
        assert_eq!(queue.capacity(), 8);
        let queue = Queue::<u64>::new(nz(1));
        assert_eq!(queue.capacity(), 1);
    }

    #[test]
    fn test_fifo_single_thread() {
        let queue = Queue::new(nz(4));
        for value in 0..3u64 {
            queue.push(value);
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peek(), Some(0));
        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.pop(), Some(1));
        queue.push(3);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test_traced("TRACE")]
    fn test_growth_doubles_and_preserves_order() {
        let queue = Queue::new(nz(2));
        for value in 0..20u64 {
            queue.push(value);
        }
        // 2 + 4 + 8 + 16 slots.
        assert_eq!(queue.segments(), 4);
        assert_eq!(queue.capacity(), 16);
        assert_eq!(queue.len(), 20);

        for expected in 0..20u64 {
            assert_eq!(queue.pop(), Some(expected));
        }
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.len(), 0);

        // Drained segments were retired, not freed.
        assert_eq!(queue.segments(), 1);
        assert_eq!(queue.retired(), 3);
    }

    #[test]
    fn test_full_segment_never_reopens() {
        let queue = Queue::new(nz(2));
        queue.push(0u64);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.segments(), 2);

        // Freeing a slot in the first segment must not let pushes land behind newer items.
        assert_eq!(queue.pop(), Some(0));
        queue.push(3);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
    }

    #[test]
    fn test_peek_advances_past_drained_segment() {
        let queue = Queue::new(nz(1));
        queue.push(10u64);
        queue.push(11);
        assert_eq!(queue.pop(), Some(10));
        assert_eq!(queue.peek(), Some(11));
        assert_eq!(queue.segments(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(11));
        assert_eq!(queue.peek(), None);
    }

    #[test]
    fn test_reader_counted_frees_retired_segments() {
        let queue = reader_counted(1);
        for value in 0..16 {
            queue.push(value);
        }
        for expected in 0..16 {
            assert_eq!(queue.pop(), Some(expected));
        }
        // Every operation has exited, so nothing is left parked.
        assert_eq!(queue.retired(), 0);
        assert_eq!(queue.segments(), 1);
    }

    #[test]
    fn test_drop_releases_queued_items() {
        let tracker = Arc::new(());
        {
            let queue = Queue::new(nz(2));
            for _ in 0..9 {
                queue.push(tracker.clone());
            }
            drop(queue.pop());
            drop(queue.pop());
            drop(queue.pop());
            assert_eq!(Arc::strong_count(&tracker), 7);
        }
        assert_eq!(Arc::strong_count(&tracker), 1);
    }

    #[test]
    fn test_error_returns_item() {
        let err = Error::AllocationFailure(7u64);
        assert_eq!(err.to_string(), "segment allocation failed");
        assert_eq!(format!("{:?}", err), "AllocationFailure(..)");
        assert_eq!(err.into_inner(), 7);
    }

    fn spsc_in_order(queue: Arc<Queue<u64>>, count: u64) {
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                for value in 0..count {
                    queue.push(value);
                }
            })
        };
        let mut expected = 0;
        while expected < count {
            if let Some(value) = queue.pop() {
                assert_eq!(value, expected);
                expected += 1;
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_spsc_preserves_order() {
        cfg_if::cfg_if! {
            if #[cfg(miri)] {
                let count = 200;
            } else {
                let count = 100_000;
            }
        }
        spsc_in_order(Arc::new(Queue::new(nz(16))), count);
    }

    #[test]
    fn test_growth_across_threads() {
        // Ten times the initial capacity, pushed on one thread and popped on another.
        let initial = 64;
        spsc_in_order(Arc::new(Queue::new(nz(initial))), 10 * initial as u64);
    }

    #[test]
    fn test_spsc_preserves_order_reader_counted() {
        spsc_in_order(Arc::new(reader_counted(2)), 10_000);
    }

    fn mpmc_exactly_once(queue: Arc<Queue<u64>>, producers: u64, consumers: usize, total: u64) {
        let per_producer = total / producers;
        let total = per_producer * producers;
        let popped = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(producers as usize + consumers));

        let mut pushers = Vec::new();
        for producer in 0..producers {
            let queue = queue.clone();
            let barrier = barrier.clone();
            pushers.push(thread::spawn(move || {
                barrier.wait();
                let start = producer * per_producer;
                for value in start..start + per_producer {
                    queue.push(value);
                }
            }));
        }

        let mut poppers = Vec::new();
        for _ in 0..consumers {
            let queue = queue.clone();
            let barrier = barrier.clone();
            let popped = popped.clone();
            poppers.push(thread::spawn(move || {
                barrier.wait();
                let mut seen = Vec::new();
                while popped.load(Ordering::Acquire) < total as usize {
                    match queue.pop() {
                        Some(value) => {
                            seen.push(value);
                            popped.fetch_add(1, Ordering::AcqRel);
                        }
                        None => thread::yield_now(),
                    }
                }
                seen
            }));
        }

        for pusher in pushers {
            pusher.join().unwrap();
        }
        let mut all = HashSet::new();
        let mut count = 0;
        for popper in poppers {
            for value in popper.join().unwrap() {
                assert!(all.insert(value), "value {value} popped twice");
                count += 1;
            }
        }
        assert_eq!(count, total);
        assert_eq!(all, (0..total).collect::<HashSet<_>>());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_mpmc_no_loss_no_duplication() {
        cfg_if::cfg_if! {
            if #[cfg(miri)] {
                let total = 64;
            } else {
                let total = 20_000;
            }
        }
        for producers in [1u64, 2, 8] {
            for consumers in [1usize, 2, 8] {
                mpmc_exactly_once(Arc::new(Queue::new(nz(4))), producers, consumers, total);
            }
        }
    }

    #[test]
    fn test_mpmc_no_loss_no_duplication_reader_counted() {
        for producers in [1u64, 2, 8] {
            for consumers in [1usize, 2, 8] {
                mpmc_exactly_once(Arc::new(reader_counted(4)), producers, consumers, 8_000);
            }
        }
    }

    #[test]
    fn test_len_exact_after_quiescence() {
        let queue = Arc::new(Queue::new(nz(8)));
        let handles: Vec<_> = (0..4u64)
            .map(|producer| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for value in 0..1_000 {
                        queue.push(producer * 1_000 + value);
                        if value % 3 == 0 {
                            queue.pop();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let remaining = queue.len();
        let mut drained = 0;
        while queue.pop().is_some() {
            drained += 1;
        }
        assert_eq!(remaining, drained);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_peek_races_with_pop() {
        let queue = Arc::new(Queue::new(nz(4)));
        for value in 0..10_000u64 {
            queue.push(value);
        }
        let peeker = {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut last = 0;
                while let Some(value) = queue.peek() {
                    // The front only ever moves forward.
                    assert!(value >= last);
                    last = value;
                }
            })
        };
        for expected in 0..10_000u64 {
            assert_eq!(queue.pop(), Some(expected));
        }
        peeker.join().unwrap();
    }
}
