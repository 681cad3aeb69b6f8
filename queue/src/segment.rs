//! A fixed-capacity circular array of slots addressed by queue-wide cursors.
//!
//! Cursors are never wrapped: a slot is addressed by `cursor & mask`, and a
//! segment created after growth starts its cursors where its predecessor's
//! tail stopped. Each slot carries a stamp that encodes which cursor may touch
//! it next:
//!
//! - `stamp == i`: empty, the pusher that claimed cursor `i` may write.
//! - `stamp == i + 1`: full, the popper that claimed cursor `i` may read.
//! - `stamp == BUSY`: an item is being moved out or cloned.
//!
//! Once read, the stamp becomes `i + capacity`, handing the slot to the next lap.

use crossbeam_utils::{Backoff, CachePadded};
use std::{
    alloc::Layout,
    cell::UnsafeCell,
    mem::MaybeUninit,
    ptr,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

/// Flag set on a segment's tail cursor once the segment accepts no more pushes.
pub(crate) const CLOSED: usize = 1 << (usize::BITS - 1);

/// Stamp of a slot whose item is currently being moved out or cloned.
const BUSY: usize = usize::MAX;

/// Outcome of an attempt to claim the next tail cursor.
pub(crate) enum Tail {
    /// The cursor was claimed and the caller must write to it.
    Claimed(usize),
    /// The segment is closed (possibly by the caller) and will never accept another push.
    Closed,
    /// Another thread moved the cursor first.
    Contended,
}

/// Outcome of an attempt to claim the next head cursor.
pub(crate) enum Head {
    /// The cursor was claimed and the caller must read from it.
    Claimed(usize),
    /// Every pushed item has been claimed. `closed` reports whether newer
    /// items can only live in a successor segment.
    Drained { closed: bool },
    /// Another thread moved the cursor first.
    Contended,
}

struct Slot<T> {
    stamp: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub(crate) struct Segment<T> {
    capacity: usize,
    slots: Box<[Slot<T>]>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    /// Successor segment, set at most once after this segment is closed.
    pub(crate) next: AtomicPtr<Segment<T>>,
    /// Link used only while the segment waits on the retired list.
    pub(crate) retire_link: AtomicPtr<Segment<T>>,
}

impl<T> Segment<T> {
    /// Allocates a segment of `capacity` slots whose cursors start at `start`.
    ///
    /// Returns `None` if the slot array cannot be allocated.
    pub(crate) fn try_new(capacity: usize, start: usize) -> Option<Box<Self>> {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        let mask = capacity - 1;

        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity).ok()?;
        slots.extend((0..capacity).map(|index| Slot {
            // The first cursor at or after `start` that lands on this slot.
            stamp: AtomicUsize::new(start + (index.wrapping_sub(start) & mask)),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }));

        Some(Box::new(Self {
            capacity,
            slots: slots.into_boxed_slice(),
            head: CachePadded::new(AtomicUsize::new(start)),
            tail: CachePadded::new(AtomicUsize::new(start)),
            next: AtomicPtr::new(ptr::null_mut()),
            retire_link: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    /// Returns the layout of the slot array of a `capacity`-slot segment,
    /// or `None` if it overflows.
    pub(crate) fn slots_layout(capacity: usize) -> Option<Layout> {
        Layout::array::<Slot<T>>(capacity).ok()
    }

    /// Returns the number of slots.
    #[inline]
    pub(crate) const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the head cursor.
    #[inline]
    pub(crate) fn head(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }

    /// Returns the tail cursor with the closed flag stripped.
    #[inline]
    pub(crate) fn tail(&self) -> usize {
        self.tail.load(Ordering::Acquire) & !CLOSED
    }

    /// Returns `(head, tail, closed)`. The head is loaded first, so `head <= tail`.
    #[inline]
    pub(crate) fn cursors(&self) -> (usize, usize, bool) {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head, tail & !CLOSED, tail & CLOSED != 0)
    }

    #[inline]
    fn slot(&self, cursor: usize) -> &Slot<T> {
        &self.slots[cursor & (self.capacity - 1)]
    }

    /// Claims the next tail cursor, closing the segment if it is full.
    pub(crate) fn claim_tail(&self) -> Tail {
        let tail = self.tail.load(Ordering::Acquire);
        if tail & CLOSED != 0 {
            return Tail::Closed;
        }

        // The head only grows, so if the claim below succeeds, occupancy is
        // still below capacity at the moment of the claim.
        let head = self.head.load(Ordering::Acquire);
        if head > tail {
            return Tail::Contended;
        }
        if tail - head >= self.capacity {
            return match self.tail.compare_exchange(
                tail,
                tail | CLOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => Tail::Closed,
                Err(_) => Tail::Contended,
            };
        }

        match self.tail.compare_exchange_weak(
            tail,
            tail + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Tail::Claimed(tail),
            Err(_) => Tail::Contended,
        }
    }

    /// Claims the next head cursor.
    pub(crate) fn claim_head(&self) -> Head {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail & !CLOSED {
            return Head::Drained {
                closed: tail & CLOSED != 0,
            };
        }

        match self.head.compare_exchange_weak(
            head,
            head + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Head::Claimed(head),
            Err(_) => Head::Contended,
        }
    }

    /// Stores `item` at a claimed tail cursor.
    ///
    /// # Safety
    ///
    /// `cursor` must have been returned by [`Self::claim_tail`] on this segment
    /// and must be written exactly once.
    pub(crate) unsafe fn write(&self, cursor: usize, item: T) {
        let slot = self.slot(cursor);

        // Wait for the previous lap's reader to move its item out.
        let backoff = Backoff::new();
        while slot.stamp.load(Ordering::Acquire) != cursor {
            backoff.snooze();
        }

        // SAFETY: the stamp hands this slot exclusively to the claimer of `cursor`.
        unsafe { (*slot.value.get()).write(item) };
        slot.stamp.store(cursor + 1, Ordering::Release);
    }

    /// Moves the item out of a claimed head cursor.
    ///
    /// # Safety
    ///
    /// `cursor` must have been returned by [`Self::claim_head`] on this segment
    /// and must be read exactly once.
    pub(crate) unsafe fn take(&self, cursor: usize) -> T {
        let slot = self.slot(cursor);

        // Wait for the pusher that claimed the same cursor (or a peeker) to finish.
        let backoff = Backoff::new();
        while slot
            .stamp
            .compare_exchange_weak(cursor + 1, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }

        // SAFETY: the stamp was `cursor + 1`, so the slot holds an initialized item
        // and the BUSY stamp keeps every other thread away from it.
        let item = unsafe { (*slot.value.get()).assume_init_read() };
        slot.stamp.store(cursor + self.capacity, Ordering::Release);
        item
    }

    /// Clones the item at `cursor` without claiming it.
    ///
    /// Returns `None` if the item is not (or no longer) available at that cursor.
    pub(crate) fn clone_at(&self, cursor: usize) -> Option<T>
    where
        T: Clone,
    {
        let slot = self.slot(cursor);
        slot.stamp
            .compare_exchange(cursor + 1, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;

        // Restores the stamp even if `clone` panics.
        struct Restore<'a> {
            stamp: &'a AtomicUsize,
            value: usize,
        }
        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                self.stamp.store(self.value, Ordering::Release);
            }
        }
        let _restore = Restore {
            stamp: &slot.stamp,
            value: cursor + 1,
        };

        // SAFETY: the BUSY stamp was installed over a full stamp, so the item is
        // initialized and no popper can move it out until the stamp is restored.
        Some(unsafe { (*slot.value.get()).assume_init_ref() }.clone())
    }
}

impl<T> Drop for Segment<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut() & !CLOSED;
        let mask = self.capacity - 1;
        for cursor in head..tail {
            let slot = &mut self.slots[cursor & mask];
            if *slot.stamp.get_mut() == cursor + 1 {
                // SAFETY: a full stamp means the item was written and never read.
                unsafe { slot.value.get_mut().assume_init_drop() };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn claim_tail(segment: &Segment<u64>) -> usize {
        loop {
            match segment.claim_tail() {
                Tail::Claimed(cursor) => return cursor,
                Tail::Contended => continue,
                Tail::Closed => panic!("segment closed"),
            }
        }
    }

    fn claim_head(segment: &Segment<u64>) -> Option<usize> {
        loop {
            match segment.claim_head() {
                Head::Claimed(cursor) => return Some(cursor),
                Head::Contended => continue,
                Head::Drained { .. } => return None,
            }
        }
    }

    #[test]
    fn test_cursors_start_at_offset() {
        let segment = Segment::<u64>::try_new(4, 10).unwrap();
        assert_eq!(segment.capacity(), 4);
        assert_eq!(segment.head(), 10);
        assert_eq!(segment.tail(), 10);

        let cursor = claim_tail(&segment);
        assert_eq!(cursor, 10);
        unsafe { segment.write(cursor, 42) };
        assert_eq!(segment.tail(), 11);

        let cursor = claim_head(&segment).unwrap();
        assert_eq!(cursor, 10);
        assert_eq!(unsafe { segment.take(cursor) }, 42);
        assert!(claim_head(&segment).is_none());
    }

    #[test]
    fn test_full_segment_closes() {
        let segment = Segment::<u64>::try_new(2, 0).unwrap();
        for value in 0..2 {
            let cursor = claim_tail(&segment);
            unsafe { segment.write(cursor, value) };
        }
        assert!(matches!(segment.claim_tail(), Tail::Closed));

        // Closed segments stay closed even after draining.
        for expected in 0..2 {
            let cursor = claim_head(&segment).unwrap();
            assert_eq!(unsafe { segment.take(cursor) }, expected);
        }
        assert!(matches!(segment.claim_tail(), Tail::Closed));
        assert!(matches!(
            segment.claim_head(),
            Head::Drained { closed: true }
        ));
        assert_eq!(segment.tail(), 2);
    }

    #[test]
    fn test_slots_reused_across_laps() {
        let segment = Segment::<u64>::try_new(2, 3).unwrap();
        for value in 0..10 {
            let cursor = claim_tail(&segment);
            unsafe { segment.write(cursor, value) };
            let cursor = claim_head(&segment).unwrap();
            assert_eq!(unsafe { segment.take(cursor) }, value);
        }
        assert_eq!(segment.head(), 13);
        assert!(matches!(
            segment.claim_head(),
            Head::Drained { closed: false }
        ));
    }

    #[test]
    fn test_clone_at_leaves_item() {
        let segment = Segment::<String>::try_new(2, 0).unwrap();
        let cursor = match segment.claim_tail() {
            Tail::Claimed(cursor) => cursor,
            _ => unreachable!(),
        };
        assert!(segment.clone_at(cursor).is_none());
        unsafe { segment.write(cursor, "frame".to_string()) };

        assert_eq!(segment.clone_at(cursor).as_deref(), Some("frame"));
        assert_eq!(segment.clone_at(cursor).as_deref(), Some("frame"));
        assert!(segment.clone_at(cursor + 1).is_none());

        let claimed = match segment.claim_head() {
            Head::Claimed(claimed) => claimed,
            _ => unreachable!(),
        };
        assert_eq!(unsafe { segment.take(claimed) }, "frame");
        assert!(segment.clone_at(cursor).is_none());
    }

    #[test]
    fn test_drop_releases_unread_items() {
        let tracker = Arc::new(());
        {
            let segment = Segment::<Arc<()>>::try_new(4, 0).unwrap();
            for _ in 0..3 {
                let cursor = match segment.claim_tail() {
                    Tail::Claimed(cursor) => cursor,
                    _ => unreachable!(),
                };
                unsafe { segment.write(cursor, tracker.clone()) };
            }
            let cursor = match segment.claim_head() {
                Head::Claimed(cursor) => cursor,
                _ => unreachable!(),
            };
            drop(unsafe { segment.take(cursor) });
            assert_eq!(Arc::strong_count(&tracker), 3);
        }
        assert_eq!(Arc::strong_count(&tracker), 1);
    }

    #[test]
    fn test_slots_layout_covers_the_slot_array() {
        let layout = Segment::<u64>::slots_layout(8).unwrap();
        assert_eq!(layout.size(), 8 * std::mem::size_of::<Slot<u64>>());
        assert_eq!(layout.align(), std::mem::align_of::<Slot<u64>>());
        assert!(layout.size() > std::mem::size_of::<Slot<u64>>());

        assert!(Segment::<u64>::slots_layout(usize::MAX).is_none());
    }

    #[test]
    #[should_panic(expected = "capacity must be a power of two")]
    fn test_capacity_must_be_power_of_two() {
        let _ = Segment::<u64>::try_new(3, 0);
    }
}
