//! Segments unlinked from the queue but not yet freed.
//!
//! A segment is retired once `head` has moved past it. A thread that loaded
//! the segment before the move may still be dereferencing it, so retirement
//! only parks the segment on a stack. What happens next depends on the
//! [`Reclamation`] strategy:
//!
//! - [`Reclamation::Retain`]: parked segments are freed when the queue drops.
//! - [`Reclamation::ReaderCounted`]: every operation registers in an active
//!   count. The thread whose exit brings the count to zero takes the whole
//!   stack and frees it if the count is still zero afterwards. Any thread that
//!   entered in between might hold a pointer into the taken segments, so in
//!   that case the stack is put back for a later exit to free.
//!
//! The reader-counted recheck is sound because a segment is only pushed here
//! after neither the head nor the tail root points to it: a thread that enters
//! after the stack was taken can no longer reach any segment on it.

use crate::{segment::Segment, Reclamation};
use std::{
    ptr,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};
use tracing::trace;

pub(crate) struct Retired<T> {
    reclamation: Reclamation,
    stack: AtomicPtr<Segment<T>>,
    active: AtomicUsize,
    parked: AtomicUsize,
}

impl<T> Retired<T> {
    pub(crate) const fn new(reclamation: Reclamation) -> Self {
        Self {
            reclamation,
            stack: AtomicPtr::new(ptr::null_mut()),
            active: AtomicUsize::new(0),
            parked: AtomicUsize::new(0),
        }
    }

    /// Returns the number of segments parked on the stack.
    pub(crate) fn parked(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }

    /// Registers an operation for the lifetime of the returned guard.
    #[inline]
    pub(crate) fn enter(&self) -> Guard<'_, T> {
        if self.reclamation == Reclamation::ReaderCounted {
            self.active.fetch_add(1, Ordering::SeqCst);
        }
        Guard { retired: self }
    }

    /// Parks a segment that neither root points to anymore.
    ///
    /// # Safety
    ///
    /// `segment` must come from `Box::into_raw`, must be unreachable from the
    /// queue's roots, and must be retired exactly once.
    pub(crate) unsafe fn retire(&self, segment: *mut Segment<T>) {
        self.parked.fetch_add(1, Ordering::Relaxed);
        // SAFETY: the caller passes a live segment it exclusively retires.
        unsafe { self.push_list(segment, segment) };
        trace!(parked = self.parked(), "retired segment");
    }

    /// Prepends the chain `first..=last` (linked through `retire_link`).
    ///
    /// # Safety
    ///
    /// Every segment in the chain must be live and owned by the caller.
    unsafe fn push_list(&self, first: *mut Segment<T>, last: *mut Segment<T>) {
        let mut current = self.stack.load(Ordering::Acquire);
        loop {
            // SAFETY: `last` is owned by the caller until the exchange succeeds.
            unsafe { &*last }
                .retire_link
                .store(current, Ordering::Relaxed);
            match self.stack.compare_exchange_weak(
                current,
                first,
                Ordering::SeqCst,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn exit(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let list = self.stack.swap(ptr::null_mut(), Ordering::SeqCst);
        if list.is_null() {
            return;
        }

        if self.active.load(Ordering::SeqCst) != 0 {
            // Someone entered before the swap and may still hold one of these.
            let mut last = list;
            loop {
                // SAFETY: the taken chain is owned by this thread.
                let next = unsafe { &*last }.retire_link.load(Ordering::Relaxed);
                if next.is_null() {
                    break;
                }
                last = next;
            }
            // SAFETY: the taken chain is owned by this thread.
            unsafe { self.push_list(list, last) };
            return;
        }

        // SAFETY: no thread was active across the swap, so nothing references the chain.
        let freed = unsafe { free_list(list) };
        self.parked.fetch_sub(freed, Ordering::Relaxed);
        trace!(freed, "reclaimed retired segments");
    }
}

impl<T> Drop for Retired<T> {
    fn drop(&mut self) {
        let list = std::mem::replace(self.stack.get_mut(), ptr::null_mut());
        // SAFETY: exclusive access, no operation can be in flight.
        unsafe { free_list(list) };
    }
}

/// Frees every segment on a `retire_link` chain, returning how many were freed.
///
/// # Safety
///
/// The chain must be exclusively owned and built from `Box::into_raw` pointers.
unsafe fn free_list<T>(mut list: *mut Segment<T>) -> usize {
    let mut freed = 0;
    while !list.is_null() {
        // SAFETY: guaranteed by the caller.
        let segment = unsafe { Box::from_raw(list) };
        list = segment.retire_link.load(Ordering::Relaxed);
        drop(segment);
        freed += 1;
    }
    freed
}

/// Marks an operation in flight on the queue.
pub(crate) struct Guard<'a, T> {
    retired: &'a Retired<T>,
}

impl<T> Drop for Guard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        if self.retired.reclamation == Reclamation::ReaderCounted {
            self.retired.exit();
        }
    }
}
