//! C4.5: single-producer/single-consumer ring buffer (baseline).
//!
//! Deliberately minimal, per SPEC_FULL.md §4.5: `head` and `tail` are plain
//! (non-atomic) cursors, each written by exactly one side — the producer
//! owns `tail`, the consumer owns `head` — so there is no CAS anywhere in
//! this file. The only atomic is `size`, used purely as the cross-thread
//! full/empty signal; a release store after a cursor advance publishes the
//! slot write (or read) that preceded it, and the opposite side's acquire
//! load on `size` is what makes that write visible before it touches the
//! slot itself. Grounded directly on
//! `examples/original_source/C++11/magicq.hpp`, whose `nobj` atomic plays
//! the same role.
//!
//! `pop()` returns `Option<T>`, never an in-band sentinel cast from `false`
//! — SPEC_FULL.md §9 flags the source's `pop()`-by-value form as a bug, not
//! a behavior to preserve.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::Order;
use crate::error::RingError;
use crate::invariants::{debug_assert_monotonic, debug_assert_no_wrap};

/// A bounded single-producer/single-consumer ring buffer.
pub struct Spsc<T> {
    head: UnsafeCell<usize>,
    tail: UnsafeCell<usize>,
    size: AtomicUsize,
    mask: usize,
    capacity: usize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

unsafe impl<T: Send> Send for Spsc<T> {}
unsafe impl<T: Send> Sync for Spsc<T> {}

impl<T> Spsc<T> {
    pub fn new(order: Order) -> Self {
        let capacity = order.capacity();
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            head: UnsafeCell::new(0),
            tail: UnsafeCell::new(0),
            size: AtomicUsize::new(0),
            mask: capacity - 1,
            capacity,
            slots,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// Producer-side push. Must only be called from the single producer
    /// thread.
    pub fn push(&self, value: T) -> Result<(), RingError<T>> {
        if self.size.load(Ordering::Acquire) == self.capacity {
            return Err(RingError::Full(value));
        }

        let tail = unsafe { *self.tail.get() };
        let index = tail & self.mask;
        let new_tail = tail.wrapping_add(1);
        debug_assert_no_wrap!("spsc tail", tail as u64, new_tail as u64);
        debug_assert_monotonic!("spsc tail", tail, new_tail);
        unsafe {
            (*self.slots[index].get()).write(value);
            *self.tail.get() = new_tail;
        }
        self.size.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Consumer-side pop. Must only be called from the single consumer
    /// thread.
    pub fn pop(&self) -> Option<T> {
        if self.size.load(Ordering::Acquire) == 0 {
            return None;
        }

        let head = unsafe { *self.head.get() };
        let index = head & self.mask;
        let new_head = head.wrapping_add(1);
        debug_assert_no_wrap!("spsc head", head as u64, new_head as u64);
        debug_assert_monotonic!("spsc head", head, new_head);
        let value = unsafe {
            let value = (*self.slots[index].get()).assume_init_read();
            *self.head.get() = new_head;
            value
        };
        self.size.fetch_sub(1, Ordering::Release);
        Some(value)
    }
}

impl<T> Drop for Spsc<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let mut cursor = head;
        while cursor != tail {
            let index = cursor & self.mask;
            unsafe {
                self.slots[index].get_mut().assume_init_drop();
            }
            cursor = cursor.wrapping_add(1);
        }
    }
}
