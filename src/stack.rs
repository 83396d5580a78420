//! C2: bounded MPMC tagged-pointer Treiber stack.
//!
//! A preallocated array of `capacity` nodes is threaded onto one of two
//! lists at all times: the `freelist` (unused nodes) or the `worklist`
//! (nodes currently holding a live payload, in LIFO order). Both lists are
//! headed by a [`TaggedCell`] (see `crate::tagged`); `push` moves a node
//! from freelist to worklist, `pop` does the reverse. Nodes never move
//! between the two arrays — only between the two lists — so their
//! addresses (and therefore their pool indices) are stable for the whole
//! lifetime of the stack.
//!
//! Ordering: every head load is acquire; every CAS is acquire-release. A
//! node's `next` field is written before the CAS that publishes it, and
//! that CAS's release makes the write visible to whichever thread's
//! acquire load observes the new head — the node field itself needs no
//! stronger-than-relaxed ordering.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::backoff::Backoff;
use crate::config::Order;
use crate::error::StackError;
use crate::invariants::{debug_assert_bounded_count, debug_assert_version_advanced};
use crate::metrics::Metrics;
use crate::tagged::{Tagged, TaggedCell, NIL};

struct Node<T> {
    next: AtomicU32,
    payload: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded multi-producer/multi-consumer LIFO stack.
pub struct Stack<T> {
    nodes: Box<[Node<T>]>,
    freelist: CachePadded<TaggedCell>,
    worklist: CachePadded<TaggedCell>,
    size: AtomicUsize,
    capacity: usize,
    pushes: AtomicU64,
    pops: AtomicU64,
    full_rejections: AtomicU64,
    empty_misses: AtomicU64,
    retries: AtomicU64,
}

unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

impl<T> Stack<T> {
    /// Builds a stack with capacity `2^order.get()`, every node preloaded
    /// onto the freelist.
    pub fn new(order: Order) -> Self {
        let capacity = order.capacity();
        let mut nodes = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let next = if i + 1 < capacity { (i + 1) as u32 } else { NIL };
            nodes.push(Node {
                next: AtomicU32::new(next),
                payload: UnsafeCell::new(MaybeUninit::uninit()),
            });
        }

        let freelist_head = Tagged {
            index: 0,
            version: 0,
        };

        Self {
            nodes: nodes.into_boxed_slice(),
            freelist: CachePadded::new(TaggedCell::new(freelist_head)),
            worklist: CachePadded::new(TaggedCell::new(Tagged::NULL)),
            size: AtomicUsize::new(0),
            capacity,
            pushes: AtomicU64::new(0),
            pops: AtomicU64::new(0),
            full_rejections: AtomicU64::new(0),
            empty_misses: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Approximate current element count; advisory only (see §5).
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn metrics(&self) -> Metrics {
        Metrics {
            pushes: self.pushes.load(Ordering::Relaxed),
            pops: self.pops.load(Ordering::Relaxed),
            full_rejections: self.full_rejections.load(Ordering::Relaxed),
            empty_misses: self.empty_misses.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }

    /// Pops a node index off `head`, or `None` if the list is empty.
    fn pop_link(&self, head: &TaggedCell) -> Option<u32> {
        let mut backoff = Backoff::new();
        loop {
            let observed = head.load(Ordering::Acquire);
            if observed.is_null() {
                return None;
            }
            let next_index = self.nodes[observed.index as usize]
                .next
                .load(Ordering::Relaxed);
            let new = observed.with_index(next_index);
            match head.compare_exchange_weak(observed, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    debug_assert_version_advanced!(observed.version, new.version);
                    return Some(observed.index);
                }
                Err(_) => {
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    backoff.spin();
                }
            }
        }
    }

    /// Pushes node `index` onto `head`.
    fn push_link(&self, head: &TaggedCell, index: u32) {
        let mut backoff = Backoff::new();
        loop {
            let observed = head.load(Ordering::Acquire);
            self.nodes[index as usize]
                .next
                .store(observed.index, Ordering::Relaxed);
            let new = observed.with_index(index);
            match head.compare_exchange_weak(observed, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    debug_assert_version_advanced!(observed.version, new.version);
                    return;
                }
                Err(_) => {
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    backoff.spin();
                }
            }
        }
    }

    /// Pushes `value`. Returns `Err(StackError::Full(value))` if every node
    /// is already on the worklist.
    pub fn push(&self, value: T) -> Result<(), StackError<T>> {
        let Some(index) = self.pop_link(&self.freelist) else {
            self.full_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(StackError::Full(value));
        };

        unsafe {
            (*self.nodes[index as usize].payload.get()).write(value);
        }
        self.push_link(&self.worklist, index);

        let new_size = self.size.fetch_add(1, Ordering::Relaxed) + 1;
        debug_assert_bounded_count!(new_size, self.capacity);
        self.pushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Pops the most recently pushed value, or `None` if empty.
    pub fn pop(&self) -> Option<T> {
        let Some(index) = self.pop_link(&self.worklist) else {
            self.empty_misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let value = unsafe { (*self.nodes[index as usize].payload.get()).assume_init_read() };
        self.push_link(&self.freelist, index);

        self.size.fetch_sub(1, Ordering::Relaxed);
        self.pops.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        // Single-threaded at this point: walk the worklist and drop every
        // live payload. Freelist nodes hold no payload.
        let mut index = self.worklist.load(Ordering::Relaxed).index;
        while index != NIL {
            let node = &self.nodes[index as usize];
            unsafe {
                (*node.payload.get()).assume_init_drop();
            }
            index = node.next.load(Ordering::Relaxed);
        }
    }
}
