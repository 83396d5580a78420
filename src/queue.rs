//! C3: Michael-Scott unbounded MPMC FIFO.
//!
//! A singly-linked list with a sentinel node that is always present.
//! `head` always points at the current sentinel; the first live element
//! (if any) is `head->next`. `tail` points at the last node or one step
//! behind it — concurrent enqueuers cooperatively advance it before or
//! after linking their own node, so no single thread is ever required to
//! win a race against a lagging `tail` to make progress.
//!
//! Nodes are drawn from the slab allocator (C1) rather than a fixed pool,
//! so this queue is unbounded in practice (bounded only by the slab's
//! ability to grow from OS pages). `head`/`tail`/each node's `next` field
//! are [`TaggedPtr`] cells: a generation tag is packed into the pointer's
//! unused high bits so a CAS can't be fooled by an address that was freed
//! and reused between two reads (see `crate::tagged`).
//!
//! Ordering: every head/tail/next snapshot is acquire; every CAS is
//! acquire-release. A node's payload is written before the CAS that first
//! makes the node reachable, and that CAS's release pairs with the acquire
//! load that later observes it.
//!
//! Reclamation note: like the source this is grounded on
//! (`examples/original_source/lffifo.hpp`), retiring a dequeued node back
//! to the slab the moment its payload has been read is safe only because
//! the generation tag defeats simple ABA — a thread still dereferencing a
//! stale `next` pointer from before the retirement would need a hazard- or
//! epoch-based scheme to be fully safe under arbitrary scheduling delay.
//! The source accepts this simplification and so does this port; SPEC_FULL
//! does not call for hazard pointers.

use std::mem::{ManuallyDrop, MaybeUninit};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::backoff::Backoff;
use crate::error::{ConstructionError, QueueError};
use crate::metrics::Metrics;
use crate::slab::Slab;
use crate::tagged::{TaggedPtr, TaggedPtrCell};

struct Node<T> {
    next: TaggedPtrCell<Node<T>>,
    payload: MaybeUninit<T>,
}

/// An unbounded multi-producer/multi-consumer FIFO queue.
pub struct Queue<T> {
    head: CachePadded<TaggedPtrCell<Node<T>>>,
    tail: CachePadded<TaggedPtrCell<Node<T>>>,
    size: AtomicU64,
    slab: Slab,
    pushes: AtomicU64,
    pops: AtomicU64,
    empty_misses: AtomicU64,
    retries: AtomicU64,
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Queue<T> {
    /// Builds an empty queue, allocating its sentinel node from a fresh
    /// slab (C1).
    ///
    /// # Errors
    ///
    /// Returns `Err(ConstructionError)` if the OS allocator can't satisfy
    /// the slab's very first page request for the sentinel node. A queue is
    /// never partially built: on error, nothing outlives this call.
    pub fn new() -> Result<Self, ConstructionError> {
        let slab = Slab::new();
        let sentinel = Self::alloc_node(&slab).map_err(|_| ConstructionError {
            context: "queue sentinel node",
        })?;
        unsafe {
            sentinel.as_ptr().write(Node {
                next: TaggedPtrCell::new(TaggedPtr::NULL),
                payload: MaybeUninit::uninit(),
            });
        }
        let initial = TaggedPtr::NULL.with_ptr(sentinel.as_ptr());

        Ok(Self {
            head: CachePadded::new(TaggedPtrCell::new(initial)),
            tail: CachePadded::new(TaggedPtrCell::new(initial)),
            size: AtomicU64::new(0),
            slab,
            pushes: AtomicU64::new(0),
            pops: AtomicU64::new(0),
            empty_misses: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        })
    }

    /// Approximate current element count; advisory only (see §5).
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> Metrics {
        Metrics {
            pushes: self.pushes.load(Ordering::Relaxed),
            pops: self.pops.load(Ordering::Relaxed),
            full_rejections: 0,
            empty_misses: self.empty_misses.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }

    fn alloc_node(slab: &Slab) -> Result<NonNull<Node<T>>, QueueError> {
        let block = slab
            .alloc(std::mem::size_of::<Node<T>>())
            .map_err(|_| QueueError::PoolExhausted)?;
        Ok(block.cast())
    }

    fn free_node(&self, ptr: *mut Node<T>) {
        let _ = self
            .slab
            .free(unsafe { NonNull::new_unchecked(ptr.cast()) }, std::mem::size_of::<Node<T>>());
    }

    /// Enqueues `value`. Fails only if the slab could not grow (OS
    /// allocation failure) — in practice the queue is unbounded.
    pub fn push(&self, value: T) -> Result<(), QueueError> {
        let node = Self::alloc_node(&self.slab)?;
        unsafe {
            node.as_ptr().write(Node {
                next: TaggedPtrCell::new(TaggedPtr::NULL),
                payload: MaybeUninit::new(value),
            });
        }

        let mut backoff = Backoff::new();
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*tail.ptr()).next.load(Ordering::Acquire) };

            if next.is_null() {
                let linked = next.with_ptr(node.as_ptr());
                let result = unsafe {
                    (*tail.ptr())
                        .next
                        .compare_exchange_weak(next, linked, Ordering::AcqRel, Ordering::Acquire)
                };
                if result.is_ok() {
                    // Cooperative final advance; a race winner may already
                    // have moved tail forward, in which case this CAS fails
                    // harmlessly (SPEC_FULL §9's noted benign outer CAS).
                    let advanced = tail.with_ptr(node.as_ptr());
                    let _ = self
                        .tail
                        .compare_exchange_weak(tail, advanced, Ordering::AcqRel, Ordering::Acquire);
                    break;
                }
            } else {
                // tail is lagging one node behind the real end; help it along.
                let advanced = tail.with_ptr(next.ptr());
                let _ = self
                    .tail
                    .compare_exchange_weak(tail, advanced, Ordering::AcqRel, Ordering::Acquire);
            }
            self.retries.fetch_add(1, Ordering::Relaxed);
            backoff.spin();
        }

        self.size.fetch_add(1, Ordering::Relaxed);
        self.pushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Dequeues the oldest value, or `None` if the queue is empty.
    pub fn pop(&self) -> Option<T> {
        let mut backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            let next = unsafe { (*head.ptr()).next.load(Ordering::Acquire) };

            if head != self.head.load(Ordering::Acquire) {
                backoff.spin();
                continue;
            }

            if head.ptr() == tail.ptr() {
                if next.is_null() {
                    self.empty_misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                // tail is lagging behind a node that's already linked; help it along.
                let advanced = tail.with_ptr(next.ptr());
                let _ = self
                    .tail
                    .compare_exchange_weak(tail, advanced, Ordering::AcqRel, Ordering::Acquire);
            } else {
                // Read the payload before attempting the CAS that retires
                // `head`. If this thread loses the race, the bytes read
                // here are a throwaway duplicate — the authoritative copy
                // still lives in `next` (the node about to become the new
                // sentinel) until whichever thread wins reads it for real,
                // so the loser must forget its copy rather than drop it.
                let payload = unsafe { std::ptr::read(&(*next.ptr()).payload) };
                let advanced = head.with_ptr(next.ptr());
                match self
                    .head
                    .compare_exchange_weak(head, advanced, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        self.size.fetch_sub(1, Ordering::Relaxed);
                        self.pops.fetch_add(1, Ordering::Relaxed);
                        self.free_node(head.ptr());
                        return Some(unsafe { ManuallyDrop::new(payload).assume_init_read() });
                    }
                    Err(_) => {
                        std::mem::forget(payload);
                    }
                }
            }
            self.retries.fetch_add(1, Ordering::Relaxed);
            backoff.spin();
        }
    }
}

impl<T> Default for Queue<T> {
    /// Builds an empty queue, panicking if the initial sentinel allocation
    /// fails. `Default::default` has no fallible return; use [`Queue::new`]
    /// directly to handle that case.
    fn default() -> Self {
        Self::new().expect("queue sentinel allocation failed")
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        // Single-threaded at this point. The sentinel (head) never holds a
        // live payload; every node after it does, until the list ends.
        let mut current = self.head.load(Ordering::Relaxed).ptr();
        loop {
            let next = unsafe { (*current).next.load(Ordering::Relaxed) };
            if next.is_null() {
                break;
            }
            unsafe {
                (*next.ptr()).payload.assume_init_drop();
            }
            current = next.ptr();
        }
        // `self.slab`'s own `Drop` frees every backing OS page, which
        // reclaims the node storage itself.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_pop_is_fifo() {
        let queue = Queue::new().unwrap();
        for i in 0..100 {
            queue.push(i).unwrap();
        }
        for i in 0..100 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn empty_pop_returns_none() {
        let queue = Queue::<u64>::new().unwrap();
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn drop_runs_for_unconsumed_items() {
        use std::sync::atomic::AtomicUsize;
        static COUNT: AtomicUsize = AtomicUsize::new(0);
        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                COUNT.fetch_add(1, Ordering::Relaxed);
            }
        }

        let queue = Queue::new().unwrap();
        queue.push(Counted).unwrap();
        queue.push(Counted).unwrap();
        let popped = queue.pop().unwrap();
        drop(popped);
        assert_eq!(COUNT.load(Ordering::Relaxed), 1);

        drop(queue);
        assert_eq!(COUNT.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn concurrent_producers_and_consumers_conserve_xor_checksum() {
        let queue = Arc::new(Queue::<u64>::new().unwrap());
        let producers = 4u64;
        let per_producer = 20_000u64;

        let mut expected_xor = 0u64;
        for pid in 0..producers {
            for i in 0..per_producer {
                expected_xor ^= pid * 1_000_000 + i;
            }
        }

        let handles: Vec<_> = (0..producers)
            .map(|pid| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..per_producer {
                        queue.push(pid * 1_000_000 + i).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let total = producers * per_producer;
        let popped_xor = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let popped_count = Arc::new(AtomicU64::new(0));
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let popped_xor = Arc::clone(&popped_xor);
                let popped_count = Arc::clone(&popped_count);
                thread::spawn(move || {
                    // Re-check the shared total at the top of the loop, not
                    // just on this thread's own increment — otherwise only
                    // whichever consumer's `fetch_add` happens to land on
                    // `total` ever returns, and the other three spin on
                    // `None` forever once the queue is drained.
                    while popped_count.load(Ordering::Relaxed) < total {
                        match queue.pop() {
                            Some(v) => {
                                popped_xor.fetch_xor(v, Ordering::Relaxed);
                                popped_count.fetch_add(1, Ordering::Relaxed);
                            }
                            None => thread::yield_now(),
                        }
                    }
                })
            })
            .collect();
        for h in consumers {
            h.join().unwrap();
        }

        assert_eq!(popped_count.load(Ordering::Relaxed), total);
        assert_eq!(popped_xor.load(Ordering::Relaxed), expected_xor);
        assert!(queue.is_empty());
    }

    #[test]
    fn fifo_ordering_holds_under_single_producer_multi_consumer() {
        let queue = Arc::new(Queue::<u64>::new().unwrap());
        for i in 0..1000 {
            queue.push(i).unwrap();
        }

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let seen = Arc::clone(&seen);
                thread::spawn(move || {
                    while let Some(v) = queue.pop() {
                        seen.lock().unwrap().push(v);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..1000).collect::<Vec<_>>());
    }
}
