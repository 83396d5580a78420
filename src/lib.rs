//! Lock-free concurrent queues and stacks.
//!
//! Four container variants tuned to different concurrency regimes, plus the
//! lock-free slab allocator the unbounded FIFO is built on:
//!
//! - [`Stack`] — a bounded MPMC LIFO: a tagged-pointer Treiber stack backed
//!   by a preallocated node array (freelist + worklist share one tagged-
//!   pointer primitive).
//! - [`Queue`] — an unbounded MPMC FIFO following the Michael-Scott design,
//!   with nodes drawn from the slab allocator.
//! - [`Ring`] — a bounded MPMC FIFO ring buffer: two fetch-add cursors and
//!   per-slot status CAS (`Empty -> Filling -> Full -> Reading -> Empty`).
//! - [`Spsc`] — a minimal single-producer/single-consumer ring buffer,
//!   included as a baseline.
//! - [`Slab`] — the lock-free fixed-size-block allocator backing [`Queue`],
//!   also usable directly as a `malloc`/`free`/`realloc`/`calloc` facade.
//!
//! All four containers are `push`/`pop` call-and-return primitives with no
//! blocking beyond bounded CAS-retry spins; there is no background thread,
//! callback, or scheduler anywhere in this crate.
//!
//! # Example
//!
//! ```
//! use lockfree_containers::{Order, Ring};
//!
//! let ring = Ring::<u64>::new(Order::new(4));
//! ring.push(1).unwrap();
//! ring.push(2).unwrap();
//! assert_eq!(ring.pop(), Some(1));
//! assert_eq!(ring.pop(), Some(2));
//! assert_eq!(ring.pop(), None);
//! ```

mod backoff;
mod config;
mod error;
mod invariants;
mod metrics;
mod queue;
mod ring;
mod slab;
mod spsc;
mod stack;
mod tagged;

pub use backoff::Backoff;
pub use config::Order;
pub use error::{ConstructionError, QueueError, RingError, SlabError, StackError};
pub use metrics::Metrics;
pub use queue::Queue;
pub use ring::Ring;
pub use slab::{Slab, MAX_CLASS_SIZE};
pub use spsc::Spsc;
pub use stack::Stack;
