use thiserror::Error;

/// Error returned by the tagged-pointer Treiber stack (C2).
#[derive(Debug, Error)]
pub enum StackError<T> {
    /// No free node was available; the stack is at capacity.
    ///
    /// The rejected value is handed back so a full push never drops data.
    #[error("stack is full")]
    Full(T),
}

/// Error returned by the Michael-Scott FIFO (C3).
#[derive(Debug, Error)]
pub enum QueueError {
    /// Node allocation failed because the backing slab (C1) could not grow
    /// — the OS allocator returned null for a fresh page. The queue is
    /// otherwise unbounded; this only fires on genuine system memory
    /// exhaustion, not on reaching some fixed element count.
    #[error("queue node pool is exhausted")]
    PoolExhausted,
}

/// Error returned by the MPMC ring buffer (C4) and the SPSC baseline.
#[derive(Debug, Error)]
pub enum RingError<T> {
    /// `tail - head` already equals capacity; no slot could be claimed.
    #[error("ring is full")]
    Full(T),
}

/// Error returned by slab allocator (C1) operations.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum SlabError {
    /// The requested size exceeds the largest managed size class (512 KiB)
    /// and must be served directly by the system allocator instead.
    #[error("requested size {requested} exceeds the largest slab class")]
    RequestTooLarge { requested: usize },
    /// Acquiring a fresh OS page for a size class failed.
    #[error("failed to grow size class: system allocator returned null")]
    GrowthFailed,
}

/// Error surfaced once, at construction, when backing storage cannot be
/// allocated. A container is never partially alive: construction either
/// fully succeeds or returns this and allocates nothing further.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
#[error("failed to allocate backing storage ({context})")]
pub struct ConstructionError {
    pub context: &'static str,
}
