/// Per-container operation counters, sampled by the caller.
///
/// Every container exposes a `metrics()` snapshot. Counters are plain
/// relaxed atomics internally; a snapshot is therefore approximate under
/// concurrent access, same as `len()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics {
    pub pushes: u64,
    pub pops: u64,
    pub full_rejections: u64,
    pub empty_misses: u64,
    pub retries: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }
}
