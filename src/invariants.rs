//! Debug assertion macros for the tagged-pointer and ring-cursor invariants
//! these containers rely on.
//!
//! Only active in debug builds (`#[cfg(debug_assertions)]`), so there is
//! zero overhead in release builds.
//!
//! Used by `Ring<T>`, `Spsc<T>`, `Stack<T>` and `Queue<T>`.

// =============================================================================
// Bounded count
// =============================================================================

/// Assert that count does not exceed capacity.
///
/// **Invariant**: `0 ≤ (tail - head) ≤ capacity`
macro_rules! debug_assert_bounded_count {
    ($count:expr, $capacity:expr) => {
        debug_assert!(
            $count <= $capacity,
            "count {} exceeds capacity {}",
            $count,
            $capacity
        )
    };
}

/// Assert that head does not advance past tail.
///
/// **Invariant**: `head ≤ tail` (after advance)
macro_rules! debug_assert_head_not_past_tail {
    ($new_head:expr, $tail:expr) => {
        debug_assert!(
            $new_head <= $tail,
            "advancing head {} beyond tail {}",
            $new_head,
            $tail
        )
    };
}

// =============================================================================
// Monotonic progress
// =============================================================================

/// Assert that a cursor only increases (monotonic progress).
///
/// **Invariant**: `new_value ≥ old_value` (using wrapping comparison)
macro_rules! debug_assert_monotonic {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            $new >= $old,
            "{} decreased from {} to {}",
            $name,
            $old,
            $new
        )
    };
}

// =============================================================================
// No wrap-around
// =============================================================================

/// Assert that we haven't wrapped around u64 cursor/version space.
macro_rules! debug_assert_no_wrap {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            $new > $old || $old.wrapping_sub($new) > (1u64 << 32),
            "{} potential wrap detected: went from {} to {} (delta: {})",
            $name,
            $old,
            $new,
            $new.wrapping_sub($old)
        )
    };
}

// =============================================================================
// Initialized-read
// =============================================================================

/// Assert that we're reading from a slot within the currently live range.
///
/// **Invariant**: `buffer[i] is live ⟺ head ≤ sequence(i) < tail`
macro_rules! debug_assert_initialized_read {
    ($pos:expr, $head:expr, $tail:expr) => {
        debug_assert!(
            $pos >= $head && $pos < $tail,
            "reading slot at seq {} outside live range [{}, {})",
            $pos,
            $head,
            $tail
        )
    };
}

// =============================================================================
// Tagged-pointer version advance
// =============================================================================

/// Assert that a tagged pointer's version strictly advanced by one across a
/// successful CAS — the core of the ABA defense for C2/C3.
macro_rules! debug_assert_version_advanced {
    ($old_version:expr, $new_version:expr) => {
        debug_assert!(
            $new_version == $old_version.wrapping_add(1),
            "tagged pointer version did not advance by exactly one: {} -> {}",
            $old_version,
            $new_version
        )
    };
}

// =============================================================================
// Re-exports for crate-internal use
// =============================================================================

pub(crate) use debug_assert_bounded_count;
pub(crate) use debug_assert_head_not_past_tail;
pub(crate) use debug_assert_initialized_read;
pub(crate) use debug_assert_monotonic;
pub(crate) use debug_assert_no_wrap;
pub(crate) use debug_assert_version_advanced;
