//! Debug assertion macros for harvester invariants.
//!
//! Only active in debug builds (`debug_assert!`), so release builds pay
//! nothing for them.

// =============================================================================
// Buffer swap
// =============================================================================

/// Assert that the live buffer is empty right after a swap.
///
/// **Invariant**: a swapped-out batch shares nothing with the buffer that
/// keeps receiving writes, so every entity lands in exactly one batch.
///
/// Used in: `Harvester::swap_out_spans()`, `Harvester::swap_out_metrics()`
macro_rules! debug_assert_buffer_drained {
    ($kind:literal, $remaining:expr) => {
        debug_assert!(
            $remaining == 0,
            "{} buffer still holds {} entries after swap",
            $kind,
            $remaining
        )
    };
}

// =============================================================================
// Retry policy
// =============================================================================

/// Assert that a request is never sent more than the allowed number of times.
///
/// **Invariant**: one initial attempt plus at most one retry per cycle.
///
/// Used in: `Inner::harvest_request()`
macro_rules! debug_assert_bounded_attempts {
    ($attempt:expr, $max:expr) => {
        debug_assert!(
            $attempt < $max,
            "attempt {} exceeds max attempts {}",
            $attempt,
            $max
        )
    };
}

/// Assert that the computed wait never undercuts the configured backoff.
///
/// **Invariant**: `Retry-After` may lengthen the wait, never shorten it.
///
/// Used in: `Inner::harvest_request()` before sleeping
macro_rules! debug_assert_backoff_floor {
    ($backoff:expr, $base:expr) => {
        debug_assert!(
            $backoff >= $base,
            "backoff {:?} is below the configured floor {:?}",
            $backoff,
            $base
        )
    };
}

// =============================================================================
// Re-exports for crate-internal use
// =============================================================================

pub(crate) use debug_assert_backoff_floor;
pub(crate) use debug_assert_bounded_attempts;
pub(crate) use debug_assert_buffer_drained;
