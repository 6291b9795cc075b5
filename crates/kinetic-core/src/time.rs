//! Compact monotonic time utilities.
//!
//! Every deadline in the core is a `u64` millisecond offset from a
//! process-local monotonic epoch. Plain integers keep queued requests
//! small and let deadlines be compared and subtracted without
//! `Option<Instant>` juggling.

use std::sync::OnceLock;
use std::time::Instant;

/// Longest timeout a command may ask for. Larger values are clamped so
/// deadlines stay comparable.
pub const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// Returns current monotonic time in milliseconds since process start.
#[inline]
pub fn now_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// Returns the absolute deadline `timeout_ms` from now.
#[inline]
pub fn deadline_after(timeout_ms: u64) -> u64 {
    now_ms().saturating_add(timeout_ms)
}

/// Signed time left until `deadline_ms`, as seen at `now_ms`.
///
/// Negative once the deadline has passed, so overdue work can still be
/// ranked by how late it is. Saturates at the `i64` bounds.
#[inline]
pub fn remaining_ms(deadline_ms: u64, now_ms: u64) -> i64 {
    let diff = deadline_ms as i128 - now_ms as i128;
    diff.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Milliseconds elapsed since `since_ms`, saturating at zero.
#[inline]
pub fn elapsed_ms(since_ms: u64) -> u64 {
    now_ms().saturating_sub(since_ms)
}

/// Returns true once `deadline_ms` has been reached.
#[inline]
pub fn is_expired(deadline_ms: u64) -> bool {
    now_ms() >= deadline_ms
}
