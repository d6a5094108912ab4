//! Exponential backoff with jitter for the pending-updates retry queue (§4.G).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;

const BASE_SECS: i64 = 60;
const MAX_SECS: i64 = 3600;

/// `next_retry_at = now + base * 2^retry_count + jitter`, capped at one hour.
///
/// `retry_count` is the count *before* this attempt (0 on the first retry).
/// Jitter is up to 20% of the uncapped backoff, so concurrent retries of the
/// same operation kind don't all wake up on the same tick.
pub fn next_retry_at(now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
    let uncapped = BASE_SECS.saturating_mul(1i64.checked_shl(retry_count).unwrap_or(i64::MAX).max(1));
    let capped = uncapped.min(MAX_SECS).max(0);
    let jitter_max = (capped / 5).max(1);
    let jitter = rand::thread_rng().gen_range(0..=jitter_max);
    now + ChronoDuration::seconds(capped + jitter)
}
