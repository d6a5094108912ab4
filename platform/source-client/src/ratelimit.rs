//! Token-bucket limiter for the source platform's stated ~300 requests / 10 s
//! budget, grounded on the `KeyedLimiters` shape in `identity-auth`. The
//! source client only ever talks to one remote API, so a single unkeyed
//! limiter is enough — no per-key sharding needed here.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};

pub struct SourceRateLimiter {
    inner: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl SourceRateLimiter {
    /// `requests_per_window` requests per `window`, with a burst equal to the
    /// full window allowance.
    pub fn new(requests_per_window: u32, window: Duration) -> Self {
        let per_second = (requests_per_window as f64 / window.as_secs_f64()).ceil().max(1.0) as u32;
        let quota = Quota::per_second(NonZeroU32::new(per_second.max(1)).unwrap())
            .allow_burst(NonZeroU32::new(requests_per_window.max(1)).unwrap());
        Self {
            inner: RateLimiter::direct(quota),
        }
    }

    /// Waits until a permit is available, honoring the limiter's own clock.
    pub async fn acquire(&self) {
        loop {
            match self.inner.check() {
                Ok(()) => return,
                Err(not_until) => {
                    let wait = not_until.wait_time_from(DefaultClock::default().now());
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

impl Default for SourceRateLimiter {
    /// ~300 requests / 10 s, the source platform's stated budget (§4.B).
    fn default() -> Self {
        Self::new(300, Duration::from_secs(10))
    }
}
