//! Client-side request pacing.
//!
//! A leaky bucket shared by every worker. Each request adds one unit; the
//! bucket drains at `rate` units per second. A request that would overflow
//! reserves its slot anyway and sleeps until the water level has leaked down
//! to it, so concurrent callers queue up in arrival order.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, sleep};

#[derive(Debug)]
struct BucketState {
    level: f64,
    last_leak: Instant,
}

/// Leaky-bucket pacer.
#[derive(Debug)]
pub struct RequestPacer {
    capacity: f64,
    rate: f64,
    state: Mutex<BucketState>,
}

impl RequestPacer {
    /// Pace to `requests_per_second` with a burst of `burst` requests.
    ///
    /// Returns `None` for a non-positive or non-finite rate.
    #[must_use]
    pub fn new(requests_per_second: f64, burst: u32) -> Option<Self> {
        if !requests_per_second.is_finite() || requests_per_second <= 0.0 {
            return None;
        }
        Some(Self {
            capacity: f64::from(burst.max(1)),
            rate: requests_per_second,
            state: Mutex::new(BucketState {
                level: 0.0,
                last_leak: Instant::now(),
            }),
        })
    }

    /// Reserve a slot and return how long the caller must wait for it.
    pub fn reserve(&self) -> Duration {
        let now = Instant::now();
        let mut state = self.state.lock();

        let elapsed = now.saturating_duration_since(state.last_leak);
        state.level = elapsed.as_secs_f64().mul_add(-self.rate, state.level).max(0.0);
        state.last_leak = now;

        state.level += 1.0;
        let overflow = state.level - self.capacity;
        drop(state);

        if overflow <= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(overflow / self.rate).unwrap_or(Duration::MAX)
        }
    }

    /// Wait for a slot. The lock is released before sleeping.
    pub async fn acquire(&self) {
        let wait = self.reserve();
        if !wait.is_zero() {
            tracing::trace!(wait_ms = wait.as_millis(), "pacing request");
            sleep(wait).await;
        }
    }
}
