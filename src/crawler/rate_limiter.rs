//! Process-wide request throttle
//!
//! Every outbound request (page fetches and robots.txt lookups alike) calls
//! [`RateLimiter::wait`] first. The lock is held across the sleep, so with N
//! workers contending the admitted requests are still spaced by at least the
//! configured interval.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Minimum-interval limiter shared by all workers of a run
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    /// When the previous request was admitted (`None` before the first)
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter; a zero interval disables throttling
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_request: Mutex::new(None),
        }
    }

    /// Creates a limiter from a (validated, non-negative) number of seconds
    pub fn from_secs_f64(seconds: f64) -> Self {
        Self::new(Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO))
    }

    /// A limiter that never waits
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Suspends until at least `interval` has passed since the previously
    /// admitted request, then records the current time as the new admission
    ///
    /// Callers are admitted in FIFO order of arrival at the lock. Returns the
    /// admission time.
    pub async fn wait(&self) -> Instant {
        if self.interval.is_zero() {
            return Instant::now();
        }

        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.interval;
            let now = Instant::now();
            if ready_at > now {
                tracing::debug!(
                    "Rate limiting: waiting {:.2}s",
                    (ready_at - now).as_secs_f64()
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }
        let admitted = Instant::now();
        *last = Some(admitted);
        admitted
    }
}
