use std::{collections::HashMap, time::Duration};

use tokio::{
    sync::Mutex,
    time::{sleep_until, Instant},
};
use tracing::trace;

/// Spaces out calls per endpoint key so that two `acquire`s for the same key
/// are at least `min_interval` apart. Keys do not throttle each other.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    /// `requests_per_second <= 0` disables spacing.
    pub fn new(requests_per_second: f64) -> Self {
        let min_interval = if requests_per_second.is_finite() && requests_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / requests_per_second)
        } else {
            Duration::ZERO
        };
        Self::with_interval(min_interval)
    }

    pub fn with_interval(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits for this key's next slot. The slot is reserved under the lock and
    /// the wait happens after releasing it, so callers queue up in order.
    pub async fn acquire(&self, key: &str) {
        let ready_at = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let ready_at = slots.get(key).map_or(now, |slot| (*slot).max(now));
            slots.insert(key.to_string(), ready_at + self.min_interval);
            ready_at
        };

        if ready_at > Instant::now() {
            trace!(key, wait_ms = (ready_at - Instant::now()).as_millis(), "rate limited");
            sleep_until(ready_at).await;
        }
    }

    /// Pushes the key's next slot out to at least `wait` from now, e.g. after
    /// the endpoint answered 429 with a reset window.
    pub async fn defer(&self, key: &str, wait: Duration) {
        let mut slots = self.next_slot.lock().await;
        let until = Instant::now() + wait;
        let slot = slots.entry(key.to_string()).or_insert(until);
        if *slot < until {
            *slot = until;
        }
    }
}
