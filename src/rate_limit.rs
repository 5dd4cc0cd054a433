//! Per-server token-bucket rate limiting for relay sessions.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// Buckets idle longer than this are evicted by the sweeper.
pub const DEFAULT_IDLE_EVICTION: Duration = Duration::from_secs(600);

/// How often the background sweep runs.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket admission control keyed by server identity.
///
/// Buckets are created lazily on first use, seeded at `burst`, and refilled
/// proportionally to elapsed time. A single coarse lock guards the map; the
/// critical section is a handful of float operations.
pub struct RateLimiter {
    buckets: Mutex<HashMap<Uuid, Bucket>>,
    /// Tokens per second.
    rate: f64,
    /// Maximum bucket size.
    burst: f64,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate,
            burst,
        }
    }

    /// Check whether one message is admitted for the given server.
    pub fn allow(&self, server_id: Uuid) -> bool {
        let now = Instant::now();
        let mut buckets = match self.buckets.lock() {
            Ok(buckets) => buckets,
            Err(poisoned) => poisoned.into_inner(),
        };

        let bucket = buckets.entry(server_id).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens < 1.0 {
            return false;
        }
        bucket.tokens -= 1.0;
        true
    }

    /// Drop a server's bucket after its connection closes.
    pub fn remove(&self, server_id: Uuid) {
        let mut buckets = match self.buckets.lock() {
            Ok(buckets) => buckets,
            Err(poisoned) => poisoned.into_inner(),
        };
        buckets.remove(&server_id);
    }

    /// Evict buckets that have been idle for at least `idle_for`.
    fn sweep(&self, idle_for: Duration) {
        let now = Instant::now();
        let mut buckets = match self.buckets.lock() {
            Ok(buckets) => buckets,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = buckets.len();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < idle_for);
        let evicted = before - buckets.len();
        if evicted > 0 {
            debug!(evicted, "rate limiter evicted idle buckets");
        }
    }

    /// Spawn the periodic sweep that bounds bucket-map memory.
    pub fn spawn_sweeper(
        self: std::sync::Arc<Self>,
        interval: Duration,
        idle_for: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiter.sweep(idle_for);
            }
        })
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }

    #[cfg(test)]
    fn backdate(&self, server_id: Uuid, by: Duration) {
        let mut buckets = self.buckets.lock().unwrap();
        if let Some(bucket) = buckets.get_mut(&server_id) {
            bucket.last_refill -= by;
        }
    }
}
