//! Token-bucket rate limiter implementing the shared request budget named
//! in spec §5 ("the engines share a rate-limited request budget; no engine
//! may exceed it"). Built the same acquire/wait-and-log way this crate's
//! concurrency limiter gates HTTP concurrency, but budgets request *rate*
//! over time rather than concurrent count.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use tokio::sync::Mutex;

use crate::config::RateLimitConfig;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared across every engine instance in a run via `Arc`/`Clone`, so two
/// concurrent bulk jobs draw from the same budget.
#[derive(Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<Bucket>>,
    config: RateLimitConfig,
    waits: Arc<AtomicU64>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = config.requests_per_minute.max(1) as f64;
        RateLimiter {
            bucket: Arc::new(Mutex::new(Bucket { tokens: capacity, last_refill: Instant::now() })),
            config,
            waits: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Block until one request's worth of budget is available. A no-op
    /// when the limiter is disabled.
    pub async fn acquire(&self) {
        if !self.config.enabled {
            return;
        }
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - bucket.tokens;
                    let per_token = Duration::from_secs_f64(60.0 / self.config.requests_per_minute.max(1) as f64);
                    Some(per_token.mul_f64(deficit))
                }
            };
            match wait {
                None => return,
                Some(delay) => {
                    self.waits.fetch_add(1, Ordering::Relaxed);
                    debug!("rate limiter: waiting {delay:?} for request budget");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let capacity = self.config.requests_per_minute.max(1) as f64;
        let rate_per_sec = capacity / 60.0;
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * rate_per_sec).min(capacity);
            bucket.last_refill = Instant::now();
        }
    }

    pub fn waits(&self) -> u64 {
        self.waits.load(Ordering::Relaxed)
    }
}
