//! Per-source-IP token bucket rate limiter (component G).
//!
//! The refill math is fixed-point, scaled by [`PRECISION`], to avoid float
//! drift across long-lived buckets. `rate`/`burst` default to
//! `latchkey_types::{RPM, BURST}` but can be overridden per instance via
//! [`RateLimiter::with_rate`] (`security.rpm_override`/`burst_override`,
//! §10.K).

use dashmap::DashMap;
use latchkey_types::{BURST, RATELIMIT_MAX_IDLE_SECS, RATELIMIT_SWEEP_SECS, RPM};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const PRECISION: u64 = 1_000_000;

fn now_us() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

struct BucketInner {
    tokens: u64,
    last_refill: u64,
}

struct Bucket {
    inner: Mutex<BucketInner>,
    last_access: AtomicU64,
    max_tokens: u64,
    rate_per_us: f64,
}

impl Bucket {
    fn new(now: u64, rpm: u64, burst: u64) -> Self {
        let rate_per_sec = rpm as f64 / 60.0;
        let max_tokens = burst as u64 * PRECISION;
        Self {
            inner: Mutex::new(BucketInner {
                tokens: max_tokens,
                last_refill: now,
            }),
            last_access: AtomicU64::new(now),
            max_tokens,
            rate_per_us: rate_per_sec / 1_000_000.0,
        }
    }

    async fn try_acquire(&self) -> bool {
        let now = now_us();
        self.last_access.store(now, Ordering::Relaxed);

        let mut inner = self.inner.lock().await;
        let elapsed = now.saturating_sub(inner.last_refill);
        let refill = (elapsed as f64 * self.rate_per_us * PRECISION as f64) as u64;
        inner.tokens = (inner.tokens.saturating_add(refill)).min(self.max_tokens);
        inner.last_refill = now;

        if inner.tokens >= PRECISION {
            inner.tokens -= PRECISION;
            true
        } else {
            false
        }
    }
}

/// One token bucket per source IP, with a sweeper evicting idle buckets so
/// the map never grows unbounded.
pub struct RateLimiter {
    buckets: DashMap<IpAddr, Arc<Bucket>>,
    rpm: u64,
    burst: u64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_rate(RPM, BURST)
    }

    /// Like [`RateLimiter::new`] but with explicit rate/burst, as loaded
    /// from `security.rpm_override`/`security.burst_override` (§10.K).
    pub fn with_rate(rpm: u64, burst: u64) -> Self {
        Self {
            buckets: DashMap::new(),
            rpm,
            burst,
        }
    }

    /// Consumes one token for `ip`. Returns `true` if the request/frame may
    /// proceed, `false` if the bucket is exhausted.
    pub async fn check(&self, ip: IpAddr) -> bool {
        let now = now_us();
        let bucket = self
            .buckets
            .entry(ip)
            .or_insert_with(|| Arc::new(Bucket::new(now, self.rpm, self.burst)))
            .clone();
        bucket.try_acquire().await
    }

    /// Spawns the idle-eviction sweeper. Ticks every
    /// `RATELIMIT_SWEEP_SECS`; removes buckets idle longer than
    /// `RATELIMIT_MAX_IDLE_SECS`.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(RATELIMIT_SWEEP_SECS));
            loop {
                interval.tick().await;
                limiter.evict_stale();
            }
        })
    }

    fn evict_stale(&self) {
        let now = now_us();
        let max_idle_us = RATELIMIT_MAX_IDLE_SECS * PRECISION;
        self.buckets.retain(|_, bucket| {
            now.saturating_sub(bucket.last_access.load(Ordering::Relaxed)) <= max_idle_us
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
