//! Per-client admission control.
//!
//! Each API key owns a token bucket. Buckets are created lazily on the
//! first admission check, backed by the client registry, and topped up
//! both on use and by a periodic sweep. The map is read-locked on the hot
//! path; the write lock is taken only for first-seen keys, double-checked
//! so concurrent misses create exactly one bucket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::internal::registry::Registry;

/// Buckets idle longer than this are dropped during the refill sweep, so
/// an unbounded key space cannot leak memory.
const IDLE_EVICTION: Duration = Duration::from_secs(3600);

/// Classic token bucket with integer tokens and floor-truncated refill.
pub struct TokenBucket {
    capacity: u64,
    tokens: u64,
    rate: u64,
    last_refill: Instant,
    last_access: Instant,
}

impl TokenBucket {
    /// A new bucket starts full.
    pub fn new(capacity: u64, rate: u64) -> Self {
        let now = Instant::now();
        Self {
            capacity,
            tokens: capacity,
            rate,
            last_refill: now,
            last_access: now,
        }
    }

    /// Tops up and takes one token; false when the budget is exhausted.
    pub fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        self.last_access = now;
        self.refill(now);

        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Refill half of `try_consume`, used by the periodic sweep.
    pub fn refill_now(&mut self) {
        self.refill(Instant::now());
    }

    // `last_refill` only advances when whole tokens were added; the
    // remainder keeps accumulating, so sub-second rates do not starve.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill);
        let added = (elapsed.as_secs_f64() * self.rate as f64) as u64;
        if added > 0 {
            self.tokens = self.capacity.min(self.tokens + added);
            self.last_refill = now;
        }
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    fn idle_since(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access)
    }
}

/// Admission gate over a per-key cache of buckets.
pub struct Limiter {
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
    registry: Arc<Registry>,
    idle_eviction: Duration,
}

impl Limiter {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            registry,
            idle_eviction: IDLE_EVICTION,
        }
    }

    /// Checks whether `key` may issue one more request, consuming a token
    /// when it may. Unknown keys are materialized through the registry's
    /// upsert-read; a registry failure denies the request (fail-closed).
    pub async fn available(&self, key: &str) -> bool {
        if let Some(bucket) = self.buckets.read().await.get(key).cloned() {
            return bucket.lock().try_consume();
        }

        let mut buckets = self.buckets.write().await;
        if let Some(bucket) = buckets.get(key).cloned() {
            return bucket.lock().try_consume();
        }

        let client = match self.registry.has(key).await {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!(client = key, error = %err, "client lookup failed, denying request");
                return false;
            }
        };

        let bucket = Arc::new(Mutex::new(TokenBucket::new(client.capacity, client.rate)));
        let admitted = bucket.lock().try_consume();
        buckets.insert(key.to_string(), bucket);

        admitted
    }

    /// Refill loop: tops up every known bucket each `interval` so that an
    /// idle bucket never faces a huge single-step refill on next use, and
    /// evicts buckets nobody has touched for a while. Exits when
    /// `shutdown` fires.
    pub async fn start_refill(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = shutdown.cancelled() => {
                    tracing::debug!("stopping limiter refill loop");
                    return;
                }
            }
        }
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let mut idle = Vec::new();

        {
            let buckets = self.buckets.read().await;
            for (key, bucket) in buckets.iter() {
                let mut bucket = bucket.lock();
                bucket.refill_now();
                if bucket.idle_since(now) > self.idle_eviction {
                    idle.push(key.clone());
                }
            }
        }

        if !idle.is_empty() {
            let mut buckets = self.buckets.write().await;
            for key in &idle {
                buckets.remove(key);
            }
            tracing::debug!(count = idle.len(), "evicted idle buckets");
        }
    }

    /// Number of keys with live buckets.
    pub async fn tracked_keys(&self) -> usize {
        self.buckets.read().await.len()
    }
}
