//! In-process store implementation.
//!
//! Buckets live in a sharded `DashMap`. The shard lock held by an entry is
//! the critical section for "check expiry, then decrement", so two callers
//! racing on one key serialize while different keys proceed independently.
//! Expired buckets are reset lazily on access; a background sweeper only
//! bounds memory and never affects a decision.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::quota::MAX_INTERVAL;
use super::store::{BucketStatus, Store, TakeResult};
use crate::error::{HttplimitError, Result};

/// Default period between two background sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Per-key counter state.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    remaining: u64,
    reset_at: Instant,
}

impl Bucket {
    // `interval` never exceeds MAX_INTERVAL, so the deadline is representable.
    fn fresh(tokens: u64, now: Instant, interval: Duration) -> Self {
        Self {
            remaining: tokens,
            reset_at: now + interval,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.reset_at
    }
}

/// The bucket table shared between the store and its sweeper.
struct Buckets {
    map: DashMap<String, Bucket>,
    tokens: u64,
    interval: Duration,
}

impl Buckets {
    /// Reset the bucket if its window ended, then try to consume one unit.
    fn consume(&self, bucket: &mut Bucket, now: Instant) -> (bool, u64, Instant) {
        if bucket.is_expired(now) {
            *bucket = Bucket::fresh(self.tokens, now, self.interval);
        }

        if bucket.remaining == 0 {
            return (false, 0, bucket.reset_at);
        }

        bucket.remaining -= 1;
        (true, bucket.remaining, bucket.reset_at)
    }

    fn take(&self, key: &str, now: Instant) -> (bool, u64, Instant) {
        if let Some(mut bucket) = self.map.get_mut(key) {
            return self.consume(&mut bucket, now);
        }

        let mut bucket = self
            .map
            .entry(key.to_owned())
            .or_insert_with(|| Bucket::fresh(self.tokens, now, self.interval));
        self.consume(&mut bucket, now)
    }

    fn peek(&self, key: &str, now: Instant) -> (u64, Instant) {
        match self.map.get(key) {
            Some(bucket) if !bucket.is_expired(now) => (bucket.remaining, bucket.reset_at),
            _ => (self.tokens, now + self.interval),
        }
    }

    /// Drop buckets whose window ended more than one full interval ago.
    ///
    /// A bucket touched after its reset gets a new `reset_at`, so anything
    /// this old has not been used since it expired.
    fn sweep(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.map.retain(|_, bucket| {
            let keep = bucket
                .reset_at
                .checked_add(self.interval)
                .map_or(true, |stale_at| now < stale_at);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }
}

/// Single-process store with lazy expiry and periodic garbage collection.
pub struct MemoryStore {
    buckets: Arc<Buckets>,
    closed: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryStore {
    /// Create a store sweeping every [`DEFAULT_SWEEP_INTERVAL`].
    pub fn new(tokens: u64, interval: Duration) -> Result<Self> {
        Self::with_sweep_interval(tokens, interval, DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a store with an explicit sweep period.
    ///
    /// Must be called from within a Tokio runtime, which hosts the sweeper.
    pub fn with_sweep_interval(
        tokens: u64,
        interval: Duration,
        sweep_interval: Duration,
    ) -> Result<Self> {
        if tokens == 0 || interval.is_zero() {
            return Err(HttplimitError::Config(
                "memory store needs non-zero tokens and interval".to_string(),
            ));
        }
        if interval > MAX_INTERVAL {
            return Err(HttplimitError::Config(format!(
                "memory store interval {:?} exceeds {:?}",
                interval, MAX_INTERVAL
            )));
        }
        if sweep_interval.is_zero() {
            return Err(HttplimitError::Config(
                "sweep interval must be greater than zero".to_string(),
            ));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            HttplimitError::Config("memory store requires a Tokio runtime".to_string())
        })?;

        let buckets = Arc::new(Buckets {
            map: DashMap::new(),
            tokens,
            interval,
        });
        let sweeper = runtime.spawn(sweep_loop(Arc::downgrade(&buckets), sweep_interval));

        info!(
            tokens,
            interval = ?interval,
            sweep_interval = ?sweep_interval,
            "Created memory store"
        );

        Ok(Self {
            buckets,
            closed: AtomicBool::new(false),
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Run one garbage collection pass now. Returns the number of buckets removed.
    pub fn sweep(&self) -> usize {
        self.buckets.sweep(Instant::now())
    }

    /// Number of buckets currently held.
    pub fn len(&self) -> usize {
        self.buckets.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.map.is_empty()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HttplimitError::StoreClosed);
        }
        Ok(())
    }

    fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

async fn sweep_loop(buckets: Weak<Buckets>, every: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(buckets) = buckets.upgrade() else {
            break;
        };
        let removed = buckets.sweep(Instant::now());
        if removed > 0 {
            debug!(removed, live = buckets.map.len(), "Swept expired buckets");
        }
    }
}

/// Map a monotonic deadline onto the wall clock.
fn wall_clock(deadline: Instant, now: Instant) -> DateTime<Utc> {
    let until = chrono::Duration::from_std(deadline.saturating_duration_since(now))
        .unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(until)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl Store for MemoryStore {
    async fn take(&self, key: &str) -> Result<TakeResult> {
        self.ensure_open()?;

        let now = Instant::now();
        let (allowed, remaining, reset_at) = self.buckets.take(key, now);

        // A close racing this take may have cleared the map before our insert.
        if self.closed.load(Ordering::Acquire) {
            self.buckets.map.remove(key);
            return Err(HttplimitError::StoreClosed);
        }

        trace!(key, allowed, remaining, "Memory store take");

        Ok(TakeResult {
            allowed,
            remaining,
            limit: self.buckets.tokens,
            reset_at: wall_clock(reset_at, now),
        })
    }

    async fn peek(&self, key: &str) -> Result<BucketStatus> {
        self.ensure_open()?;

        let now = Instant::now();
        let (remaining, reset_at) = self.buckets.peek(key, now);

        Ok(BucketStatus {
            remaining,
            limit: self.buckets.tokens,
            reset_at: wall_clock(reset_at, now),
        })
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.stop_sweeper();
        self.buckets.map.clear();
        debug!("Closed memory store");
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(tokens: u64, interval: Duration) -> MemoryStore {
        MemoryStore::new(tokens, interval).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_exhausts_capacity() {
        let store = store(5, Duration::from_secs(1));

        for i in 0..5 {
            let result = store.take("client").await.unwrap();
            assert!(result.allowed, "Request {} should be allowed", i + 1);
            assert_eq!(result.remaining, 4 - i);
            assert_eq!(result.limit, 5);
        }

        let result = store.take("client").await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_take_does_not_extend_window() {
        let store = store(1, Duration::from_secs(1));

        let first = store.take("client").await.unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        let denied = store.take("client").await.unwrap();

        assert!(!denied.allowed);
        assert!(denied.reset_at <= first.reset_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_interval() {
        let store = store(3, Duration::from_secs(1));

        for _ in 0..3 {
            store.take("client").await.unwrap();
        }
        assert!(!store.take("client").await.unwrap().allowed);

        tokio::time::advance(Duration::from_millis(1001)).await;

        let result = store.take("client").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peek_does_not_consume() {
        let store = store(5, Duration::from_secs(60));

        let status = store.peek("client").await.unwrap();
        assert_eq!(status.remaining, 5);
        assert_eq!(status.limit, 5);
        assert!(store.is_empty());

        store.take("client").await.unwrap();
        assert_eq!(store.peek("client").await.unwrap().remaining, 4);
        assert_eq!(store.peek("client").await.unwrap().remaining, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let store = store(1, Duration::from_secs(60));

        assert!(store.take("quotaA:1.2.3.4").await.unwrap().allowed);
        assert!(store.take("quotaB:1.2.3.4").await.unwrap().allowed);
        assert!(!store.take("quotaA:1.2.3.4").await.unwrap().allowed);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_stale_buckets() {
        let store = store(5, Duration::from_secs(1));

        store.take("stale").await.unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;
        store.take("recent").await.unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;

        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.peek("recent").await.unwrap().remaining, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper_runs() {
        let store =
            MemoryStore::with_sweep_interval(5, Duration::from_secs(1), Duration::from_secs(10))
                .unwrap();

        store.take("client").await.unwrap();
        assert_eq!(store.len(), 1);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(store.len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_takes_never_over_admit() {
        let store = Arc::new(store(50, Duration::from_secs(60)));

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.take("shared").await.unwrap().allowed })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        let allowed = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(allowed, 50);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let store = store(5, Duration::from_secs(1));
        store.take("client").await.unwrap();

        store.close().await.unwrap();
        store.close().await.unwrap();

        assert!(store.is_empty());
        assert!(matches!(
            store.take("client").await,
            Err(HttplimitError::StoreClosed)
        ));
    }

    #[test]
    fn test_requires_runtime() {
        let result = MemoryStore::new(5, Duration::from_secs(1));
        assert!(matches!(result, Err(HttplimitError::Config(_))));
    }

    #[tokio::test]
    async fn test_rejects_zero_capacity() {
        assert!(MemoryStore::new(0, Duration::from_secs(1)).is_err());
        assert!(MemoryStore::new(1, Duration::ZERO).is_err());
    }

    #[tokio::test]
    async fn test_rejects_interval_beyond_max() {
        let result = MemoryStore::new(5, MAX_INTERVAL + Duration::from_secs(1));
        assert!(matches!(result, Err(HttplimitError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_longest_window_reports_reset() {
        let store = store(5, MAX_INTERVAL);

        let result = store.take("client").await.unwrap();
        assert!(result.allowed);
        assert!(result.reset_at > Utc::now() + chrono::Duration::days(365 * 99));
        assert_eq!(store.sweep(), 0);
    }

    #[test]
    fn test_wall_clock_saturates() {
        let now = Instant::now();
        let far = now + Duration::from_secs(u64::from(u32::MAX) * 1_000_000);
        assert_eq!(wall_clock(far, now), DateTime::<Utc>::MAX_UTC);
        assert!(wall_clock(now, now) <= Utc::now() + chrono::Duration::seconds(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_take_racing_close_leaves_no_buckets() {
        let store = Arc::new(store(1000, Duration::from_secs(60)));

        let handles: Vec<_> = (0..200)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.take(&format!("client-{}", i)).await })
            })
            .collect();
        store.close().await.unwrap();
        futures::future::join_all(handles).await;

        assert!(store.is_empty());
    }
}
