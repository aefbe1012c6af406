//! Store trait for abstracting local and shared counter backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Outcome of consuming one unit of quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TakeResult {
    /// Whether the unit was consumed
    pub allowed: bool,
    /// Units left in the current window
    pub remaining: u64,
    /// Capacity of the window
    pub limit: u64,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
}

/// Read-only view of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketStatus {
    pub remaining: u64,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
}

/// Atomic per-key counter backing exactly one quota.
///
/// Implemented by the in-process `MemoryStore` and the Redis-backed
/// `RedisStore`, so the limiter composes either without knowing which.
#[async_trait]
pub trait Store: Send + Sync {
    /// Consume one unit for `key`.
    ///
    /// A missing or expired bucket is (re)created at full capacity first.
    /// Once the window is exhausted the call returns `allowed = false` and
    /// `remaining = 0` without touching the bucket. Backend failures are
    /// returned as errors, never turned into a decision.
    async fn take(&self, key: &str) -> Result<TakeResult>;

    /// Inspect the bucket for `key` without consuming anything.
    async fn peek(&self, key: &str) -> Result<BucketStatus>;

    /// Release timers, tasks and connections. Calling it again is a no-op.
    async fn close(&self) -> Result<()>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}
