//! Quota limiter: one store per quota, composed into a single middleware.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use super::keys::KeyFunc;
use super::layer::{QuotaCheck, QuotaLayer};
use super::memory::{MemoryStore, DEFAULT_SWEEP_INTERVAL};
use super::quota::{self, Quota};
use super::redis_store::{RedisStore, RedisStoreConfig};
use super::store::Store;
use crate::error::{HttplimitError, Result};

/// What to do with a request when a store cannot answer.
///
/// Applies to every quota of a limiter alike.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Treat the request as rate limited
    #[default]
    Closed,
    /// Skip the failing quota and keep evaluating the rest
    Open,
}

/// Construction options for a [`QuotaLimiter`].
#[derive(Debug, Clone)]
pub struct LimiterOptions {
    /// Shared Redis backend; `None` selects the in-process store
    pub redis: Option<RedisStoreConfig>,
    /// Garbage collection period for in-process stores
    pub sweep_interval: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            redis: None,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            failure_policy: FailurePolicy::default(),
        }
    }
}

/// Builder for [`QuotaLimiter`].
#[must_use = "builder does nothing until you call build()"]
pub struct QuotaLimiterBuilder {
    options: LimiterOptions,
}

impl QuotaLimiterBuilder {
    pub fn new() -> Self {
        Self {
            options: LimiterOptions::default(),
        }
    }

    /// Share counters across processes through the Redis server at `url`.
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        match self.options.redis.as_mut() {
            Some(redis) => redis.url = url,
            None => self.options.redis = Some(RedisStoreConfig::new(url)),
        }
        self
    }

    pub fn redis(mut self, config: RedisStoreConfig) -> Self {
        self.options.redis = Some(config);
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.options.sweep_interval = interval;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.options.failure_policy = policy;
        self
    }

    pub fn build(self) -> QuotaLimiter {
        QuotaLimiter::with_options(self.options)
    }
}

impl Default for QuotaLimiterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Every store that failed to close during [`QuotaLimiter::cleanup`].
#[derive(Debug, Error)]
#[error("failed to close {} store(s): {}", .failures.len(), summarize(.failures))]
pub struct CleanupError {
    pub failures: Vec<(String, HttplimitError)>,
}

fn summarize(failures: &[(String, HttplimitError)]) -> String {
    failures
        .iter()
        .map(|(quota, err)| format!("quota '{}': {}", quota, err))
        .collect::<Vec<_>>()
        .join("; ")
}

struct OwnedStore {
    quota: String,
    store: Arc<dyn Store>,
}

/// Builds quota middleware and owns every store behind it.
///
/// Each quota gets its own store, so counters of different quotas never
/// share a namespace. Call [`cleanup`](Self::cleanup) on shutdown to
/// release them.
pub struct QuotaLimiter {
    options: LimiterOptions,
    stores: Mutex<Vec<OwnedStore>>,
}

impl fmt::Debug for QuotaLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaLimiter")
            .field("options", &self.options)
            .field("stores", &self.store_count())
            .finish()
    }
}

impl QuotaLimiter {
    /// Create a limiter with in-process stores and default options.
    pub fn new() -> Self {
        Self::with_options(LimiterOptions::default())
    }

    pub fn with_options(options: LimiterOptions) -> Self {
        Self {
            options,
            stores: Mutex::new(Vec::new()),
        }
    }

    pub fn builder() -> QuotaLimiterBuilder {
        QuotaLimiterBuilder::new()
    }

    pub fn options(&self) -> &LimiterOptions {
        &self.options
    }

    /// Number of stores currently owned.
    pub fn store_count(&self) -> usize {
        self.stores.lock().len()
    }

    /// Build one middleware enforcing all `quotas` for keys from `key_func`.
    ///
    /// Quotas are evaluated longest interval first; ties keep declaration
    /// order. Any invalid quota or unreachable backend fails the whole call,
    /// and the caller should refuse to start.
    pub async fn middleware<K: KeyFunc>(&self, quotas: Vec<Quota>, key_func: K) -> Result<QuotaLayer> {
        quota::validate_all(&quotas)?;

        let mut checks = Vec::with_capacity(quotas.len());
        for quota in quotas {
            let store = self.create_store(&quota).await?;
            checks.push(QuotaCheck::new(quota, store));
        }
        quota::sort_coarsest_first(&mut checks, |check| check.quota().interval());

        let layer = QuotaLayer::new(checks, Arc::new(key_func), self.options.failure_policy);
        info!(
            quotas = ?layer.quota_names(),
            failure_policy = ?self.options.failure_policy,
            "Built quota middleware"
        );
        Ok(layer)
    }

    async fn create_store(&self, quota: &Quota) -> Result<Arc<dyn Store>> {
        let created: Result<Arc<dyn Store>> = match &self.options.redis {
            Some(redis) => RedisStore::connect(quota.tokens(), quota.interval(), redis)
                .await
                .map(|store| Arc::new(store) as Arc<dyn Store>),
            None => MemoryStore::with_sweep_interval(
                quota.tokens(),
                quota.interval(),
                self.options.sweep_interval,
            )
            .map(|store| Arc::new(store) as Arc<dyn Store>),
        };

        let store = created.map_err(|e| {
            error!(quota = quota.name(), error = %e, "Failed to create store");
            e
        })?;

        info!(
            quota = quota.name(),
            tokens = quota.tokens(),
            interval = ?quota.interval(),
            backend = store.backend(),
            "Created quota store"
        );
        self.register(quota.name(), store.clone());
        Ok(store)
    }

    fn register(&self, quota: &str, store: Arc<dyn Store>) {
        self.stores.lock().push(OwnedStore {
            quota: quota.to_string(),
            store,
        });
    }

    /// Close every store this limiter created.
    ///
    /// All stores are closed even if some fail; failures are returned
    /// together. Stores are released on the first call, so later calls
    /// have nothing left to do.
    pub async fn cleanup(&self) -> std::result::Result<(), CleanupError> {
        let stores = std::mem::take(&mut *self.stores.lock());
        let total = stores.len();

        let results = futures::future::join_all(stores.into_iter().map(|owned| async move {
            let result = owned.store.close().await;
            (owned.quota, result)
        }))
        .await;

        let failures: Vec<(String, HttplimitError)> = results
            .into_iter()
            .filter_map(|(quota, result)| result.err().map(|err| (quota, err)))
            .collect();

        for (quota, err) in &failures {
            error!(quota = %quota, error = %err, "Failed to close quota store");
        }
        info!(closed = total - failures.len(), failed = failures.len(), "Quota limiter cleaned up");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupError { failures })
        }
    }
}

impl Default for QuotaLimiter {
    fn default() -> Self {
        Self::new()
    }
}
