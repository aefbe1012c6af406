//! Quota limiting: stores, composition and the HTTP layer.

pub mod keys;
mod layer;
mod limiter;
mod memory;
mod quota;
mod redis_store;
mod store;

pub use keys::{KeyError, KeyFunc};
pub use layer::{
    QuotaLayer, QuotaService, X_RATELIMIT_LIMIT, X_RATELIMIT_QUOTA, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET,
};
pub use limiter::{CleanupError, FailurePolicy, LimiterOptions, QuotaLimiter, QuotaLimiterBuilder};
pub use memory::{MemoryStore, DEFAULT_SWEEP_INTERVAL};
pub use quota::{Quota, MAX_INTERVAL};
pub use redis_store::{RedisStore, RedisStoreConfig};
pub use store::{BucketStatus, Store, TakeResult};
