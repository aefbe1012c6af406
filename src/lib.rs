//! httplimit - Multi-tier HTTP Quota Limiting
//!
//! This crate enforces several independent quotas (per second, per hour,
//! per day, ...) on one request stream. Each quota counts in its own store,
//! either in-process or in Redis so a fleet of instances shares one limit,
//! and all quotas are composed into a single tower layer that checks the
//! coarsest window first.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{HttplimitError, Result};
pub use ratelimit::{FailurePolicy, Quota, QuotaLayer, QuotaLimiter};
