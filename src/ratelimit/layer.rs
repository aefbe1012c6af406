//! Tower layer enforcing a set of quotas on every request.
//!
//! Quotas run as an ordered pipeline, coarsest window first. The first
//! quota that denies ends the request, so finer quotas never spend a unit
//! on a request a broader limit already refused.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower::{Layer, Service};
use tracing::{debug, trace, warn};

use super::keys::{KeyError, KeyFunc};
use super::limiter::FailurePolicy;
use super::quota::Quota;
use super::store::{BucketStatus, Store, TakeResult};
use crate::error::Result;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATELIMIT_QUOTA: HeaderName = HeaderName::from_static("x-ratelimit-quota");

/// One quota paired with the store that counts it.
pub(crate) struct QuotaCheck {
    quota: Quota,
    store: Arc<dyn Store>,
}

impl QuotaCheck {
    pub(crate) fn new(quota: Quota, store: Arc<dyn Store>) -> Self {
        Self { quota, store }
    }

    pub(crate) fn quota(&self) -> &Quota {
        &self.quota
    }
}

/// Limiter state attached to responses.
#[derive(Debug, Clone, Copy)]
struct LimitSnapshot {
    limit: u64,
    remaining: u64,
    reset_at: DateTime<Utc>,
}

impl From<TakeResult> for LimitSnapshot {
    fn from(result: TakeResult) -> Self {
        Self {
            limit: result.limit,
            remaining: result.remaining,
            reset_at: result.reset_at,
        }
    }
}

impl LimitSnapshot {
    fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        if let Ok(reset) = HeaderValue::from_str(&http_date(self.reset_at)) {
            headers.insert(X_RATELIMIT_RESET, reset);
        }
    }
}

fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Whole seconds until `reset_at`, never below one.
fn retry_after_secs(reset_at: DateTime<Utc>) -> u64 {
    let millis = (reset_at - Utc::now()).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}

/// JSON body for rejected requests
#[derive(Serialize)]
struct RejectionBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    quota: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

fn exceeded_response(quota: &Quota, result: TakeResult) -> Response {
    let retry_after = retry_after_secs(result.reset_at);
    let body = RejectionBody {
        error: "rate_limit_exceeded",
        message: format!(
            "Rate limit '{}' exceeded. Please try again in {} seconds",
            quota.name(),
            retry_after
        ),
        quota: Some(quota.name().to_string()),
        retry_after: Some(retry_after),
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    LimitSnapshot::from(result).apply(headers);
    headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(retry_after));
    if let Ok(name) = HeaderValue::from_str(quota.name()) {
        headers.insert(X_RATELIMIT_QUOTA, name);
    }
    response
}

fn unavailable_response(quota: &Quota) -> Response {
    let body = RejectionBody {
        error: "rate_limit_unavailable",
        message: "Rate limit state is unavailable. Please try again shortly".to_string(),
        quota: Some(quota.name().to_string()),
        retry_after: Some(1),
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(1u64));
    if let Ok(name) = HeaderValue::from_str(quota.name()) {
        headers.insert(X_RATELIMIT_QUOTA, name);
    }
    response
}

fn invalid_key_response(err: KeyError) -> Response {
    let body = RejectionBody {
        error: "invalid_rate_limit_key",
        message: err.to_string(),
        quota: None,
        retry_after: None,
    };
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

struct Pipeline {
    checks: Vec<QuotaCheck>,
    key_func: Arc<dyn KeyFunc>,
    failure_policy: FailurePolicy,
}

impl Pipeline {
    /// Run every quota for `key`, coarsest first.
    ///
    /// Returns the state of the innermost allowing quota, or the response
    /// to send instead of calling the protected handler.
    async fn evaluate(&self, key: &str) -> std::result::Result<Option<LimitSnapshot>, Response> {
        let mut innermost = None;

        for check in &self.checks {
            let quota = &check.quota;
            let store_key = quota.namespaced_key(key);

            match check.store.take(&store_key).await {
                Ok(result) if result.allowed => {
                    trace!(quota = quota.name(), key, remaining = result.remaining, "Quota allowed request");
                    innermost = Some(LimitSnapshot::from(result));
                }
                Ok(result) => {
                    debug!(quota = quota.name(), key, limit = result.limit, "Rate limit exceeded");
                    return Err(exceeded_response(quota, result));
                }
                Err(err) => match self.failure_policy {
                    FailurePolicy::Closed => {
                        warn!(
                            quota = quota.name(),
                            backend = check.store.backend(),
                            error = %err,
                            "Store failed, rejecting request"
                        );
                        return Err(unavailable_response(quota));
                    }
                    FailurePolicy::Open => {
                        warn!(
                            quota = quota.name(),
                            backend = check.store.backend(),
                            error = %err,
                            "Store failed, skipping quota"
                        );
                    }
                },
            }
        }

        Ok(innermost)
    }
}

/// Tower layer enforcing every quota of one [`QuotaLimiter`](super::QuotaLimiter) middleware.
///
/// Cheap to clone; all clones share the same stores.
#[derive(Clone)]
pub struct QuotaLayer {
    pipeline: Arc<Pipeline>,
}

impl QuotaLayer {
    /// `checks` must already be ordered coarsest first.
    pub(crate) fn new(
        checks: Vec<QuotaCheck>,
        key_func: Arc<dyn KeyFunc>,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            pipeline: Arc::new(Pipeline {
                checks,
                key_func,
                failure_policy,
            }),
        }
    }

    /// Quota names in evaluation order.
    pub fn quota_names(&self) -> Vec<&str> {
        self.pipeline.checks.iter().map(|c| c.quota.name()).collect()
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.pipeline.failure_policy
    }

    /// Inspect the bucket `quota` holds for a caller key without consuming it.
    ///
    /// Returns `None` if no quota has that name.
    pub async fn peek(&self, quota: &str, key: &str) -> Option<Result<BucketStatus>> {
        let check = self
            .pipeline
            .checks
            .iter()
            .find(|c| c.quota.name() == quota)?;
        Some(check.store.peek(&check.quota.namespaced_key(key)).await)
    }
}

impl<S> Layer<S> for QuotaLayer {
    type Service = QuotaService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        QuotaService {
            inner,
            pipeline: self.pipeline.clone(),
        }
    }
}

/// Tower service produced by [`QuotaLayer`].
#[derive(Clone)]
pub struct QuotaService<S> {
    inner: S,
    pipeline: Arc<Pipeline>,
}

impl<S> Service<Request> for QuotaService<S>
where
    S: Service<Request> + Clone + Send + 'static,
    S::Response: IntoResponse,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // Take the service that was driven to readiness, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let pipeline = self.pipeline.clone();

        // Derived before any store is touched; a bad key never costs quota
        let key = pipeline.key_func.key(&req);

        Box::pin(async move {
            let key = match key {
                Ok(key) => key,
                Err(err) => {
                    debug!(error = %err, "Rejected request without a usable rate limit key");
                    return Ok(invalid_key_response(err));
                }
            };

            match pipeline.evaluate(&key).await {
                Ok(snapshot) => {
                    let mut response = inner.call(req).await?.into_response();
                    if let Some(snapshot) = snapshot {
                        snapshot.apply(response.headers_mut());
                    }
                    Ok(response)
                }
                Err(rejection) => Ok(rejection),
            }
        })
    }
}
