//! Mapping requests to rate limit keys.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderName;
use thiserror::Error;

/// The request could not be mapped to a key. Answered with 400.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct KeyError(String);

impl KeyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Derives the key a request is limited under.
///
/// Implemented for any `Fn(&Request) -> Result<String, KeyError>`, so plain
/// closures work.
pub trait KeyFunc: Send + Sync + 'static {
    fn key(&self, request: &Request) -> Result<String, KeyError>;
}

impl<F> KeyFunc for F
where
    F: Fn(&Request) -> Result<String, KeyError> + Send + Sync + 'static,
{
    fn key(&self, request: &Request) -> Result<String, KeyError> {
        self(request)
    }
}

/// Key requests by the value of `name`. Requests without it are rejected.
pub fn header(name: HeaderName) -> impl KeyFunc {
    move |request: &Request| -> Result<String, KeyError> {
        let value = request
            .headers()
            .get(&name)
            .ok_or_else(|| KeyError::new(format!("missing {} header", name)))?;

        let value = value
            .to_str()
            .map_err(|_| KeyError::new(format!("{} header is not valid ASCII", name)))?
            .trim();

        if value.is_empty() {
            return Err(KeyError::new(format!("{} header is empty", name)));
        }
        Ok(value.to_string())
    }
}

/// Key requests by client IP address.
///
/// Only trust `X-Forwarded-For` / `X-Real-IP` behind a proxy that overwrites
/// them; otherwise clients can pick their own key. Without proxy trust the
/// connection address is used, which requires serving with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn client_ip(trust_proxy: bool) -> impl KeyFunc {
    move |request: &Request| -> Result<String, KeyError> {
        let forwarded = if trust_proxy {
            request
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                // leftmost entry is the original client
                .and_then(|s| s.split(',').next())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .or_else(|| {
                    request
                        .headers()
                        .get("x-real-ip")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                })
        } else {
            None
        };

        forwarded
            .or_else(|| {
                request
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .ok_or_else(|| KeyError::new("unable to determine client address"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request() -> axum::http::request::Builder {
        axum::http::Request::builder().uri("/")
    }

    #[test]
    fn test_header_key() {
        let key_func = header(HeaderName::from_static("x-api-key"));

        let req = request().header("x-api-key", " abc ").body(Body::empty()).unwrap();
        assert_eq!(key_func.key(&req).unwrap(), "abc");

        let req = request().body(Body::empty()).unwrap();
        assert!(key_func.key(&req).is_err());

        let req = request().header("x-api-key", "").body(Body::empty()).unwrap();
        assert!(key_func.key(&req).is_err());
    }

    #[test]
    fn test_client_ip_uses_connect_info() {
        let key_func = client_ip(false);

        let mut req = request()
            .header("x-forwarded-for", "1.1.1.1")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 4000))));

        // Proxy headers are ignored unless trusted
        assert_eq!(key_func.key(&req).unwrap(), "10.0.0.7");
    }

    #[test]
    fn test_client_ip_trusts_proxy_headers() {
        let key_func = client_ip(true);

        let req = request()
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(key_func.key(&req).unwrap(), "203.0.113.9");

        let req = request()
            .header("x-real-ip", "198.51.100.4")
            .body(Body::empty())
            .unwrap();
        assert_eq!(key_func.key(&req).unwrap(), "198.51.100.4");
    }

    #[test]
    fn test_client_ip_without_address_fails() {
        let req = request().body(Body::empty()).unwrap();
        assert!(client_ip(false).key(&req).is_err());
    }

    #[test]
    fn test_closure_key_func() {
        let key_func = |request: &Request| -> Result<String, KeyError> {
            Ok(request.uri().path().to_string())
        };
        let req = request().body(Body::empty()).unwrap();
        assert_eq!(key_func.key(&req).unwrap(), "/");
    }
}
