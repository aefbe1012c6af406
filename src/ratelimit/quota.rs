//! Quota definitions.

use std::collections::HashSet;
use std::time::Duration;

use crate::error::{HttplimitError, Result};

/// Separator between a quota's name and the caller-supplied key.
pub(crate) const NAMESPACE_SEPARATOR: char = ':';

/// Longest window a quota may use (100 years).
pub const MAX_INTERVAL: Duration = Duration::from_secs(100 * 365 * 86400);

/// A named rate limit: `tokens` requests allowed per `interval`.
///
/// Quotas are immutable once built. Every quota attached to a limiter gets
/// its own store and its own counter namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quota {
    name: String,
    tokens: u64,
    interval: Duration,
}

impl Quota {
    /// Create a new quota.
    pub fn new(name: impl Into<String>, tokens: u64, interval: Duration) -> Self {
        Self {
            name: name.into(),
            tokens,
            interval,
        }
    }

    pub fn per_second(name: impl Into<String>, tokens: u64) -> Self {
        Self::new(name, tokens, Duration::from_secs(1))
    }

    pub fn per_minute(name: impl Into<String>, tokens: u64) -> Self {
        Self::new(name, tokens, Duration::from_secs(60))
    }

    pub fn per_hour(name: impl Into<String>, tokens: u64) -> Self {
        Self::new(name, tokens, Duration::from_secs(3600))
    }

    pub fn per_day(name: impl Into<String>, tokens: u64) -> Self {
        Self::new(name, tokens, Duration::from_secs(86400))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capacity per window.
    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    /// Length of one window.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Build the store key for a caller-supplied key.
    pub fn namespaced_key(&self, key: &str) -> String {
        let mut namespaced = String::with_capacity(self.name.len() + 1 + key.len());
        namespaced.push_str(&self.name);
        namespaced.push(NAMESPACE_SEPARATOR);
        namespaced.push_str(key);
        namespaced
    }

    /// Check that this quota can be enforced.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| HttplimitError::InvalidQuota {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.name.contains(NAMESPACE_SEPARATOR) {
            return Err(invalid("name must not contain ':'"));
        }
        if self.tokens == 0 {
            return Err(invalid("tokens must be greater than zero"));
        }
        if self.interval.is_zero() {
            return Err(invalid("interval must be greater than zero"));
        }
        if self.interval > MAX_INTERVAL {
            return Err(invalid("interval must not exceed 100 years"));
        }
        Ok(())
    }
}

/// Validate a set of quotas meant for one limiter.
pub(crate) fn validate_all(quotas: &[Quota]) -> Result<()> {
    let mut seen = HashSet::with_capacity(quotas.len());
    for quota in quotas {
        quota.validate()?;
        if !seen.insert(quota.name()) {
            return Err(HttplimitError::DuplicateQuota(quota.name().to_string()));
        }
    }
    Ok(())
}

/// Sort quotas coarsest first.
///
/// The sort is stable, so quotas with equal intervals keep their declaration order.
pub(crate) fn sort_coarsest_first<T>(items: &mut [T], interval: impl Fn(&T) -> Duration) {
    items.sort_by(|a, b| interval(b).cmp(&interval(a)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_helpers() {
        assert_eq!(Quota::per_second("a", 1).interval(), Duration::from_secs(1));
        assert_eq!(Quota::per_minute("a", 1).interval(), Duration::from_secs(60));
        assert_eq!(Quota::per_hour("a", 1).interval(), Duration::from_secs(3600));
        assert_eq!(Quota::per_day("a", 1).interval(), Duration::from_secs(86400));
    }

    #[test]
    fn test_namespaced_key() {
        let quota = Quota::per_second("burst", 5);
        assert_eq!(quota.namespaced_key("10.0.0.1"), "burst:10.0.0.1");
        assert_ne!(
            Quota::per_second("quotaA", 5).namespaced_key("k"),
            Quota::per_second("quotaB", 5).namespaced_key("k")
        );
    }

    #[test]
    fn test_validate_rejects_bad_quotas() {
        assert!(Quota::per_second("", 5).validate().is_err());
        assert!(Quota::per_second("a:b", 5).validate().is_err());
        assert!(Quota::per_second("burst", 0).validate().is_err());
        assert!(Quota::new("burst", 5, Duration::ZERO).validate().is_err());
        assert!(Quota::per_second("burst", 5).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_huge_interval() {
        let yearly = Quota::new("yearly", 5, Duration::from_secs(219_000_000 * 86400));
        assert!(matches!(
            yearly.validate(),
            Err(HttplimitError::InvalidQuota { name, .. }) if name == "yearly"
        ));

        assert!(Quota::new("century", 5, MAX_INTERVAL).validate().is_ok());
    }

    #[test]
    fn test_validate_all_rejects_duplicates() {
        let quotas = vec![Quota::per_second("burst", 5), Quota::per_day("burst", 100)];
        assert!(matches!(
            validate_all(&quotas),
            Err(HttplimitError::DuplicateQuota(name)) if name == "burst"
        ));
    }

    #[test]
    fn test_sort_coarsest_first_is_stable() {
        let mut quotas = vec![
            Quota::per_second("burst", 5),
            Quota::per_day("daily", 1000),
            Quota::per_second("burst2", 10),
            Quota::per_hour("hourly", 100),
        ];
        sort_coarsest_first(&mut quotas, Quota::interval);

        let names: Vec<&str> = quotas.iter().map(Quota::name).collect();
        assert_eq!(names, vec!["daily", "hourly", "burst", "burst2"]);
    }
}
