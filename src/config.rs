//! Configuration management for httplimit.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{HttplimitError, Result};
use crate::ratelimit::{FailurePolicy, LimiterOptions, Quota, RedisStoreConfig};

/// Main configuration for the httplimit service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Quota limiting configuration
    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_addr")]
    pub addr: SocketAddr,

    /// Trust X-Forwarded-For / X-Real-IP when keying by client address
    #[serde(default)]
    pub trust_proxy: bool,

    /// Key requests by this header instead of the client address
    #[serde(default)]
    pub key_header: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            trust_proxy: false,
            key_header: None,
        }
    }
}

fn default_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Quota limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Redis connection URL. Counters stay in-process when unset.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How often in-process stores drop stale buckets
    #[serde(default = "default_sweep_interval", with = "duration_str")]
    pub sweep_interval: Duration,

    /// Upper bound for one Redis round trip
    #[serde(default = "default_command_timeout", with = "duration_str")]
    pub command_timeout: Duration,

    /// Upper bound for connecting to Redis at startup
    #[serde(default = "default_connect_timeout", with = "duration_str")]
    pub connect_timeout: Duration,

    /// Decision when a store fails mid-request
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Quotas enforced on every request
    #[serde(default = "default_quotas")]
    pub quotas: Vec<QuotaConfig>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            sweep_interval: default_sweep_interval(),
            command_timeout: default_command_timeout(),
            connect_timeout: default_connect_timeout(),
            failure_policy: FailurePolicy::default(),
            quotas: default_quotas(),
        }
    }
}

fn default_key_prefix() -> String {
    "httplimit:".to_string()
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_command_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_quotas() -> Vec<QuotaConfig> {
    vec![
        QuotaConfig {
            name: "burst".to_string(),
            tokens: 5,
            interval: Duration::from_secs(1),
        },
        QuotaConfig {
            name: "daily".to_string(),
            tokens: 1000,
            interval: Duration::from_secs(86400),
        },
    ]
}

/// One quota as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub name: String,
    pub tokens: u64,
    #[serde(with = "duration_str")]
    pub interval: Duration,
}

impl From<&QuotaConfig> for Quota {
    fn from(config: &QuotaConfig) -> Self {
        Quota::new(config.name.clone(), config.tokens, config.interval)
    }
}

impl LimiterConfig {
    /// Quotas in declaration order.
    pub fn quotas(&self) -> Vec<Quota> {
        self.quotas.iter().map(Quota::from).collect()
    }

    /// Options for building a `QuotaLimiter`.
    pub fn options(&self) -> LimiterOptions {
        let redis = self.redis_url.as_ref().map(|url| RedisStoreConfig {
            url: url.clone(),
            key_prefix: self.key_prefix.clone(),
            connect_timeout: self.connect_timeout,
            command_timeout: self.command_timeout,
        });

        LimiterOptions {
            redis,
            sweep_interval: self.sweep_interval,
            failure_policy: self.failure_policy,
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load an optional YAML file overlaid with `HTTPLIMIT__*` environment variables.
    ///
    /// `HTTPLIMIT__LIMITER__REDIS_URL=redis://cache:6379` sets `limiter.redis_url`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        let config: AppConfig = builder
            .add_source(
                config::Environment::with_prefix("HTTPLIMIT")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the limiter could not enforce.
    pub fn validate(&self) -> Result<()> {
        for quota in &self.limiter.quotas {
            Quota::from(quota).validate()?;
        }
        if self.limiter.sweep_interval.is_zero() {
            return Err(HttplimitError::Config(
                "limiter.sweep_interval must be greater than zero".to_string(),
            ));
        }
        if self.limiter.command_timeout.is_zero() || self.limiter.connect_timeout.is_zero() {
            return Err(HttplimitError::Config(
                "limiter timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse `"<integer><unit>"` with unit one of `ms`, `s`, `m`, `h`, `d`.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{}' is missing a unit", input))?;
    let (value, unit) = input.split_at(split);

    let value: u64 = value
        .parse()
        .map_err(|_| format!("duration '{}' must start with an integer", input))?;

    let secs_per_unit = match unit.trim() {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        other => return Err(format!("unknown duration unit '{}'", other)),
    };

    value
        .checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{}' is too large", input))
}

/// Render a duration in the largest unit that divides it evenly.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1000 != 0 {
        return format!("{}ms", millis);
    }

    let secs = duration.as_secs();
    for (unit, size) in [("d", 86400), ("h", 3600), ("m", 60)] {
        if secs != 0 && secs % size == 0 {
            return format!("{}{}", secs / size, unit);
        }
    }
    format!("{}s", secs)
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
