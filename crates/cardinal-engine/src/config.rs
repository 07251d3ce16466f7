//! Engine configuration.
//!
//! [`EngineConfig`] can be built in code, parsed from JSON, or read from
//! `CARDINAL_*` environment variables layered over the defaults. Every
//! constructor except [`Default`] validates before returning.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Invalid or unreadable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("environment variable {var}={value:?} is not valid: {reason}")]
    Env {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid config field '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Logging setup consumed by [`init_tracing`](crate::logging::init_tracing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            json: false,
        }
    }
}

/// Configuration for an [`Engine`](crate::tick::Engine) and its game loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identifies this world in durable storage and seeds its RNG.
    pub namespace: String,
    /// Completed ticks whose receipts stay queryable.
    pub receipt_history_size: u64,
    /// Wall-clock interval between ticks for a timer-driven game loop.
    #[serde(with = "millis", rename = "tick_interval_ms")]
    pub tick_interval: Duration,
    /// Ticks slower than this are logged at `warn`.
    #[serde(with = "millis", rename = "tick_warning_threshold_ms")]
    pub tick_warning_threshold: Duration,
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: "world-1".to_owned(),
            receipt_history_size: 10,
            tick_interval: Duration::from_secs(1),
            tick_warning_threshold: Duration::from_millis(100),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `CARDINAL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(namespace) = lookup("CARDINAL_NAMESPACE") {
            config.namespace = namespace;
        }
        if let Some(value) = lookup("CARDINAL_RECEIPT_HISTORY_SIZE") {
            config.receipt_history_size = parse_var("CARDINAL_RECEIPT_HISTORY_SIZE", value)?;
        }
        if let Some(value) = lookup("CARDINAL_TICK_INTERVAL_MS") {
            config.tick_interval =
                Duration::from_millis(parse_var("CARDINAL_TICK_INTERVAL_MS", value)?);
        }
        if let Some(level) = lookup("CARDINAL_LOG_LEVEL") {
            config.log.level = level;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::Invalid {
                field: "namespace",
                reason: "must not be empty".into(),
            });
        }
        if let Some(bad) = self
            .namespace
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-'))
        {
            return Err(ConfigError::Invalid {
                field: "namespace",
                reason: format!("character {bad:?} is not allowed (use A-Z, a-z, 0-9 and '-')"),
            });
        }
        if self.receipt_history_size == 0 {
            return Err(ConfigError::Invalid {
                field: "receipt_history_size",
                reason: "must be greater than zero".into(),
            });
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "tick_interval",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

fn parse_var<T>(var: &'static str, value: String) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let parsed = value.trim().parse::<T>();
    parsed.map_err(|err| ConfigError::Env {
        var,
        reason: err.to_string(),
        value,
    })
}

/// Durations as whole milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
