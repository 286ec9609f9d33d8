//! Queue configuration.
//!
//! Every field has a default, so an empty TOML file or an empty environment
//! yields a working queue. Loaders fail fast on values that do not parse.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_MAX_SIZE: usize = 1000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_STORAGE_KEY: &str = "offline-queue:operations";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Upper bound on stored records, terminal ones included.
    pub max_size: usize,
    /// `max_retries` for operations that don't set their own.
    pub default_max_retries: u32,
    /// Pause after a retryable failure before the next operation.
    pub retry_interval_ms: u64,
    pub persist_to_storage: bool,
    pub storage_key: String,
    /// Operations older than this fail without a handler call. `None` never expires.
    pub operation_ttl_secs: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            default_max_retries: DEFAULT_MAX_RETRIES,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            persist_to_storage: true,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            operation_ttl_secs: None,
        }
    }
}

impl QueueConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn operation_ttl(&self) -> Option<Duration> {
        self.operation_ttl_secs.map(Duration::from_secs)
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_default_max_retries(mut self, n: u32) -> Self {
        self.default_max_retries = n;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_persistence(mut self, enabled: bool) -> Self {
        self.persist_to_storage = enabled;
        self
    }

    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    pub fn with_operation_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.operation_ttl_secs = ttl.map(|d| d.as_secs());
        self
    }

    /// Reject configurations the queue cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Config("max_size must be at least 1".to_string()));
        }
        if self.persist_to_storage && self.storage_key.trim().is_empty() {
            return Err(Error::Config("storage_key must not be empty".to_string()));
        }
        Ok(())
    }

    /// Load configuration from `OFFQ_*` environment variables, falling back
    /// to defaults for anything unset.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            max_size: parsed_var("OFFQ_MAX_SIZE")?.unwrap_or(defaults.max_size),
            default_max_retries: parsed_var("OFFQ_DEFAULT_MAX_RETRIES")?
                .unwrap_or(defaults.default_max_retries),
            retry_interval_ms: parsed_var("OFFQ_RETRY_INTERVAL_MS")?
                .unwrap_or(defaults.retry_interval_ms),
            persist_to_storage: parsed_var("OFFQ_PERSIST")?.unwrap_or(defaults.persist_to_storage),
            storage_key: std::env::var("OFFQ_STORAGE_KEY").unwrap_or(defaults.storage_key),
            operation_ttl_secs: parsed_var("OFFQ_OPERATION_TTL_SECS")?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad queue config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read queue config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid value for {name} ({raw:?}): {e}"))),
        Err(_) => Ok(None),
    }
}
