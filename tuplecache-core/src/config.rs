//! Shared iterator cache configuration.
//!
//! Values only. Loading from files is left to the embedding application;
//! `from_env` covers the common deployment case.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Default ceiling on cached entries across all operation kinds.
pub const DEFAULT_SHARED_ITERATOR_LIMIT: usize = 1_000_000;

/// Default maximum lifetime of a cached entry.
pub const DEFAULT_ADMISSION_TIMEOUT_MS: u64 = 10_000;

/// Default maximum time a cached entry may go unused.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 1_000;

/// Default number of items pulled from the backend per fetch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Configuration for the shared iterator cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedIteratorConfig {
    /// When false every read goes straight to the backend.
    pub enabled: bool,

    /// Maximum number of cached entries across all operation kinds. Reads
    /// arriving at or above the limit bypass the cache.
    pub limit: usize,

    /// Unconditional cap on how long one cached result may be reused.
    #[serde(with = "duration_ms")]
    pub admission_timeout: Duration,

    /// How long an entry may go without a reuse before it is evicted.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,

    /// Items pulled from the backend per coordinated fetch.
    pub batch_size: usize,

    /// Once a shared result has buffered more than this many items, no new
    /// readers may join it. `None` means unbounded.
    pub max_buffered_items: Option<usize>,
}

impl Default for SharedIteratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: DEFAULT_SHARED_ITERATOR_LIMIT,
            admission_timeout: Duration::from_millis(DEFAULT_ADMISSION_TIMEOUT_MS),
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            batch_size: DEFAULT_BATCH_SIZE,
            max_buffered_items: None,
        }
    }
}

impl SharedIteratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_buffered_items(mut self, max: Option<usize>) -> Self {
        self.max_buffered_items = max;
        self
    }

    /// Build a config from environment variables, falling back to defaults
    /// for anything unset or unparsable.
    ///
    /// Environment variables:
    /// - `TUPLECACHE_SHARED_ITERATOR_ENABLED`: "true" or "false" (default: true)
    /// - `TUPLECACHE_SHARED_ITERATOR_LIMIT`: entry ceiling (default: 1000000)
    /// - `TUPLECACHE_SHARED_ITERATOR_ADMISSION_TIMEOUT_MS` (default: 10000)
    /// - `TUPLECACHE_SHARED_ITERATOR_IDLE_TIMEOUT_MS` (default: 1000)
    /// - `TUPLECACHE_SHARED_ITERATOR_BATCH_SIZE` (default: 100)
    /// - `TUPLECACHE_SHARED_ITERATOR_MAX_BUFFERED_ITEMS` (default: unbounded)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let enabled = lookup("TUPLECACHE_SHARED_ITERATOR_ENABLED")
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(defaults.enabled);

        let limit = lookup("TUPLECACHE_SHARED_ITERATOR_LIMIT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.limit);

        let admission_timeout = lookup("TUPLECACHE_SHARED_ITERATOR_ADMISSION_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.admission_timeout);

        let idle_timeout = lookup("TUPLECACHE_SHARED_ITERATOR_IDLE_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.idle_timeout);

        let batch_size = lookup("TUPLECACHE_SHARED_ITERATOR_BATCH_SIZE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.batch_size);

        let max_buffered_items = lookup("TUPLECACHE_SHARED_ITERATOR_MAX_BUFFERED_ITEMS")
            .and_then(|s| s.parse().ok());

        Self {
            enabled,
            limit,
            admission_timeout,
            idle_timeout,
            batch_size,
            max_buffered_items,
        }
    }

    /// Reject values the cache cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "0", "must be greater than zero"));
        }
        if self.admission_timeout.is_zero() {
            return Err(invalid(
                "admission_timeout",
                "0ms",
                "must be greater than zero",
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(invalid("idle_timeout", "0ms", "must be greater than zero"));
        }
        if let Some(0) = self.max_buffered_items {
            return Err(invalid(
                "max_buffered_items",
                "0",
                "use None for unbounded, or a positive bound",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Durations are written as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
