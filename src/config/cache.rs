//! Cache optimizer and processing configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::utils::retry::{RetryPolicy, DEFAULT_MAX_RETRIES};

/// One week.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Snapshot store backend discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// In-process map; snapshots are lost on restart.
    #[default]
    Memory,
    /// Redis key-value store.
    Redis,
}

/// Cache optimizer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Global switch for delta suppression.
    pub enabled: bool,
    /// Snapshot lifetime in seconds.
    pub ttl_secs: u64,
    /// Snapshot store backend.
    pub backend: CacheBackend,
    /// Redis connection URL (redis backend only).
    pub redis_url: String,
    /// Prefix for all snapshot keys.
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
            backend: CacheBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "pubsync".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Config with the optimizer switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Inbound processing configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Retries after the first attempt for transient failures.
    pub max_retries: usize,
    /// Upper bound for a single handler attempt, in milliseconds.
    pub handler_timeout_ms: Option<u64>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            handler_timeout_ms: None,
        }
    }
}

impl ProcessingConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }
}
