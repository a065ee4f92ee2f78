//! Delta-cache optimizer.
//!
//! Suppresses notifications whose data did not change since the last
//! delivery for the same idempotency key and topic, and optionally trims
//! unchanged fields while keeping the payload's required fields.
//!
//! Suppression is an optimization, not a correctness guarantee: when the
//! snapshot store is missing or failing, payloads pass through untouched.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::{CacheBackend, CacheConfig};
use crate::payload::{DataMap, Payload};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemorySnapshotStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisSnapshotStore;

/// Result type for snapshot store operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors raised by a snapshot store.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Snapshot store unavailable: {0}")]
    Unavailable(String),

    #[error("Snapshot encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Keyed store for the last delivered data per notification slot.
///
/// Implementations must support atomic read-then-write per key; races on
/// one key may cost a missed suppression, nothing more.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<DataMap>>;

    async fn put(&self, key: &str, data: &DataMap, ttl: Duration) -> Result<()>;
}

/// Full data to record once a payload has been delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    key: String,
    data: DataMap,
}

impl Snapshot {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn data(&self) -> &DataMap {
        &self.data
    }
}

/// Payload cleared for the broker.
///
/// Carries the snapshot to commit after a successful delivery, so payloads
/// that fail or are rolled back never become the comparison base.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    payload: Payload,
    snapshot: Option<Snapshot>,
}

impl Outbound {
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub(crate) fn map_payload(self, f: impl FnOnce(Payload) -> Payload) -> Self {
        Self {
            payload: f(self.payload),
            snapshot: self.snapshot,
        }
    }
}

impl From<Payload> for Outbound {
    fn from(payload: Payload) -> Self {
        Self {
            payload,
            snapshot: None,
        }
    }
}

/// Decision of the optimizer for one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Optimized {
    /// Publish this (possibly trimmed) payload.
    Deliver(Outbound),
    /// Identical to the last delivery; must not be published.
    Suppressed,
}

/// Snapshot key for a payload: `{idempotencyKey}/{topicNames}`.
pub fn snapshot_key(payload: &Payload, default_topic: &str) -> String {
    format!(
        "{}/{}",
        payload.idempotency_key(),
        payload.destinations(default_topic).join(",")
    )
}

/// Compares payload data against the previous snapshot.
#[derive(Clone)]
pub struct CacheOptimizer {
    store: Option<Arc<dyn SnapshotStore>>,
    enabled: bool,
    ttl: Duration,
    default_topic: String,
}

impl CacheOptimizer {
    pub fn new(
        store: Option<Arc<dyn SnapshotStore>>,
        config: &CacheConfig,
        default_topic: impl Into<String>,
    ) -> Self {
        Self {
            store,
            enabled: config.enabled,
            ttl: config.ttl(),
            default_topic: default_topic.into(),
        }
    }

    /// Optimizer that lets everything through.
    pub fn disabled() -> Self {
        Self {
            store: None,
            enabled: false,
            ttl: Duration::ZERO,
            default_topic: String::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.enabled && self.store.is_some()
    }

    /// Compare against the last delivered data and trim unchanged fields.
    ///
    /// Nothing is written here; call [`CacheOptimizer::commit`] once the
    /// returned payload has reached the broker.
    pub async fn optimize(&self, payload: Payload) -> Optimized {
        let store = match &self.store {
            Some(store) if self.enabled && payload.cache_enabled() => store,
            _ => {
                debug!(payload = %payload, "Cache optimizer skipped");
                return Optimized::Deliver(payload.into());
            }
        };

        let key = snapshot_key(&payload, &self.default_topic);
        let previous = match store.get(&key).await {
            Ok(previous) => previous,
            Err(e) => {
                debug!(key = %key, error = %e, "Snapshot store unavailable, delivering as is");
                return Optimized::Deliver(payload.into());
            }
        };

        if previous.as_ref() == Some(payload.data()) {
            debug!(key = %key, "Unchanged data, notification suppressed");
            return Optimized::Suppressed;
        }

        let snapshot = Some(Snapshot {
            key,
            data: payload.data().clone(),
        });
        let payload = match (&previous, payload.required_fields()) {
            (Some(previous), Some(required)) => {
                let trimmed = trim_unchanged(payload.data(), previous, required);
                payload.with_data(trimmed)
            }
            _ => payload,
        };

        Optimized::Deliver(Outbound { payload, snapshot })
    }

    /// Record a delivered payload's full data as the new comparison base.
    pub async fn commit(&self, snapshot: &Snapshot) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.put(&snapshot.key, &snapshot.data, self.ttl).await {
            debug!(key = %snapshot.key, error = %e, "Failed to store snapshot");
        }
    }
}

/// Keep fields that changed since `previous` plus every `required` field.
fn trim_unchanged(current: &DataMap, previous: &DataMap, required: &[String]) -> DataMap {
    let required: HashSet<&str> = required.iter().map(String::as_str).collect();
    current
        .iter()
        .filter(|(key, value)| {
            required.contains(key.as_str()) || previous.get(key.as_str()) != Some(*value)
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Initialize the snapshot store selected by configuration.
///
/// Returns `None` when the optimizer is disabled.
pub async fn init_snapshot_store(
    config: &CacheConfig,
) -> std::result::Result<Option<Arc<dyn SnapshotStore>>, CacheError> {
    if !config.enabled {
        info!("Cache optimizer disabled");
        return Ok(None);
    }

    match config.backend {
        CacheBackend::Memory => {
            info!(backend = "memory", "Snapshot store initialized");
            Ok(Some(Arc::new(MemorySnapshotStore::new())))
        }
        CacheBackend::Redis => {
            #[cfg(feature = "redis")]
            {
                let store =
                    RedisSnapshotStore::new(&config.redis_url, Some(&config.key_prefix)).await?;
                info!(backend = "redis", "Snapshot store initialized");
                Ok(Some(Arc::new(store)))
            }

            #[cfg(not(feature = "redis"))]
            {
                Err(CacheError::Unavailable(
                    "Redis snapshots require the 'redis' feature. Rebuild with --features redis"
                        .to_string(),
                ))
            }
        }
    }
}
