//! Shared fakes for integration tests.
//!
//! The crate's own test fakes are private, so integration tests carry a
//! small sync target of their own.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pubsync::dispatch::{HandlerError, SyncRecord, SyncTarget};
use pubsync::payload::{DataMap, Payload};
use serde_json::Value;

/// Data map from a JSON object literal.
pub fn data(value: Value) -> DataMap {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

pub fn payload(subject_type: &str, action: &str, value: Value) -> Payload {
    Payload::routed(subject_type, action, data(value)).unwrap()
}

/// Integer `id` of every payload, in order.
pub fn ids(payloads: &[Payload]) -> Vec<i64> {
    payloads
        .iter()
        .filter_map(|p| p.data().get("id").and_then(Value::as_i64))
        .collect()
}

/// What a [`LocalStore`] saw, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Invoked(String, DataMap),
    Saved(DataMap),
    Removed(DataMap),
}

#[derive(Default)]
struct StoreState {
    applied: Vec<Applied>,
    transient_failures: usize,
    attempts: usize,
}

/// Local model store receiving synced changes.
#[derive(Clone, Default)]
pub struct LocalStore {
    state: Arc<Mutex<StoreState>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_transiently(&self, n: usize) {
        self.state.lock().unwrap().transient_failures = n;
    }

    pub fn applied(&self) -> Vec<Applied> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    fn apply(&self, change: Applied) -> Result<(), HandlerError> {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(HandlerError::Transient("deadlock detected".to_string()));
        }
        state.applied.push(change);
        Ok(())
    }

    /// Wait until `n` changes were applied or the timeout expires.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> Vec<Applied> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let applied = self.applied();
            if applied.len() >= n || tokio::time::Instant::now() >= deadline {
                return applied;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl SyncTarget for LocalStore {
    async fn invoke(&self, operation: &str, data: &DataMap) -> Result<(), HandlerError> {
        self.apply(Applied::Invoked(operation.to_string(), data.clone()))
    }

    async fn locate(&self, identifiers: &DataMap) -> Result<Box<dyn SyncRecord>, HandlerError> {
        Ok(Box::new(LocalRecord {
            store: self.clone(),
            attributes: identifiers.clone(),
        }))
    }
}

struct LocalRecord {
    store: LocalStore,
    attributes: DataMap,
}

#[async_trait]
impl SyncRecord for LocalRecord {
    fn assign(&mut self, attributes: DataMap) {
        self.attributes.extend(attributes);
    }

    async fn persist(&mut self) -> Result<(), HandlerError> {
        self.store.apply(Applied::Saved(self.attributes.clone()))
    }

    async fn remove(&mut self) -> Result<(), HandlerError> {
        self.store.apply(Applied::Removed(self.attributes.clone()))
    }
}
