//! Test utilities and in-memory fakes.
//!
//! Fakes for the handler-side traits so publish and process pipelines can be
//! exercised without a broker or a database.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Value};

use crate::bus::{MessageHandler, MockBroker};
use crate::cache::{CacheOptimizer, MemorySnapshotStore};
use crate::config::{CacheConfig, DEFAULT_TOPIC};
use crate::dispatch::{HandlerError, SyncRecord, SyncTarget};
use crate::hooks::{HookDecision, Hooks};
use crate::payload::{DataMap, Payload};
use crate::publisher::{Publisher, PublisherSettings};

/// Turn a JSON object literal into a data map.
pub fn make_data(value: Value) -> DataMap {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

/// Payload with data `{"id": 1}`.
pub fn make_payload(subject_type: &str, action: &str) -> Payload {
    Payload::routed(subject_type, action, make_data(json!({"id": 1}))).unwrap()
}

/// Publisher over a [`MockBroker`] with the cache optimizer off.
pub fn mock_publisher(hooks: Hooks) -> (Arc<MockBroker>, Publisher) {
    let broker = Arc::new(MockBroker::new());
    let publisher = Publisher::new(
        broker.clone(),
        hooks,
        CacheOptimizer::disabled(),
        PublisherSettings::default(),
    );
    (broker, publisher)
}

/// Publisher over a [`MockBroker`] with an in-memory snapshot store.
pub fn cached_publisher(hooks: Hooks) -> (Arc<MockBroker>, Publisher) {
    let broker = Arc::new(MockBroker::new());
    let optimizer = CacheOptimizer::new(
        Some(Arc::new(MemorySnapshotStore::new())),
        &CacheConfig::default(),
        DEFAULT_TOPIC,
    );
    let publisher = Publisher::new(
        broker.clone(),
        hooks,
        optimizer,
        PublisherSettings::default(),
    );
    (broker, publisher)
}

/// Message handler that only counts deliveries.
#[derive(Default)]
pub struct CountingHandler {
    count: Arc<AtomicUsize>,
}

impl CountingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> Arc<AtomicUsize> {
        self.count.clone()
    }
}

impl MessageHandler for CountingHandler {
    fn handle(&self, _payload: Payload) -> BoxFuture<'static, ()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {})
    }
}

/// Message handler that keeps every payload it receives.
#[derive(Default)]
pub struct RecordingHandler {
    received: Mutex<Vec<Payload>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<Payload> {
        self.received.lock().unwrap().clone()
    }
}

impl MessageHandler for RecordingHandler {
    fn handle(&self, payload: Payload) -> BoxFuture<'static, ()> {
        self.received.lock().unwrap().push(payload);
        Box::pin(async {})
    }
}

/// Calls observed by a [`RecordingTarget`].
#[derive(Debug, Clone, PartialEq)]
pub enum TargetCall {
    Invoke { operation: String, data: DataMap },
    Locate { identifiers: DataMap },
    Persist { attributes: DataMap },
    Remove { attributes: DataMap },
    RecordInvoke { operation: String, data: DataMap },
}

impl TargetCall {
    /// Whether this call ran an operation (as opposed to a lookup).
    pub fn is_operation(&self) -> bool {
        !matches!(self, TargetCall::Locate { .. })
    }
}

#[derive(Default)]
struct TargetState {
    calls: Vec<TargetCall>,
    transient_failures: usize,
    fatal: Option<String>,
    validation_errors: Vec<String>,
    passing_checks: HashSet<String>,
    cancel_saves: bool,
    delay: Option<Duration>,
}

/// Sync target that records every call and fails on request.
#[derive(Clone, Default)]
pub struct RecordingTarget {
    state: Arc<Mutex<TargetState>>,
}

impl RecordingTarget {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TargetState> {
        self.state.lock().unwrap()
    }

    /// Fail the next `n` operations with a transient error.
    pub fn fail_transiently(&self, n: usize) {
        self.state().transient_failures = n;
    }

    /// Fail every operation with a fatal error.
    pub fn fail_fatally(&self, message: &str) {
        self.state().fatal = Some(message.to_string());
    }

    /// Leave these validation errors on every record after its operation.
    pub fn reject_with(&self, errors: &[&str]) {
        self.state().validation_errors = errors.iter().map(|e| e.to_string()).collect();
    }

    /// Make the named guard check pass.
    pub fn pass_check(&self, name: &str) {
        self.state().passing_checks.insert(name.to_string());
    }

    /// Records refuse to save.
    pub fn cancel_saves(&self) {
        self.state().cancel_saves = true;
    }

    /// Sleep this long in every operation.
    pub fn delay_by(&self, delay: Duration) {
        self.state().delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<TargetCall> {
        self.state().calls.clone()
    }

    /// Number of operation attempts (lookups excluded).
    pub fn operations(&self) -> usize {
        self.state().calls.iter().filter(|c| c.is_operation()).count()
    }

    async fn run(&self, call: TargetCall) -> Result<(), HandlerError> {
        let delay = {
            let mut state = self.state();
            state.calls.push(call);
            state.delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(message) = &state.fatal {
            return Err(HandlerError::Fatal(message.clone()));
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(HandlerError::Transient("lock contention".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncTarget for RecordingTarget {
    async fn invoke(&self, operation: &str, data: &DataMap) -> Result<(), HandlerError> {
        self.run(TargetCall::Invoke {
            operation: operation.to_string(),
            data: data.clone(),
        })
        .await
    }

    async fn locate(&self, identifiers: &DataMap) -> Result<Box<dyn SyncRecord>, HandlerError> {
        self.state().calls.push(TargetCall::Locate {
            identifiers: identifiers.clone(),
        });
        Ok(Box::new(RecordingRecord {
            target: self.clone(),
            attributes: identifiers.clone(),
        }))
    }

    fn check(&self, name: &str, _payload: &Payload) -> bool {
        self.state().passing_checks.contains(name)
    }
}

/// Record handed out by [`RecordingTarget::locate`].
pub struct RecordingRecord {
    target: RecordingTarget,
    attributes: DataMap,
}

#[async_trait]
impl SyncRecord for RecordingRecord {
    fn assign(&mut self, attributes: DataMap) {
        self.attributes.extend(attributes);
    }

    fn before_save(&mut self, _payload: &Payload) -> HookDecision {
        if self.target.state().cancel_saves {
            HookDecision::Cancel
        } else {
            HookDecision::Proceed
        }
    }

    async fn persist(&mut self) -> Result<(), HandlerError> {
        self.target
            .run(TargetCall::Persist {
                attributes: self.attributes.clone(),
            })
            .await
    }

    async fn remove(&mut self) -> Result<(), HandlerError> {
        self.target
            .run(TargetCall::Remove {
                attributes: self.attributes.clone(),
            })
            .await
    }

    async fn invoke(&mut self, operation: &str, data: &DataMap) -> Result<(), HandlerError> {
        self.target
            .run(TargetCall::RecordInvoke {
                operation: operation.to_string(),
                data: data.clone(),
            })
            .await
    }

    fn validation_errors(&self) -> Vec<String> {
        self.target.state().validation_errors.clone()
    }
}
