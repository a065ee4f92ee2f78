//! Mock broker implementation for testing.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};

use super::{Broker, BusError, MessageHandler, Result};
use crate::payload::Payload;

/// Failure injected into the next publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// Fails with [`BusError::Transient`].
    Transient,
    /// Fails with [`BusError::Publish`].
    Fatal,
}

impl ScriptedFailure {
    fn into_error(self) -> BusError {
        match self {
            ScriptedFailure::Transient => BusError::Transient("Mock transient failure".to_string()),
            ScriptedFailure::Fatal => BusError::Publish("Mock publish failure".to_string()),
        }
    }
}

/// Mock broker for testing.
///
/// Records successfully published payloads, counts every publish attempt and
/// lets tests inject inbound payloads through [`MockBroker::deliver`].
pub struct MockBroker {
    published: RwLock<Vec<Payload>>,
    attempts: RwLock<usize>,
    fail_on_publish: RwLock<bool>,
    scripted: RwLock<VecDeque<ScriptedFailure>>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    stop_tx: watch::Sender<bool>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self {
            published: RwLock::new(Vec::new()),
            attempts: RwLock::new(0),
            fail_on_publish: RwLock::new(false),
            scripted: RwLock::new(VecDeque::new()),
            handler: RwLock::new(None),
            stop_tx: watch::channel(false).0,
        }
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    /// Fail the next publish calls in order, one entry per call.
    pub async fn script_failures(&self, failures: impl IntoIterator<Item = ScriptedFailure>) {
        self.scripted.write().await.extend(failures);
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    /// Publish calls made, including failed ones.
    pub async fn attempts(&self) -> usize {
        *self.attempts.read().await
    }

    pub async fn take_published(&self) -> Vec<Payload> {
        std::mem::take(&mut *self.published.write().await)
    }

    /// Hand an inbound payload to the listening handler.
    pub async fn deliver(&self, payload: Payload) -> Result<()> {
        let handler = self
            .handler
            .read()
            .await
            .clone()
            .ok_or(BusError::NotRunning)?;
        handler.handle(payload).await;
        Ok(())
    }

    pub async fn is_listening(&self) -> bool {
        self.handler.read().await.is_some()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn publish(&self, payload: &Payload) -> Result<()> {
        *self.attempts.write().await += 1;

        if let Some(failure) = self.scripted.write().await.pop_front() {
            return Err(failure.into_error());
        }
        if *self.fail_on_publish.read().await {
            return Err(BusError::Publish("Mock publish failure".to_string()));
        }

        self.published.write().await.push(payload.clone());
        Ok(())
    }

    async fn listen(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut stop_rx = self.stop_tx.subscribe();
        *self.handler.write().await = Some(handler);

        // Sender lives in self, so changed() only errors if the broker drops.
        while !*stop_rx.borrow_and_update() {
            if stop_rx.changed().await.is_err() {
                break;
            }
        }

        *self.handler.write().await = None;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_tx.send_replace(true);
        Ok(())
    }
}
