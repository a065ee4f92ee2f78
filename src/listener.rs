//! Inbound side: broker subscription feeding the processor.
//!
//! Payloads this process published itself come back on shared topics; they
//! are dropped before matching by comparing `appKey` with the subscription
//! identity.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, info};

use crate::bus::{self, Broker, MessageHandler};
use crate::dispatch::Processor;
use crate::payload::Payload;

/// Subscribes a [`Processor`] to a broker.
pub struct Listener {
    broker: Arc<dyn Broker>,
    processor: Arc<Processor>,
    identity: String,
}

impl Listener {
    pub fn new(broker: Arc<dyn Broker>, processor: Arc<Processor>, identity: impl Into<String>) -> Self {
        Self {
            broker,
            processor,
            identity: identity.into(),
        }
    }

    /// Block until the broker stops listening.
    pub async fn run(&self) -> bus::Result<()> {
        info!(
            identity = %self.identity,
            bindings = self.processor.registry().len(),
            "Listener starting"
        );

        let handler = InboundHandler {
            processor: self.processor.clone(),
            identity: self.identity.clone(),
        };
        let result = self.broker.listen(Arc::new(handler)).await;

        info!(identity = %self.identity, "Listener stopped");
        result
    }

    pub async fn stop(&self) -> bus::Result<()> {
        self.broker.stop().await
    }
}

struct InboundHandler {
    processor: Arc<Processor>,
    identity: String,
}

impl MessageHandler for InboundHandler {
    fn handle(&self, payload: Payload) -> BoxFuture<'static, ()> {
        if payload.app_key() == Some(self.identity.as_str()) {
            debug!(payload = %payload, "Ignoring self-originated payload");
            return Box::pin(async {});
        }

        let processor = self.processor.clone();
        Box::pin(async move {
            if let Err(e) = processor.process(&payload, false).await {
                error!(payload = %payload, error = %e, "Processing failed");
            }
        })
    }
}
