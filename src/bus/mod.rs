//! Broker adapters.
//!
//! This module contains:
//! - `Broker` trait: publish/listen/stop over one transport
//! - `MessageHandler` trait: receives decoded inbound payloads
//! - Envelope helpers shared by every adapter (marker attribute, fan-out)
//! - Implementations: Channel (in-process), Mock, AMQP, Kafka, Pub/Sub

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::info;

use crate::config::{MessagingConfig, MessagingType};
use crate::payload::{Payload, PayloadError};

pub mod channel;
pub mod dispatch;
pub mod mock;

#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "pubsub")]
pub mod pubsub;

pub use channel::ChannelBroker;
pub use dispatch::{fan_out, process_message, DispatchResult, MARKER_ATTR, MARKER_VALUE};
pub use mock::{MockBroker, ScriptedFailure};

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;
#[cfg(feature = "pubsub")]
pub use pubsub::PubSubBroker;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    /// Retry-eligible failure (resource exhaustion, throttling).
    #[error("Transient broker failure: {0}")]
    Transient(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] PayloadError),

    #[error("Broker is not running")]
    NotRunning,
}

impl BusError {
    /// Whether the unified retry policy may re-attempt this failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Transient(_))
    }
}

/// Receives payloads decoded from the transport.
///
/// Handlers own their error reporting; the adapter acknowledges the message
/// once the returned future completes.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, payload: Payload) -> BoxFuture<'static, ()>;
}

/// Transport-specific publish/listen/stop.
///
/// Implementations:
/// - `ChannelBroker`: in-process tokio broadcast channel
/// - `MockBroker`: recording test double
/// - `AmqpBroker`: RabbitMQ via AMQP
/// - `KafkaBroker`: Kafka via rdkafka
/// - `PubSubBroker`: Google Pub/Sub
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish to every destination topic of the payload, in order.
    ///
    /// Each topic is attempted even when an earlier one failed; the call
    /// fails if any topic failed.
    async fn publish(&self, payload: &Payload) -> Result<()>;

    /// Consume inbound messages until [`Broker::stop`] is called.
    async fn listen(&self, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Ask a running `listen` loop to return.
    async fn stop(&self) -> Result<()>;
}

/// Initialize a broker based on configuration.
///
/// Requires the corresponding feature to be enabled:
/// - AMQP: `--features amqp`
/// - Kafka: `--features kafka`
/// - Pub/Sub: `--features pubsub`
pub async fn init_broker(
    config: &MessagingConfig,
    identity: &str,
    default_topic: &str,
) -> Result<Arc<dyn Broker>> {
    let topics = config.listen_topics(default_topic);

    match config.messaging_type {
        MessagingType::Channel => {
            let broker = ChannelBroker::new(default_topic, topics);
            info!(messaging_type = "channel", "Broker initialized");
            Ok(Arc::new(broker))
        }
        MessagingType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let broker =
                    AmqpBroker::new(&config.amqp, identity, default_topic, topics).await?;
                info!(messaging_type = "amqp", "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "amqp"))]
            {
                let _ = identity;
                Err(BusError::Connection(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .to_string(),
                ))
            }
        }
        MessagingType::Kafka => {
            #[cfg(feature = "kafka")]
            {
                let broker = KafkaBroker::new(&config.kafka, identity, default_topic, topics)?;
                info!(messaging_type = "kafka", "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "kafka"))]
            {
                let _ = identity;
                Err(BusError::Connection(
                    "Kafka support requires the 'kafka' feature. Rebuild with --features kafka"
                        .to_string(),
                ))
            }
        }
        MessagingType::Pubsub => {
            #[cfg(feature = "pubsub")]
            {
                let broker =
                    PubSubBroker::new(&config.pubsub, identity, default_topic, topics).await?;
                info!(messaging_type = "pubsub", "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "pubsub"))]
            {
                let _ = identity;
                Err(BusError::Connection(
                    "Pub/Sub support requires the 'pubsub' feature. Rebuild with --features pubsub"
                        .to_string(),
                ))
            }
        }
    }
}
