//! Kafka broker implementation.
//!
//! Topic names are used as-is. The ordering key is the message key, so all
//! payloads sharing an ordering key land on one partition in publish order.
//! Listeners join a consumer group named after the subscription identity
//! unless `kafka.group_id` overrides it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Headers, Message as KafkaMessage, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::dispatch::{fan_out, is_marked, process_message, OutboundMessage, MARKER_ATTR};
use super::{Broker, BusError, MessageHandler, Result};
use crate::config::KafkaConfig;
use crate::payload::Payload;

/// Delivery timeout for a single produce call.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka broker implementation.
pub struct KafkaBroker {
    producer: FutureProducer,
    consumer: StreamConsumer,
    default_topic: String,
    topics: Vec<String>,
    stop_tx: watch::Sender<bool>,
}

impl KafkaBroker {
    /// Create a new Kafka broker.
    pub fn new(
        config: &KafkaConfig,
        identity: &str,
        default_topic: &str,
        topics: Vec<String>,
    ) -> Result<Self> {
        let producer: FutureProducer = build_producer_config(config)
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka producer: {}", e)))?;

        let group_id = config.group_id.as_deref().unwrap_or(identity);
        let consumer: StreamConsumer = build_consumer_config(config, group_id)
            .create()
            .map_err(|e| BusError::Connection(format!("Failed to create Kafka consumer: {}", e)))?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            group_id = %group_id,
            "Connected to Kafka"
        );

        Ok(Self {
            producer,
            consumer,
            default_topic: default_topic.to_string(),
            topics,
            stop_tx: watch::channel(false).0,
        })
    }

    fn headers(outbound: &OutboundMessage) -> OwnedHeaders {
        outbound
            .attributes
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_str()),
                })
            })
    }

    fn marker<H: Headers>(headers: Option<&H>) -> Option<String> {
        headers?
            .iter()
            .find(|header| header.key == MARKER_ATTR)
            .and_then(|header| header.value)
            .and_then(|value| std::str::from_utf8(value).ok())
            .map(str::to_string)
    }

    async fn publish_to(&self, topic: &str, outbound: &OutboundMessage) -> Result<()> {
        let record = FutureRecord::to(topic)
            .payload(&outbound.data)
            .key(&outbound.ordering_key)
            .headers(Self::headers(outbound));

        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map_err(|(e, _)| classify(e))?;

        debug!(topic = %topic, key = %outbound.ordering_key, "Published payload to Kafka");
        Ok(())
    }
}

/// Queue exhaustion and timeouts are retry-eligible; everything else is not.
fn classify(e: KafkaError) -> BusError {
    match e.rdkafka_error_code() {
        Some(RDKafkaErrorCode::QueueFull) | Some(RDKafkaErrorCode::MessageTimedOut) => {
            BusError::Transient(format!("Kafka producer busy: {}", e))
        }
        _ => BusError::Publish(format!("Failed to publish: {}", e)),
    }
}

/// Build a ClientConfig for producers.
fn build_producer_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.bootstrap_servers);
    client.set("message.timeout.ms", "5000");
    client.set("acks", "all");
    client.set("enable.idempotence", "true");

    apply_security_config(config, &mut client);
    client
}

/// Build a ClientConfig for consumers.
fn build_consumer_config(config: &KafkaConfig, group_id: &str) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.bootstrap_servers);
    client.set("group.id", group_id);
    client.set("enable.auto.commit", "false");
    client.set("auto.offset.reset", "earliest");

    apply_security_config(config, &mut client);
    client
}

/// Apply security settings to a ClientConfig.
fn apply_security_config(config: &KafkaConfig, client: &mut ClientConfig) {
    if let Some(ref protocol) = config.security_protocol {
        client.set("security.protocol", protocol);
    }

    if let Some(ref mechanism) = config.sasl_mechanism {
        client.set("sasl.mechanism", mechanism);
    }

    if let Some(ref username) = config.sasl_username {
        client.set("sasl.username", username);
    }

    if let Some(ref password) = config.sasl_password {
        client.set("sasl.password", password);
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(subject_type = %payload.subject_type()))]
    async fn publish(&self, payload: &Payload) -> Result<()> {
        let outbound = OutboundMessage::encode(payload)?;
        let topics = payload.destinations(&self.default_topic);
        let outbound = &outbound;

        fan_out(&topics, |topic| self.publish_to(topic, outbound)).await
    }

    async fn listen(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let topic_refs: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topic_refs)
            .map_err(|e| BusError::Subscribe(format!("Failed to subscribe to topics: {}", e)))?;

        info!(topics = ?self.topics, "Subscribed to Kafka topics");

        let mut stop_rx = self.stop_tx.subscribe();
        let mut stream = self.consumer.stream();

        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }

            tokio::select! {
                _ = stop_rx.changed() => break,
                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        let Some(data) = message.payload() else {
                            warn!("Received message with no payload");
                            if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                                error!(error = %e, "Failed to commit offset");
                            }
                            continue;
                        };

                        debug!(
                            topic = %message.topic(),
                            partition = message.partition(),
                            offset = message.offset(),
                            "Received message"
                        );

                        let marked = is_marked(Self::marker(message.headers()).as_deref());
                        process_message(data, marked, handler.as_ref()).await;

                        // Commit even on decode errors to avoid reprocessing malformed messages
                        if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                            error!(error = %e, "Failed to commit offset");
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Kafka consumer error");
                    }
                    None => {
                        info!("Kafka stream ended");
                        break;
                    }
                },
            }
        }

        self.consumer.unsubscribe();
        info!(topics = ?self.topics, "Kafka listener stopped");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_tx.send_replace(true);
        Ok(())
    }
}
