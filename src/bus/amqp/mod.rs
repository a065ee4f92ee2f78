//! AMQP (RabbitMQ) broker implementation.
//!
//! Each topic is a durable fanout exchange. A listener declares one durable
//! queue named after its subscription identity and binds it to every topic
//! it listens on, so instances sharing an identity share the work.
//! The ordering key travels as the routing key and as a header.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, ExchangeKind,
};
use tokio::sync::watch;
use tracing::{debug, error, info, Instrument};

use super::dispatch::{fan_out, is_marked, process_message, OutboundMessage, MARKER_ATTR};
use super::{Broker, BusError, MessageHandler, Result};
use crate::config::AmqpConfig;
use crate::payload::Payload;
use crate::utils::retry::reconnect_backoff;

/// AMQP broker using RabbitMQ.
pub struct AmqpBroker {
    pool: Pool,
    queue: String,
    default_topic: String,
    topics: Vec<String>,
    stop_tx: watch::Sender<bool>,
}

impl AmqpBroker {
    /// Create a new AMQP broker and verify connectivity.
    pub async fn new(
        config: &AmqpConfig,
        identity: &str,
        default_topic: &str,
        topics: Vec<String>,
    ) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        // Verify connection
        let conn = pool
            .get()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;
        drop(conn);

        info!(url = %config.url, queue = %identity, "Connected to AMQP");

        Ok(Self {
            pool,
            queue: identity.to_string(),
            default_topic: default_topic.to_string(),
            topics,
            stop_tx: watch::channel(false).0,
        })
    }

    /// Get a channel from the pool.
    async fn get_channel(pool: &Pool) -> Result<Channel> {
        let conn = pool.get().await.map_err(|e: PoolError| {
            BusError::Transient(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BusError::Transient(format!("Failed to create channel: {}", e)))
    }

    async fn declare_exchange(channel: &Channel, topic: &str) -> Result<()> {
        channel
            .exchange_declare(
                topic,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("Failed to declare exchange: {}", e)))
    }

    fn headers(outbound: &OutboundMessage) -> FieldTable {
        let mut headers = FieldTable::default();
        for (key, value) in &outbound.attributes {
            headers.insert(
                key.clone().into(),
                AMQPValue::LongString(value.clone().into()),
            );
        }
        headers
    }

    async fn publish_to(&self, topic: &str, outbound: &OutboundMessage) -> Result<()> {
        let channel = Self::get_channel(&self.pool).await?;
        Self::declare_exchange(&channel, topic).await?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2) // persistent
            .with_headers(Self::headers(outbound));

        let confirm = channel
            .basic_publish(
                topic,
                &outbound.ordering_key,
                BasicPublishOptions::default(),
                &outbound.data,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

        debug!(exchange = %topic, ordering_key = %outbound.ordering_key, "Published payload");
        Ok(())
    }

    /// Declare the queue, bind it to every topic, and start consuming.
    async fn setup_consumer(
        pool: &Pool,
        queue: &str,
        topics: &[String],
    ) -> Result<lapin::Consumer> {
        let channel = Self::get_channel(pool).await?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;

        for topic in topics {
            Self::declare_exchange(&channel, topic).await?;
            channel
                .queue_bind(
                    queue,
                    topic,
                    "",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Subscribe(format!("Failed to bind queue: {}", e)))?;

            info!(queue = %queue, exchange = %topic, "Bound queue to exchange");
        }

        channel
            .basic_consume(
                queue,
                queue,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))
    }

    fn marker(properties: &BasicProperties) -> Option<String> {
        properties
            .headers()
            .as_ref()
            .and_then(|headers| headers.inner().get(MARKER_ATTR))
            .and_then(|value| match value {
                AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok().map(str::to_string),
                _ => None,
            })
    }

    /// Process a single delivery and acknowledge it.
    async fn process_delivery(delivery: lapin::message::Delivery, handler: &dyn MessageHandler) {
        let marked = is_marked(Self::marker(&delivery.properties).as_deref());
        let consume_span = tracing::info_span!("bus.consume", exchange = %delivery.exchange);

        process_message(&delivery.data, marked, handler)
            .instrument(consume_span)
            .await;

        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            error!(error = %e, "Failed to ack message");
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(subject_type = %payload.subject_type()))]
    async fn publish(&self, payload: &Payload) -> Result<()> {
        let outbound = OutboundMessage::encode(payload)?;
        let topics = payload.destinations(&self.default_topic);
        let outbound = &outbound;

        fan_out(&topics, |topic| self.publish_to(topic, outbound)).await
    }

    /// Consumer loop with automatic reconnection and exponential backoff with jitter.
    async fn listen(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut stop_rx = self.stop_tx.subscribe();
        let backoff_builder = reconnect_backoff();
        let mut backoff_iter = backoff_builder.build();

        'reconnect: loop {
            if *stop_rx.borrow_and_update() {
                break;
            }

            let mut consumer =
                match Self::setup_consumer(&self.pool, &self.queue, &self.topics).await {
                    Ok(consumer) => consumer,
                    Err(e) => {
                        let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                        error!(
                            error = %e,
                            backoff_ms = %delay.as_millis(),
                            queue = %self.queue,
                            "Failed to set up consumer, retrying after backoff"
                        );
                        tokio::select! {
                            _ = stop_rx.changed() => break 'reconnect,
                            _ = tokio::time::sleep(delay) => continue 'reconnect,
                        }
                    }
                };

            info!(queue = %self.queue, topics = ?self.topics, "Consumer connected, processing messages");
            // Reset backoff on successful connection
            backoff_iter = backoff_builder.build();

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break 'reconnect,
                    delivery = consumer.next() => match delivery {
                        Some(Ok(delivery)) => {
                            Self::process_delivery(delivery, handler.as_ref()).await;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Consumer delivery error, will reconnect");
                            break;
                        }
                        None => {
                            info!(queue = %self.queue, "Consumer stream ended, reconnecting...");
                            break;
                        }
                    },
                }
            }

            // Brief pause before reconnecting
            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::select! {
                _ = stop_rx.changed() => break 'reconnect,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(queue = %self.queue, "AMQP listener stopped");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_tx.send_replace(true);
        Ok(())
    }
}
