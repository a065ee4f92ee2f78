//! Google Pub/Sub broker implementation.
//!
//! Topic names are used as-is; the ordering key becomes the Pub/Sub
//! ordering key. Subscriptions are named `{identity}-{topic}` and created
//! with message ordering enabled.
//!
//! # Authentication
//!
//! Uses ADC (Application Default Credentials):
//! - Set `GOOGLE_APPLICATION_CREDENTIALS` to a service account JSON path
//! - For local testing: set `PUBSUB_EMULATOR_HOST` to the emulator address

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use gcloud_googleapis::pubsub::v1::PubsubMessage;
use gcloud_pubsub::client::{Client, ClientConfig};
use gcloud_pubsub::publisher::Publisher;
use gcloud_pubsub::subscriber::ReceivedMessage;
use gcloud_pubsub::subscription::{Subscription, SubscriptionConfig};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, Instrument};

use super::dispatch::{fan_out, is_marked, process_message, OutboundMessage, MARKER_ATTR};
use super::{Broker, BusError, MessageHandler, Result};
use crate::config::PubSubConfig;
use crate::payload::Payload;
use crate::utils::retry::reconnect_backoff;

/// Google Pub/Sub broker implementation.
pub struct PubSubBroker {
    client: Client,
    identity: String,
    default_topic: String,
    topics: Vec<String>,
    max_messages: i32,
    /// Cache of publishers per topic.
    publishers: RwLock<HashMap<String, Publisher>>,
    stop_tx: watch::Sender<bool>,
}

/// Subscription name for an identity on a topic.
pub fn subscription_name(identity: &str, topic: &str) -> String {
    format!("{}-{}", identity, topic)
}

impl PubSubBroker {
    /// Create a new Pub/Sub broker.
    pub async fn new(
        config: &PubSubConfig,
        identity: &str,
        default_topic: &str,
        topics: Vec<String>,
    ) -> Result<Self> {
        let client_config = ClientConfig::default().with_auth().await.map_err(|e| {
            BusError::Connection(format!("Failed to configure Pub/Sub auth: {}", e))
        })?;

        let client = Client::new(client_config)
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create Pub/Sub client: {}", e)))?;

        info!(project_id = %config.project_id, "Connected to Google Pub/Sub");

        Ok(Self {
            client,
            identity: identity.to_string(),
            default_topic: default_topic.to_string(),
            topics,
            max_messages: config.max_messages,
            publishers: RwLock::new(HashMap::new()),
            stop_tx: watch::channel(false).0,
        })
    }

    /// Get or create a publisher for a topic.
    async fn get_publisher(&self, topic_name: &str) -> Result<Publisher> {
        {
            let publishers = self.publishers.read().await;
            if let Some(publisher) = publishers.get(topic_name) {
                return Ok(publisher.clone());
            }
        }

        let topic = self.client.topic(topic_name);
        if !topic
            .exists(None)
            .await
            .map_err(|e| BusError::Transient(format!("Failed to check topic existence: {}", e)))?
        {
            topic.create(None, None).await.map_err(|e| {
                BusError::Publish(format!("Failed to create topic {}: {}", topic_name, e))
            })?;
            info!(topic = %topic_name, "Created Pub/Sub topic");
        }

        let publisher = topic.new_publisher(None);
        self.publishers
            .write()
            .await
            .insert(topic_name.to_string(), publisher.clone());

        Ok(publisher)
    }

    async fn publish_to(&self, topic: &str, outbound: &OutboundMessage) -> Result<()> {
        let publisher = self.get_publisher(topic).await?;

        let message = PubsubMessage {
            data: outbound.data.clone().into(),
            ordering_key: outbound.ordering_key.clone(),
            attributes: outbound.attributes.clone(),
            ..Default::default()
        };

        let awaiter = publisher.publish(message).await;
        awaiter
            .get()
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish to Pub/Sub: {}", e)))?;

        debug!(topic = %topic, ordering_key = %outbound.ordering_key, "Published payload to Pub/Sub");
        Ok(())
    }

    async fn ensure_subscription(&self, topic_name: &str) -> Result<Subscription> {
        let name = subscription_name(&self.identity, topic_name);
        let subscription = self.client.subscription(&name);

        let exists = subscription.exists(None).await.map_err(|e| {
            BusError::Subscribe(format!("Failed to check subscription existence: {}", e))
        })?;

        if !exists {
            let topic = self.client.topic(topic_name);
            let config = SubscriptionConfig {
                enable_message_ordering: true,
                ..Default::default()
            };

            subscription
                .create(topic.fully_qualified_name(), config, None)
                .await
                .map_err(|e| {
                    BusError::Subscribe(format!("Failed to create subscription {}: {}", name, e))
                })?;

            info!(subscription = %name, topic = %topic_name, "Created Pub/Sub subscription");
        }

        Ok(subscription)
    }

    /// Pull loop for one subscription until stopped. Messages are forwarded
    /// to the listener, which handles them one at a time.
    async fn pull(
        subscription: Subscription,
        max_messages: i32,
        tx: mpsc::Sender<ReceivedMessage>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let backoff_builder = reconnect_backoff();
        let mut backoff_iter = backoff_builder.build();

        info!(subscription = %subscription.id(), "Starting Pub/Sub consumer");

        'pull: loop {
            if *stop_rx.borrow_and_update() {
                break;
            }

            let pulled = tokio::select! {
                _ = stop_rx.changed() => break,
                pulled = subscription.pull(max_messages, None) => pulled,
            };

            match pulled {
                Ok(messages) => {
                    // Reset backoff on successful pull
                    backoff_iter = backoff_builder.build();

                    for message in messages {
                        if tx.send(message).await.is_err() {
                            break 'pull;
                        }
                    }
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Failed to pull messages from Pub/Sub, retrying after backoff"
                    );
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(subscription = %subscription.id(), "Pub/Sub consumer stopped");
    }
}

#[async_trait]
impl Broker for PubSubBroker {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(subject_type = %payload.subject_type()))]
    async fn publish(&self, payload: &Payload) -> Result<()> {
        let outbound = OutboundMessage::encode(payload)?;
        let topics = payload.destinations(&self.default_topic);
        let outbound = &outbound;

        fan_out(&topics, |topic| self.publish_to(topic, outbound)).await
    }

    async fn listen(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        // Every subscription must exist before any pull starts.
        let mut subscriptions = Vec::with_capacity(self.topics.len());
        for topic in &self.topics {
            subscriptions.push(self.ensure_subscription(topic).await?);
        }

        let capacity = usize::try_from(self.max_messages).unwrap_or(1).max(1);
        let (tx, mut rx) = mpsc::channel(capacity);
        // Dropping the set aborts any puller still running.
        let mut pullers = JoinSet::new();
        for subscription in subscriptions {
            pullers.spawn(Self::pull(
                subscription,
                self.max_messages,
                tx.clone(),
                self.stop_tx.subscribe(),
            ));
        }
        drop(tx);

        info!(identity = %self.identity, topics = ?self.topics, "Pub/Sub listener started");

        // Ends once every puller has stopped.
        while let Some(message) = rx.recv().await {
            let marked = is_marked(message.message.attributes.get(MARKER_ATTR).map(String::as_str));
            let consume_span = tracing::info_span!("bus.consume", identity = %self.identity);

            process_message(&message.message.data, marked, handler.as_ref())
                .instrument(consume_span)
                .await;

            if let Err(e) = message.ack().await {
                error!(error = %e, "Failed to ack message");
            }
        }

        while let Some(joined) = pullers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Pub/Sub consumer task failed");
            }
        }

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_tx.send_replace(true);

        let mut publishers = self.publishers.write().await;
        for (_, mut publisher) in publishers.drain() {
            publisher.shutdown().await;
        }
        Ok(())
    }
}
