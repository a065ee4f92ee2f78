//! In-memory channel-based broker.
//!
//! Uses a tokio broadcast channel for pub/sub within a single process.
//! Brokers created with [`ChannelBroker::linked`] share one channel, so
//! several "processes" can be simulated in one test binary.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

use super::dispatch::{fan_out, is_marked, process_message, OutboundMessage, MARKER_ATTR};
use super::{Broker, MessageHandler, Result};
use crate::payload::Payload;

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 1024;

/// One message on the in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub topic: String,
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
}

/// In-process broker using a tokio broadcast channel.
///
/// Topic filtering is done on the listener side.
pub struct ChannelBroker {
    sender: broadcast::Sender<Arc<ChannelMessage>>,
    default_topic: String,
    topics: Vec<String>,
    stop_tx: watch::Sender<bool>,
}

impl ChannelBroker {
    /// Create a broker with its own channel.
    pub fn new(default_topic: impl Into<String>, topics: Vec<String>) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let default_topic = default_topic.into();

        info!(
            default_topic = %default_topic,
            topics = ?topics,
            "Channel broker initialized"
        );

        Self {
            sender,
            default_topic,
            topics,
            stop_tx: watch::channel(false).0,
        }
    }

    /// Create a broker that shares this broker's channel but listens on
    /// its own topics.
    pub fn linked(&self, topics: Vec<String>) -> Self {
        Self {
            sender: self.sender.clone(),
            default_topic: self.default_topic.clone(),
            topics,
            stop_tx: watch::channel(false).0,
        }
    }

    /// Send a raw message, bypassing payload encoding.
    pub fn send_raw(&self, message: ChannelMessage) {
        if self.sender.send(Arc::new(message)).is_err() {
            debug!("Raw message sent with no receivers");
        }
    }

    fn listens_to(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(subject_type = %payload.subject_type()))]
    async fn publish(&self, payload: &Payload) -> Result<()> {
        let outbound = OutboundMessage::encode(payload)?;
        let topics = payload.destinations(&self.default_topic);

        fan_out(&topics, |topic| {
            let message = ChannelMessage {
                topic: topic.to_string(),
                data: outbound.data.clone(),
                attributes: outbound.attributes.clone(),
            };
            let sent = self.sender.send(Arc::new(message));
            async move {
                match sent {
                    Ok(receivers) => {
                        debug!(topic = %topic, receivers, "Published payload to channel");
                    }
                    // No receivers, that's okay for publish-only scenarios
                    Err(_) => debug!(topic = %topic, "Published payload (no receivers)"),
                }
                Ok(())
            }
        })
        .await
    }

    async fn listen(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut receiver = self.sender.subscribe();
        let mut stop_rx = self.stop_tx.subscribe();

        info!(topics = ?self.topics, "Channel listener started");

        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }

            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                received = receiver.recv() => match received {
                    Ok(message) => {
                        if !self.listens_to(&message.topic) {
                            continue;
                        }
                        debug!(topic = %message.topic, "Received message via channel");
                        let marked = is_marked(message.attributes.get(MARKER_ATTR).map(String::as_str));
                        process_message(&message.data, marked, handler.as_ref()).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        error!(skipped = n, "Channel listener lagged, skipped messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Channel closed, stopping listener");
                        break;
                    }
                },
            }
        }

        info!(topics = ?self.topics, "Channel listener stopped");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_tx.send_replace(true);
        Ok(())
    }
}
