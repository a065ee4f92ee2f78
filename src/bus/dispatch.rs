//! Message envelope utilities shared by the adapters.
//!
//! Outbound: encode a payload once, then fan out to its destination topics.
//! Inbound: ignore foreign traffic, decode, hand the payload to the handler.

use std::collections::HashMap;
use std::future::Future;

use tracing::{debug, error};

use super::{BusError, MessageHandler, Result};
use crate::payload::Payload;

/// Attribute that marks a message as produced by this library.
pub const MARKER_ATTR: &str = "pubsync";
/// Value of [`MARKER_ATTR`].
pub const MARKER_VALUE: &str = "1";
/// Attribute carrying the ordering key where the transport has no native slot.
pub const ORDERING_KEY_ATTR: &str = "orderingKey";

/// Encoded payload ready for a transport.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub data: Vec<u8>,
    pub ordering_key: String,
    pub attributes: HashMap<String, String>,
}

impl OutboundMessage {
    pub fn encode(payload: &Payload) -> Result<Self> {
        let data = payload.to_json()?;
        let attributes = [
            (MARKER_ATTR.to_string(), MARKER_VALUE.to_string()),
            (
                ORDERING_KEY_ATTR.to_string(),
                payload.ordering_key().to_string(),
            ),
        ]
        .into_iter()
        .collect();

        Ok(Self {
            data,
            ordering_key: payload.ordering_key().to_string(),
            attributes,
        })
    }
}

/// Whether a marker attribute value identifies our own traffic.
pub fn is_marked(value: Option<&str>) -> bool {
    value == Some(MARKER_VALUE)
}

/// Publish to each topic in order, attempting every topic.
///
/// A failure on one topic does not prevent the others. When every topic
/// failed with a transient error nothing was delivered, so the aggregate is
/// itself transient; any partial delivery is reported as `Publish`.
pub async fn fan_out<'a, F, Fut>(topics: &[&'a str], mut publish_one: F) -> Result<()>
where
    F: FnMut(&'a str) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut failed = Vec::new();
    let mut all_transient = true;

    for &topic in topics {
        if let Err(e) = publish_one(topic).await {
            error!(topic = %topic, error = %e, "Publish to topic failed");
            all_transient &= e.is_transient();
            failed.push(format!("{}: {}", topic, e));
        }
    }

    if failed.is_empty() {
        return Ok(());
    }

    let message = format!("failed topics [{}]", failed.join("; "));
    if all_transient && failed.len() == topics.len() {
        Err(BusError::Transient(message))
    } else {
        Err(BusError::Publish(message))
    }
}

/// Result of processing one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// Decoded and handed to the handler.
    Delivered,
    /// No marker attribute; not ours.
    Foreign,
    /// Could not be decoded; no retry will help.
    DecodeError,
}

/// Handles the complete check → decode → dispatch cycle for one message.
pub async fn process_message(
    data: &[u8],
    marked: bool,
    handler: &dyn MessageHandler,
) -> DispatchResult {
    if !marked {
        debug!("Ignoring message without marker attribute");
        return DispatchResult::Foreign;
    }

    match Payload::from_json(data) {
        Ok(payload) => {
            handler.handle(payload).await;
            DispatchResult::Delivered
        }
        Err(e) => {
            error!(error = %e, "Failed to decode payload");
            DispatchResult::DecodeError
        }
    }
}
