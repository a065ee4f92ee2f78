//! Notification envelope.
//!
//! A [`Payload`] is the unit exchanged between processes: business `data`,
//! `routing` (what kind of change this is) and `headers` (delivery metadata).
//! Payloads validate themselves on construction and never change afterwards;
//! the pipeline stages that need a different envelope (ordering-key
//! assignment, delta trimming, app-key stamping) produce a new value.
//!
//! Wire shape:
//!
//! ```json
//! { "data": {...}, "routing": {"subjectType": "User", "action": "update"}, "headers": {...} }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Business content of a notification.
pub type DataMap = Map<String, Value>;

/// Errors raised while building or decoding a payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Missing routing info: '{field}' is required")]
    MissingRoutingInfo { field: &'static str },

    #[error("Failed to decode payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Identifies what kind of change a payload describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    subject_type: String,
    action: String,
}

impl Routing {
    pub fn new(subject_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            subject_type: subject_type.into(),
            action: action.into(),
        }
    }

    pub fn subject_type(&self) -> &str {
        &self.subject_type
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    fn validate(&self) -> Result<(), PayloadError> {
        if self.subject_type.trim().is_empty() {
            return Err(PayloadError::MissingRoutingInfo {
                field: "subjectType",
            });
        }
        if self.action.trim().is_empty() {
            return Err(PayloadError::MissingRoutingInfo { field: "action" });
        }
        Ok(())
    }
}

/// Destination override: one topic or an ordered set of topics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TopicNames {
    One(String),
    Many(Vec<String>),
}

impl TopicNames {
    /// Topic names in publish order.
    pub fn names(&self) -> Vec<&str> {
        match self {
            TopicNames::One(name) => vec![name.as_str()],
            TopicNames::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

/// Delivery metadata.
///
/// Defaults for `idempotency_key`, `ordering_key` and `uuid` are filled in by
/// [`Payload::new`] only where the caller left them empty. Unknown headers
/// survive a wire round-trip through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Headers {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_names: Option<TopicNames>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced_ordering_key: Option<String>,
    /// Fields that always ride along when the cache optimizer trims data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_fields: Option<Vec<String>>,
    /// `Some(false)` opts this payload out of the cache optimizer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Headers {
    pub fn with_app_key(mut self, app_key: impl Into<String>) -> Self {
        self.app_key = Some(app_key.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    pub fn with_forced_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.forced_ordering_key = Some(key.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic_names = Some(TopicNames::One(topic.into()));
        self
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topic_names = Some(TopicNames::Many(
            topics.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn with_required_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache = Some(false);
        self
    }

    /// Fill in computed defaults. Caller-provided values are kept, so applying
    /// this twice yields the same headers.
    fn apply_defaults(&mut self, routing: &Routing) {
        if self.idempotency_key.is_none() {
            self.idempotency_key = Some(format!(
                "{}/{}",
                routing.subject_type(),
                routing.action()
            ));
        }
        if self.ordering_key.is_none() {
            self.ordering_key = Some(routing.subject_type().to_string());
        }
        if self.uuid.is_none() {
            self.uuid = Some(Uuid::new_v4());
        }
    }
}

/// Immutable notification envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payload {
    data: DataMap,
    routing: Routing,
    headers: Headers,
}

impl Payload {
    /// Build a payload, failing with [`PayloadError::MissingRoutingInfo`] when
    /// the subject type or action is empty.
    pub fn new(data: DataMap, routing: Routing, headers: Headers) -> Result<Self, PayloadError> {
        routing.validate()?;
        let mut headers = headers;
        headers.apply_defaults(&routing);
        Ok(Self {
            data,
            routing,
            headers,
        })
    }

    /// Shorthand for `Payload::new` with default headers.
    pub fn routed(
        subject_type: impl Into<String>,
        action: impl Into<String>,
        data: DataMap,
    ) -> Result<Self, PayloadError> {
        Self::new(data, Routing::new(subject_type, action), Headers::default())
    }

    pub fn data(&self) -> &DataMap {
        &self.data
    }

    pub fn routing(&self) -> &Routing {
        &self.routing
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn subject_type(&self) -> &str {
        self.routing.subject_type()
    }

    pub fn action(&self) -> &str {
        self.routing.action()
    }

    pub fn app_key(&self) -> Option<&str> {
        self.headers.app_key.as_deref()
    }

    pub fn idempotency_key(&self) -> &str {
        self.headers.idempotency_key.as_deref().unwrap_or_default()
    }

    pub fn ordering_key(&self) -> &str {
        self.headers.ordering_key.as_deref().unwrap_or_default()
    }

    pub fn forced_ordering_key(&self) -> Option<&str> {
        self.headers.forced_ordering_key.as_deref()
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.headers.uuid
    }

    /// Explicit destination topics, if the payload overrides the default.
    pub fn topic_names(&self) -> Vec<&str> {
        self.headers
            .topic_names
            .as_ref()
            .map(TopicNames::names)
            .unwrap_or_default()
    }

    /// Resolve destinations, falling back to `default_topic`.
    pub fn destinations<'a>(&'a self, default_topic: &'a str) -> Vec<&'a str> {
        let names = self.topic_names();
        if names.is_empty() {
            vec![default_topic]
        } else {
            names
        }
    }

    pub fn required_fields(&self) -> Option<&[String]> {
        self.headers.required_fields.as_deref()
    }

    pub fn cache_enabled(&self) -> bool {
        self.headers.cache.unwrap_or(true)
    }

    /// Serialize to the wire envelope.
    pub fn to_json(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a wire envelope, re-validating routing.
    pub fn from_json(bytes: &[u8]) -> Result<Self, PayloadError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        envelope.try_into()
    }

    pub(crate) fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.headers.ordering_key = Some(key.into());
        self
    }

    pub(crate) fn with_data(mut self, data: DataMap) -> Self {
        self.data = data;
        self
    }

    pub(crate) fn stamped_with(mut self, app_key: &str) -> Self {
        if self.headers.app_key.is_none() {
            self.headers.app_key = Some(app_key.to_string());
        }
        self
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} (key={}, ordering={})",
            self.subject_type(),
            self.action(),
            self.idempotency_key(),
            self.ordering_key()
        )
    }
}

/// Wire form before validation; routing parts may be missing.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub data: DataMap,
    #[serde(default)]
    pub routing: RawRouting,
    #[serde(default)]
    pub headers: Headers,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRouting {
    pub subject_type: Option<String>,
    pub action: Option<String>,
}

impl TryFrom<Envelope> for Payload {
    type Error = PayloadError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let subject_type = envelope
            .routing
            .subject_type
            .ok_or(PayloadError::MissingRoutingInfo {
                field: "subjectType",
            })?;
        let action = envelope
            .routing
            .action
            .ok_or(PayloadError::MissingRoutingInfo { field: "action" })?;
        Payload::new(
            envelope.data,
            Routing::new(subject_type, action),
            envelope.headers,
        )
    }
}

#[cfg(test)]
mod tests;
