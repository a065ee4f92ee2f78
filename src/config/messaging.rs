//! Messaging and broker configuration types.

use serde::Deserialize;

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process broadcast channel (no external broker).
    #[default]
    Channel,
    /// AMQP/RabbitMQ messaging.
    Amqp,
    /// Kafka messaging.
    Kafka,
    /// Google Pub/Sub messaging.
    Pubsub,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// Topics to listen on. Empty means the default topic only.
    pub topics: Vec<String>,
    /// AMQP-specific configuration.
    pub amqp: AmqpConfig,
    /// Kafka-specific configuration.
    pub kafka: KafkaConfig,
    /// Pub/Sub-specific configuration.
    pub pubsub: PubSubConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            messaging_type: MessagingType::Channel,
            topics: Vec::new(),
            amqp: AmqpConfig::default(),
            kafka: KafkaConfig::default(),
            pubsub: PubSubConfig::default(),
        }
    }
}

impl MessagingConfig {
    /// Topics to listen on, falling back to `default_topic`.
    pub fn listen_topics(&self, default_topic: &str) -> Vec<String> {
        if self.topics.is_empty() {
            vec![default_topic.to_string()]
        } else {
            self.topics.clone()
        }
    }
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Connection pool size.
    pub pool_size: usize,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            pool_size: 10,
        }
    }
}

/// Kafka-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Consumer group ID. Defaults to the subscription identity.
    pub group_id: Option<String>,
    /// SASL username (optional, for authenticated clusters).
    pub sasl_username: Option<String>,
    /// SASL password (optional, for authenticated clusters).
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            group_id: None,
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
        }
    }
}

/// Google Pub/Sub-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// GCP project ID.
    pub project_id: String,
    /// Messages pulled per request.
    pub max_messages: i32,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            max_messages: 10,
        }
    }
}
