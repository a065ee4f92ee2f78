//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables. Hooks are
//! code rather than configuration and live in [`crate::hooks::Hooks`].

mod cache;
mod messaging;

pub use cache::{CacheBackend, CacheConfig, ProcessingConfig, DEFAULT_CACHE_TTL_SECS};
pub use messaging::{AmqpConfig, KafkaConfig, MessagingConfig, MessagingType, PubSubConfig};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "pubsync.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "PUBSYNC_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PUBSYNC";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "PUBSYNC_LOG";

/// Default destination topic.
pub const DEFAULT_TOPIC: &str = "pubsync";

use serde::Deserialize;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Verbose logging of pipeline decisions.
    pub debug_mode: bool,
    /// Identity of this process on the bus: stamped as `appKey` on outgoing
    /// payloads and used for loop suppression and as subscription name.
    pub subscription_identity: String,
    /// Destination topic when a payload names none.
    pub topic_name: String,
    /// Whether new transactions buffer until commit.
    pub buffer_transactions_by_default: bool,
    /// Deliver a root transaction's buffer early once it holds this many payloads.
    pub transactions_max_buffer: Option<usize>,
    /// Cache optimizer configuration.
    pub cache: CacheConfig,
    /// Inbound processing configuration.
    pub processing: ProcessingConfig,
    /// Messaging configuration.
    pub messaging: MessagingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug_mode: false,
            subscription_identity: "pubsync-app".to_string(),
            topic_name: DEFAULT_TOPIC.to_string(),
            buffer_transactions_by_default: true,
            transactions_max_buffer: None,
            cache: CacheConfig::default(),
            processing: ProcessingConfig::default(),
            messaging: MessagingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `pubsync.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscription_identity.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "subscription_identity must not be empty".to_string(),
            ));
        }
        if self.topic_name.trim().is_empty() {
            return Err(ConfigError::Invalid("topic_name must not be empty".to_string()));
        }
        if self.transactions_max_buffer == Some(0) {
            return Err(ConfigError::Invalid(
                "transactions_max_buffer must be at least 1".to_string(),
            ));
        }
        if self.messaging.messaging_type == MessagingType::Pubsub
            && self.messaging.pubsub.project_id.is_empty()
        {
            return Err(ConfigError::Invalid(
                "messaging.pubsub.project_id is required for pubsub".to_string(),
            ));
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self {
            subscription_identity: "test-app".to_string(),
            ..Self::default()
        }
    }
}
