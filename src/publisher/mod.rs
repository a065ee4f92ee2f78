//! Outbound publish pipeline.
//!
//! `publish` runs a payload through the before-publish hook and the cache
//! optimizer, then hands it to the broker under the retry policy. Failures
//! are isolated (error hook + log) unless the caller asks for strict mode.
//! Transactional publishing goes through [`Publisher::scope`].

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::bus::{Broker, BusError};
use crate::cache::{init_snapshot_store, CacheError, CacheOptimizer, Optimized, Outbound};
use crate::config::Config;
use crate::hooks::{ErrorReport, HookDecision, Hooks};
use crate::payload::{DataMap, Payload, PayloadError};
use crate::transaction::TransactionScope;
use crate::utils::retry::RetryPolicy;

/// Errors surfaced by strict publishing.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// What happened to a published payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted by the broker.
    Delivered,
    /// Held by a transaction until its root finishes.
    Buffered,
    /// Unchanged since the last delivery; no broker call.
    Suppressed,
    /// The before-publish hook cancelled it.
    Cancelled,
    /// Broker dispatch failed; reported through the error hook.
    Failed,
}

/// Result of the pre-dispatch stages.
#[derive(Debug)]
pub(crate) enum Prepared {
    Ready(Outbound),
    Cancelled,
    Suppressed,
}

/// Publisher settings derived from [`Config`].
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// Stamped as `appKey` on payloads that carry none.
    pub app_key: String,
    /// Destination when a payload names no topic.
    pub default_topic: String,
    /// Whether transactions buffer unless told otherwise.
    pub buffer_by_default: bool,
    /// Early-delivery threshold for a root transaction's buffer.
    pub max_buffer: Option<usize>,
}

impl PublisherSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            app_key: config.subscription_identity.clone(),
            default_topic: config.topic_name.clone(),
            buffer_by_default: config.buffer_transactions_by_default,
            max_buffer: config.transactions_max_buffer,
        }
    }
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Orchestrates hooks, optimization and broker dispatch.
pub struct Publisher {
    broker: Arc<dyn Broker>,
    hooks: Hooks,
    optimizer: CacheOptimizer,
    retry: RetryPolicy,
    settings: PublisherSettings,
}

impl Publisher {
    pub fn new(
        broker: Arc<dyn Broker>,
        hooks: Hooks,
        optimizer: CacheOptimizer,
        settings: PublisherSettings,
    ) -> Self {
        Self {
            broker,
            hooks,
            optimizer,
            retry: RetryPolicy::default(),
            settings,
        }
    }

    /// Build a publisher from configuration, initializing the snapshot store.
    pub async fn from_config(
        config: &Config,
        broker: Arc<dyn Broker>,
        hooks: Hooks,
    ) -> Result<Self, CacheError> {
        let store = init_snapshot_store(&config.cache).await?;
        let optimizer = CacheOptimizer::new(store, &config.cache, config.topic_name.clone());

        info!(
            app_key = %config.subscription_identity,
            default_topic = %config.topic_name,
            cache = optimizer.is_active(),
            "Publisher initialized"
        );

        Ok(Self::new(
            broker,
            hooks,
            optimizer,
            PublisherSettings::from_config(config),
        )
        .with_retry_policy(config.processing.retry_policy()))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn settings(&self) -> &PublisherSettings {
        &self.settings
    }

    /// Start a unit of work whose payloads can be buffered and rolled back.
    pub fn scope(&self) -> TransactionScope<'_> {
        TransactionScope::new(self)
    }

    /// Publish one payload outside any transaction.
    ///
    /// With `raise_on_error`, broker failures propagate instead of going to
    /// the error hook.
    pub async fn publish(
        &self,
        payload: Payload,
        raise_on_error: bool,
    ) -> Result<PublishOutcome, PublishError> {
        match self.prepare(payload).await {
            Prepared::Ready(outbound) => self.dispatch(&outbound, raise_on_error).await,
            Prepared::Cancelled => Ok(PublishOutcome::Cancelled),
            Prepared::Suppressed => Ok(PublishOutcome::Suppressed),
        }
    }

    pub async fn publish_strict(&self, payload: Payload) -> Result<PublishOutcome, PublishError> {
        self.publish(payload, true).await
    }

    /// Build a payload from routing parts and publish it.
    ///
    /// Construction errors propagate regardless of `raise_on_error`.
    pub async fn publish_routed(
        &self,
        subject_type: &str,
        data: DataMap,
        action: &str,
        raise_on_error: bool,
    ) -> Result<PublishOutcome, PublishError> {
        let payload = Payload::routed(subject_type, action, data)?;
        self.publish(payload, raise_on_error).await
    }

    /// App-key stamping, before-publish hook, cache optimizer.
    pub(crate) async fn prepare(&self, payload: Payload) -> Prepared {
        let payload = payload.stamped_with(&self.settings.app_key);

        if self.hooks.before_publish(&payload) == HookDecision::Cancel {
            info!(payload = %payload, "Publish cancelled by before-publish hook");
            return Prepared::Cancelled;
        }

        match self.optimizer.optimize(payload).await {
            Optimized::Deliver(outbound) => Prepared::Ready(outbound),
            Optimized::Suppressed => Prepared::Suppressed,
        }
    }

    /// Broker call under the retry policy, then exactly one outcome hook.
    ///
    /// The snapshot is committed only once the broker accepted the payload.
    pub(crate) async fn dispatch(
        &self,
        outbound: &Outbound,
        raise_on_error: bool,
    ) -> Result<PublishOutcome, PublishError> {
        let payload = outbound.payload();
        let attempted = self
            .retry
            .run(
                "publish",
                || self.broker.publish(payload),
                BusError::is_transient,
            )
            .await;

        match attempted.result {
            Ok(()) => {
                debug!(
                    payload = %payload,
                    attempts = attempted.attempts,
                    "Payload published"
                );
                if let Some(snapshot) = outbound.snapshot() {
                    self.optimizer.commit(snapshot).await;
                }
                self.hooks.after_publish(payload);
                Ok(PublishOutcome::Delivered)
            }
            Err(e) => {
                let e = PublishError::Bus(e);
                if raise_on_error {
                    return Err(e);
                }
                if self.hooks.error_publish(&e, payload) == ErrorReport::Log {
                    error!(
                        payload = %payload,
                        attempts = attempted.attempts,
                        error = %e,
                        "Failed to publish payload"
                    );
                }
                Ok(PublishOutcome::Failed)
            }
        }
    }
}
