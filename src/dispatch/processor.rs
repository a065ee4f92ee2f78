//! Binding execution.
//!
//! For every binding matching an inbound payload the processor runs the
//! before-processing hook, the guards, then the target operation under the
//! retry policy, and reports each outcome to the success or error hook.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use super::{Binding, BindingMode, HandlerError, Registry, TargetOperation};
use crate::config::ProcessingConfig;
use crate::hooks::{ErrorReport, HookDecision, Hooks};
use crate::payload::Payload;
use crate::utils::retry::RetryPolicy;

/// First terminal failure, raised in strict mode.
#[derive(Debug, thiserror::Error)]
#[error("Binding {binding} failed: {source}")]
pub struct ProcessError {
    /// Label of the failing binding (`{targetType}#{targetAction}`).
    pub binding: String,
    pub source: HandlerError,
}

/// What happened to one matched binding.
#[derive(Debug, Clone, PartialEq)]
pub enum BindingOutcome {
    /// A hook (before-processing or before-save) cancelled it.
    Cancelled,
    /// A guard did not pass.
    Skipped,
    Succeeded { attempts: usize },
    Failed { attempts: usize, error: HandlerError },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindingReport {
    pub binding: String,
    pub outcome: BindingOutcome,
}

/// Outcomes of every matched binding, in registration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessReport {
    pub bindings: Vec<BindingReport>,
}

impl ProcessReport {
    pub fn matched(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|outcome| matches!(outcome, BindingOutcome::Succeeded { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, BindingOutcome::Failed { .. }))
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &BindingOutcome> {
        self.bindings.iter().map(|report| &report.outcome)
    }

    fn count(&self, predicate: impl Fn(&BindingOutcome) -> bool) -> usize {
        self.outcomes().filter(|outcome| predicate(outcome)).count()
    }
}

enum Executed {
    Done,
    Cancelled,
}

/// Matches inbound payloads against the registry and runs the bindings.
pub struct Processor {
    registry: Arc<Registry>,
    hooks: Hooks,
    retry: RetryPolicy,
    handler_timeout: Option<Duration>,
}

impl Processor {
    pub fn new(registry: Arc<Registry>, hooks: Hooks) -> Self {
        Self {
            registry,
            hooks,
            retry: RetryPolicy::default(),
            handler_timeout: None,
        }
    }

    pub fn from_config(registry: Arc<Registry>, hooks: Hooks, config: &ProcessingConfig) -> Self {
        Self {
            registry,
            hooks,
            retry: config.retry_policy(),
            handler_timeout: config.handler_timeout(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bound every handler attempt. Exceeding it is a terminal failure.
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run every binding matching `payload`.
    ///
    /// Failures are isolated per binding unless `raise_on_error` is set, in
    /// which case the first terminal failure stops processing and is returned.
    #[tracing::instrument(
        name = "dispatch.process",
        skip_all,
        fields(subject_type = %payload.subject_type(), action = %payload.action())
    )]
    pub async fn process(
        &self,
        payload: &Payload,
        raise_on_error: bool,
    ) -> Result<ProcessReport, ProcessError> {
        let mut report = ProcessReport::default();

        for binding in self.registry.matching(payload) {
            let outcome = self.run_binding(binding, payload, raise_on_error).await;

            if raise_on_error {
                if let BindingOutcome::Failed { error, .. } = outcome {
                    return Err(ProcessError {
                        binding: binding.label(),
                        source: error,
                    });
                }
            }

            report.bindings.push(BindingReport {
                binding: binding.label(),
                outcome,
            });
        }

        if report.is_empty() {
            debug!(payload = %payload, "No binding matched");
        }
        Ok(report)
    }

    async fn run_binding(
        &self,
        binding: &Binding,
        payload: &Payload,
        raise_on_error: bool,
    ) -> BindingOutcome {
        let label = binding.label();

        if self.hooks.before_processing(payload, binding) == HookDecision::Cancel {
            debug!(binding = %label, payload = %payload, "Processing cancelled by hook");
            return BindingOutcome::Cancelled;
        }

        if !binding.guards_pass(payload) {
            debug!(binding = %label, payload = %payload, "Guard rejected payload");
            return BindingOutcome::Skipped;
        }

        let attempted = self
            .retry
            .run(
                "process",
                || self.attempt(binding, payload),
                HandlerError::is_transient,
            )
            .await;

        match attempted.result {
            Ok(Executed::Done) => {
                debug!(binding = %label, attempts = attempted.attempts, "Binding processed");
                self.hooks.success_processing(payload, binding);
                BindingOutcome::Succeeded {
                    attempts: attempted.attempts,
                }
            }
            Ok(Executed::Cancelled) => {
                info!(binding = %label, payload = %payload, "Save cancelled by record hook");
                BindingOutcome::Cancelled
            }
            Err(e) => {
                if !raise_on_error
                    && self.hooks.error_processing(&e, payload, binding) == ErrorReport::Log
                {
                    error!(
                        binding = %label,
                        payload = %payload,
                        attempts = attempted.attempts,
                        error = %e,
                        "Failed to process payload"
                    );
                }
                BindingOutcome::Failed {
                    attempts: attempted.attempts,
                    error: e,
                }
            }
        }
    }

    async fn attempt(&self, binding: &Binding, payload: &Payload) -> Result<Executed, HandlerError> {
        match self.handler_timeout {
            Some(limit) => tokio::time::timeout(limit, execute(binding, payload))
                .await
                .unwrap_or(Err(HandlerError::Timeout(limit))),
            None => execute(binding, payload).await,
        }
    }
}

/// One attempt at a binding's operation.
async fn execute(binding: &Binding, payload: &Payload) -> Result<Executed, HandlerError> {
    let operation = match &binding.operation {
        TargetOperation::Callback(callback) => {
            callback(payload.clone()).await?;
            return Ok(Executed::Done);
        }
        TargetOperation::Named(name) => name.as_str(),
        TargetOperation::Default => binding.get_target_action(),
    };

    let identifier_fields = match binding.mode() {
        BindingMode::Class => {
            let data = binding.mapped_data(payload.data());
            binding.target().invoke(operation, &data).await?;
            return Ok(Executed::Done);
        }
        BindingMode::Instance { identifier_fields } => identifier_fields,
    };

    let identifiers = binding.identifiers(identifier_fields, payload.data())?;
    let mut record = binding.target().locate(&identifiers).await?;
    let data = binding.map_excluding(payload.data(), identifier_fields);

    record.assign(data.clone());
    if record.before_save(payload) == HookDecision::Cancel {
        return Ok(Executed::Cancelled);
    }

    match operation {
        "create" | "update" => record.persist().await?,
        "destroy" => record.remove().await?,
        other => record.invoke(other, &data).await?,
    }

    let errors = record.validation_errors();
    if !errors.is_empty() {
        return Err(HandlerError::Validation(errors));
    }
    Ok(Executed::Done)
}
