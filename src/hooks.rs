//! Lifecycle hooks for publishing and processing.
//!
//! Hooks are plain function values collected once at startup and handed to
//! the [`Publisher`](crate::publisher::Publisher) and
//! [`Processor`](crate::dispatch::Processor) constructors. Every hook is
//! optional; an absent hook behaves as "proceed" / "log".

use std::fmt;
use std::sync::Arc;

use crate::dispatch::{Binding, HandlerError};
use crate::payload::Payload;
use crate::publisher::PublishError;

/// Answer of a `before` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookDecision {
    #[default]
    Proceed,
    /// Skip this publish/binding. Not an error.
    Cancel,
}

/// Answer of an error hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorReport {
    #[default]
    Log,
    /// The hook handled reporting itself; do not log the error again.
    SkipLog,
}

pub type BeforePublishHook = Arc<dyn Fn(&Payload) -> HookDecision + Send + Sync>;
pub type AfterPublishHook = Arc<dyn Fn(&Payload) + Send + Sync>;
pub type PublishErrorHook = Arc<dyn Fn(&PublishError, &Payload) -> ErrorReport + Send + Sync>;
pub type BeforeProcessingHook = Arc<dyn Fn(&Payload, &Binding) -> HookDecision + Send + Sync>;
pub type ProcessingSuccessHook = Arc<dyn Fn(&Payload, &Binding) + Send + Sync>;
pub type ProcessingErrorHook =
    Arc<dyn Fn(&HandlerError, &Payload, &Binding) -> ErrorReport + Send + Sync>;

/// Cross-cutting callbacks for the publish and process pipelines.
#[derive(Clone, Default)]
pub struct Hooks {
    before_publish: Option<BeforePublishHook>,
    after_publish: Option<AfterPublishHook>,
    error_publish: Option<PublishErrorHook>,
    before_processing: Option<BeforeProcessingHook>,
    success_processing: Option<ProcessingSuccessHook>,
    error_processing: Option<ProcessingErrorHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_before_publish<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Payload) -> HookDecision + Send + Sync + 'static,
    {
        self.before_publish = Some(Arc::new(hook));
        self
    }

    pub fn on_after_publish<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Payload) + Send + Sync + 'static,
    {
        self.after_publish = Some(Arc::new(hook));
        self
    }

    pub fn on_error_publish<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PublishError, &Payload) -> ErrorReport + Send + Sync + 'static,
    {
        self.error_publish = Some(Arc::new(hook));
        self
    }

    pub fn on_before_processing<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Payload, &Binding) -> HookDecision + Send + Sync + 'static,
    {
        self.before_processing = Some(Arc::new(hook));
        self
    }

    pub fn on_success_processing<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Payload, &Binding) + Send + Sync + 'static,
    {
        self.success_processing = Some(Arc::new(hook));
        self
    }

    pub fn on_error_processing<F>(mut self, hook: F) -> Self
    where
        F: Fn(&HandlerError, &Payload, &Binding) -> ErrorReport + Send + Sync + 'static,
    {
        self.error_processing = Some(Arc::new(hook));
        self
    }

    pub(crate) fn before_publish(&self, payload: &Payload) -> HookDecision {
        self.before_publish
            .as_ref()
            .map(|hook| hook(payload))
            .unwrap_or_default()
    }

    pub(crate) fn after_publish(&self, payload: &Payload) {
        if let Some(hook) = &self.after_publish {
            hook(payload);
        }
    }

    pub(crate) fn error_publish(&self, error: &PublishError, payload: &Payload) -> ErrorReport {
        self.error_publish
            .as_ref()
            .map(|hook| hook(error, payload))
            .unwrap_or_default()
    }

    pub(crate) fn before_processing(&self, payload: &Payload, binding: &Binding) -> HookDecision {
        self.before_processing
            .as_ref()
            .map(|hook| hook(payload, binding))
            .unwrap_or_default()
    }

    pub(crate) fn success_processing(&self, payload: &Payload, binding: &Binding) {
        if let Some(hook) = &self.success_processing {
            hook(payload, binding);
        }
    }

    pub(crate) fn error_processing(
        &self,
        error: &HandlerError,
        payload: &Payload,
        binding: &Binding,
    ) -> ErrorReport {
        self.error_processing
            .as_ref()
            .map(|hook| hook(error, payload, binding))
            .unwrap_or_default()
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before_publish", &self.before_publish.is_some())
            .field("after_publish", &self.after_publish.is_some())
            .field("error_publish", &self.error_publish.is_some())
            .field("before_processing", &self.before_processing.is_some())
            .field("success_processing", &self.success_processing.is_some())
            .field("error_processing", &self.error_processing.is_some())
            .finish()
    }
}
