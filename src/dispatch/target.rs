//! Local handler traits.
//!
//! A [`SyncTarget`] is the local side of a binding: the thing inbound
//! notifications change. Class-level bindings call [`SyncTarget::invoke`];
//! instance-level bindings [`SyncTarget::locate`] a [`SyncRecord`], assign
//! mapped attributes and persist, remove or invoke on it.

use std::time::Duration;

use async_trait::async_trait;

use crate::hooks::HookDecision;
use crate::payload::{DataMap, Payload};

/// Errors raised while executing a binding.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
    /// Retry-eligible (resource exhaustion, lock contention).
    #[error("Transient handler failure: {0}")]
    Transient(String),

    #[error("Handler failed: {0}")]
    Fatal(String),

    /// The target rejected the data.
    #[error("Target validation failed: {}", .0.join(", "))]
    Validation(Vec<String>),

    /// None of the identifier fields carried a value.
    #[error("No identifier value for fields [{}]", .fields.join(", "))]
    NoIdentifierValue { fields: Vec<String> },

    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

/// Local counterpart of a binding.
#[async_trait]
pub trait SyncTarget: Send + Sync {
    /// Run a class-level operation with the mapped data.
    async fn invoke(&self, operation: &str, data: &DataMap) -> Result<(), HandlerError> {
        let _ = data;
        Err(HandlerError::Fatal(format!(
            "operation '{}' not supported",
            operation
        )))
    }

    /// Find the record matching `identifiers`, or a new one carrying them.
    async fn locate(&self, identifiers: &DataMap) -> Result<Box<dyn SyncRecord>, HandlerError> {
        let _ = identifiers;
        Err(HandlerError::Fatal(
            "instance-level sync not supported".to_string(),
        ))
    }

    /// Resolve a named guard.
    fn check(&self, name: &str, payload: &Payload) -> bool {
        let _ = (name, payload);
        false
    }
}

/// One local record touched by an instance-level binding.
#[async_trait]
pub trait SyncRecord: Send {
    /// Apply mapped inbound attributes.
    fn assign(&mut self, attributes: DataMap);

    /// Last word before the operation runs.
    fn before_save(&mut self, payload: &Payload) -> HookDecision {
        let _ = payload;
        HookDecision::Proceed
    }

    /// Create or update the record.
    async fn persist(&mut self) -> Result<(), HandlerError>;

    /// Delete the record.
    async fn remove(&mut self) -> Result<(), HandlerError>;

    /// Run a named operation on the record.
    async fn invoke(&mut self, operation: &str, data: &DataMap) -> Result<(), HandlerError> {
        let _ = data;
        Err(HandlerError::Fatal(format!(
            "operation '{}' not supported",
            operation
        )))
    }

    /// Validation messages left by the last operation.
    fn validation_errors(&self) -> Vec<String> {
        Vec::new()
    }
}
