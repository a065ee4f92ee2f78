//! Inbound dispatch.
//!
//! Bindings declare which inbound routing reaches which local target and
//! how. They are collected in a [`RegistryBuilder`] at startup and frozen
//! into a read-only [`Registry`] the [`Processor`] consults per payload.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::payload::{DataMap, Payload};

mod processor;
mod target;

pub use processor::{BindingOutcome, BindingReport, ProcessError, ProcessReport, Processor};
pub use target::{HandlerError, SyncRecord, SyncTarget};

pub type GuardPredicate = Arc<dyn Fn(&Payload) -> bool + Send + Sync>;
pub type OperationCallback =
    Arc<dyn Fn(Payload) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// User-pluggable precondition.
#[derive(Clone)]
pub enum Guard {
    Predicate(GuardPredicate),
    /// Resolved through [`SyncTarget::check`].
    Named(String),
    /// Every named check must pass.
    AllOf(Vec<String>),
}

impl Guard {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Payload) -> bool + Send + Sync + 'static,
    {
        Guard::Predicate(Arc::new(f))
    }

    fn holds(&self, payload: &Payload, target: &dyn SyncTarget) -> bool {
        match self {
            Guard::Predicate(f) => f(payload),
            Guard::Named(name) => target.check(name, payload),
            Guard::AllOf(names) => names.iter().all(|name| target.check(name, payload)),
        }
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::Predicate(_) => f.write_str("Predicate(..)"),
            Guard::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Guard::AllOf(names) => f.debug_tuple("AllOf").field(names).finish(),
        }
    }
}

/// `if` / `unless` wrapper around a guard.
#[derive(Debug, Clone)]
pub enum GuardCondition {
    /// Must hold.
    If(Guard),
    /// Must not hold.
    Unless(Guard),
}

impl GuardCondition {
    fn passes(&self, payload: &Payload, target: &dyn SyncTarget) -> bool {
        match self {
            GuardCondition::If(guard) => guard.holds(payload, target),
            GuardCondition::Unless(guard) => !guard.holds(payload, target),
        }
    }
}

/// Whether a binding acts on the target as a whole or on one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingMode {
    Class,
    /// Records are located by these inbound fields.
    Instance { identifier_fields: Vec<String> },
}

/// What a binding runs.
#[derive(Clone, Default)]
pub enum TargetOperation {
    /// Derived from the target action: `create`/`update` persist, `destroy`
    /// removes, anything else is invoked by name.
    #[default]
    Default,
    Named(String),
    /// Receives the whole payload; bypasses the target.
    Callback(OperationCallback),
}

impl fmt::Debug for TargetOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetOperation::Default => f.write_str("Default"),
            TargetOperation::Named(name) => f.debug_tuple("Named").field(name).finish(),
            TargetOperation::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// Rule mapping inbound routing to a local operation. Immutable once built.
#[derive(Clone)]
pub struct Binding {
    source_type: String,
    source_action: String,
    target_type: String,
    target_action: String,
    mode: BindingMode,
    field_mapping: Vec<(String, String)>,
    guards: Vec<GuardCondition>,
    operation: TargetOperation,
    target: Arc<dyn SyncTarget>,
}

impl Binding {
    /// Class-level binding: the target is invoked with the mapped data.
    pub fn class(
        source_type: impl Into<String>,
        source_action: impl Into<String>,
        target: Arc<dyn SyncTarget>,
    ) -> Self {
        let source_type = source_type.into();
        let source_action = source_action.into();
        Self {
            target_type: source_type.clone(),
            target_action: source_action.clone(),
            source_type,
            source_action,
            mode: BindingMode::Class,
            field_mapping: Vec::new(),
            guards: Vec::new(),
            operation: TargetOperation::Default,
            target,
        }
    }

    /// Instance-level binding: a record located by `identifier_fields` is
    /// updated with the mapped data.
    pub fn instance<I, S>(
        source_type: impl Into<String>,
        source_action: impl Into<String>,
        identifier_fields: I,
        target: Arc<dyn SyncTarget>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut binding = Self::class(source_type, source_action, target);
        binding.mode = BindingMode::Instance {
            identifier_fields: identifier_fields.into_iter().map(Into::into).collect(),
        };
        binding
    }

    pub fn target_type(mut self, target_type: impl Into<String>) -> Self {
        self.target_type = target_type.into();
        self
    }

    pub fn target_action(mut self, target_action: impl Into<String>) -> Self {
        self.target_action = target_action.into();
        self
    }

    /// Copy inbound field `from` to local field `to`. Once any mapping is
    /// declared, unmapped fields are dropped.
    pub fn map_field(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.field_mapping.push((from.into(), to.into()));
        self
    }

    pub fn only_if(mut self, guard: Guard) -> Self {
        self.guards.push(GuardCondition::If(guard));
        self
    }

    pub fn unless(mut self, guard: Guard) -> Self {
        self.guards.push(GuardCondition::Unless(guard));
        self
    }

    pub fn operation(mut self, operation: TargetOperation) -> Self {
        self.operation = operation;
        self
    }

    pub fn callback<F>(self, callback: F) -> Self
    where
        F: Fn(Payload) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync + 'static,
    {
        self.operation(TargetOperation::Callback(Arc::new(callback)))
    }

    pub fn source_type(&self) -> &str {
        &self.source_type
    }

    pub fn source_action(&self) -> &str {
        &self.source_action
    }

    pub fn get_target_type(&self) -> &str {
        &self.target_type
    }

    pub fn get_target_action(&self) -> &str {
        &self.target_action
    }

    pub fn mode(&self) -> &BindingMode {
        &self.mode
    }

    pub fn target(&self) -> &Arc<dyn SyncTarget> {
        &self.target
    }

    /// `{targetType}#{targetAction}`, used in logs and errors.
    pub fn label(&self) -> String {
        format!("{}#{}", self.target_type, self.target_action)
    }

    pub fn matches(&self, payload: &Payload) -> bool {
        self.source_type == payload.subject_type() && self.source_action == payload.action()
    }

    /// Every `if` guard holds and no `unless` guard does.
    pub fn guards_pass(&self, payload: &Payload) -> bool {
        self.guards
            .iter()
            .all(|guard| guard.passes(payload, self.target.as_ref()))
    }

    /// Local field name for an inbound field, if it is carried over.
    fn local_name<'a>(&'a self, field: &'a str) -> Option<&'a str> {
        if self.field_mapping.is_empty() {
            return Some(field);
        }
        self.field_mapping
            .iter()
            .find(|(from, _)| from == field)
            .map(|(_, to)| to.as_str())
    }

    /// Inbound data translated to local names.
    pub fn mapped_data(&self, data: &DataMap) -> DataMap {
        self.map_excluding(data, &[])
    }

    fn map_excluding(&self, data: &DataMap, excluded: &[String]) -> DataMap {
        if self.field_mapping.is_empty() {
            return data
                .iter()
                .filter(|(key, _)| !excluded.contains(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
        }

        self.field_mapping
            .iter()
            .filter(|(from, _)| !excluded.contains(from))
            .filter_map(|(from, to)| data.get(from).map(|value| (to.clone(), value.clone())))
            .collect()
    }

    /// Identifier values present in `data`, keyed by local name.
    ///
    /// Fails with [`HandlerError::NoIdentifierValue`] when none is present.
    pub(crate) fn identifiers(
        &self,
        fields: &[String],
        data: &DataMap,
    ) -> Result<DataMap, HandlerError> {
        let identifiers: DataMap = fields
            .iter()
            .filter_map(|field| match data.get(field) {
                Some(Value::Null) | None => None,
                Some(value) => {
                    let name = self.local_name(field).unwrap_or(field);
                    Some((name.to_string(), value.clone()))
                }
            })
            .collect();

        if identifiers.is_empty() {
            return Err(HandlerError::NoIdentifierValue {
                fields: fields.to_vec(),
            });
        }
        Ok(identifiers)
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("source_type", &self.source_type)
            .field("source_action", &self.source_action)
            .field("target_type", &self.target_type)
            .field("target_action", &self.target_action)
            .field("mode", &self.mode)
            .field("field_mapping", &self.field_mapping)
            .field("guards", &self.guards)
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

/// Collects bindings at startup.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    bindings: Vec<Binding>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, binding: Binding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn build(self) -> Arc<Registry> {
        Arc::new(Registry {
            bindings: self.bindings,
        })
    }
}

/// Frozen set of bindings, in registration order.
#[derive(Debug)]
pub struct Registry {
    bindings: Vec<Binding>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Bindings whose source routing matches, in registration order.
    pub fn matching<'a>(&'a self, payload: &'a Payload) -> impl Iterator<Item = &'a Binding> + 'a {
        self.bindings.iter().filter(move |binding| binding.matches(payload))
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
