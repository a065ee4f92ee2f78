//! Pubsync - change-notification sync over message brokers
//!
//! Publishes model-change notifications with transactional buffering,
//! ordering keys and delta suppression, and applies inbound notifications
//! to local targets through declared bindings.

pub mod bus;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod hooks;
pub mod listener;
pub mod payload;
pub mod publisher;
pub mod transaction;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub use bus::{Broker, BusError};
pub use config::Config;
pub use dispatch::{Binding, Guard, HandlerError, Processor, Registry, SyncRecord, SyncTarget};
pub use hooks::{ErrorReport, HookDecision, Hooks};
pub use listener::Listener;
pub use payload::{DataMap, Headers, Payload, PayloadError, Routing};
pub use publisher::{PublishError, PublishOutcome, Publisher};
pub use transaction::{TransactionId, TransactionOptions, TransactionScope};
