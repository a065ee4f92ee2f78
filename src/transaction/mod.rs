//! Transaction buffering and ordering.
//!
//! A [`TransactionScope`] is the context of one unit of work. It owns an
//! arena of transaction nodes forming a tree and a pointer to the current
//! node. Payloads added to a buffering node wait until the root of the tree
//! finishes, then go to the broker in the order they were added:
//!
//! - a finished child hands its buffer to its parent, after anything the
//!   parent already holds;
//! - the root delivers once it is finished and has no pending children;
//! - rolling back any node discards its subtree and rolls back its ancestors,
//!   so nothing from that tree is delivered.
//!
//! Scopes borrow the [`Publisher`] and are not shared between tasks; give
//! each unit of work its own scope.

use std::fmt;

use tracing::{debug, info, warn};

use crate::cache::Outbound;
use crate::payload::{DataMap, Payload, PayloadError};
use crate::publisher::{Prepared, PublishOutcome, Publisher};

/// Index of a transaction inside its scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(usize);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// Lifecycle of a transaction node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting payloads.
    Open,
    /// Finished, waiting for pending children.
    Finished,
    /// Buffer handed to the parent or delivered.
    Released,
    /// Buffer discarded.
    RolledBack,
}

/// Options for a new transaction.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// Ordering key for every payload; inherited from the parent when unset.
    pub ordering_key: Option<String>,
    /// Whether to buffer; falls back to `buffer_transactions_by_default`.
    pub use_buffer: Option<bool>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    pub fn buffered(mut self, use_buffer: bool) -> Self {
        self.use_buffer = Some(use_buffer);
        self
    }
}

/// Errors raised by scope operations.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("Unknown transaction {0}")]
    Unknown(TransactionId),

    #[error("Transaction {id} is {state:?} and no longer accepts payloads")]
    NotOpen {
        id: TransactionId,
        state: TransactionState,
    },

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

#[derive(Debug)]
struct TransactionNode {
    ordering_key: Option<String>,
    use_buffer: bool,
    buffered: Vec<Outbound>,
    parent: Option<TransactionId>,
    children: Vec<TransactionId>,
    state: TransactionState,
}

impl TransactionNode {
    fn is_live(&self) -> bool {
        matches!(
            self.state,
            TransactionState::Open | TransactionState::Finished
        )
    }
}

/// Per-unit-of-work transaction context.
pub struct TransactionScope<'p> {
    publisher: &'p Publisher,
    nodes: Vec<TransactionNode>,
    current: Option<TransactionId>,
}

impl<'p> TransactionScope<'p> {
    pub fn new(publisher: &'p Publisher) -> Self {
        Self {
            publisher,
            nodes: Vec::new(),
            current: None,
        }
    }

    /// The transaction payloads published through the scope go to.
    pub fn current(&self) -> Option<TransactionId> {
        self.current
    }

    pub fn state(&self, id: TransactionId) -> Option<TransactionState> {
        self.nodes.get(id.0).map(|node| node.state)
    }

    /// Payloads held by a transaction.
    pub fn buffered_len(&self, id: TransactionId) -> usize {
        self.nodes.get(id.0).map_or(0, |node| node.buffered.len())
    }

    /// Ordering key payloads added to `id` receive.
    pub fn ordering_key(&self, id: TransactionId) -> Option<&str> {
        self.nodes.get(id.0)?.ordering_key.as_deref()
    }

    /// Begin a transaction nested under the current one (if any) and make
    /// it current.
    pub fn begin(&mut self, options: TransactionOptions) -> TransactionId {
        let id = self.create(options, self.current);
        self.current = Some(id);
        debug!(transaction = %id, parent = ?self.node(id).parent, "Transaction started");
        id
    }

    /// Attach a new child to `parent` without changing the current pointer.
    pub fn add_child_transaction(
        &mut self,
        parent: TransactionId,
        options: TransactionOptions,
    ) -> Result<TransactionId, TransactionError> {
        let state = self.try_node(parent)?.state;
        if state != TransactionState::Open {
            return Err(TransactionError::NotOpen { id: parent, state });
        }
        Ok(self.create(options, Some(parent)))
    }

    /// Publish through the scope: hooks and optimizer first, then the current
    /// transaction, or the broker when no transaction is active.
    pub async fn publish(&mut self, payload: Payload) -> Result<PublishOutcome, TransactionError> {
        let outbound = match self.publisher.prepare(payload).await {
            Prepared::Ready(outbound) => outbound,
            Prepared::Cancelled => return Ok(PublishOutcome::Cancelled),
            Prepared::Suppressed => return Ok(PublishOutcome::Suppressed),
        };

        match self.current {
            Some(id) => self.add_payload(id, outbound).await,
            None => Ok(self.deliver(&outbound).await),
        }
    }

    /// Build a payload from routing parts and publish it through the scope.
    pub async fn publish_routed(
        &mut self,
        subject_type: &str,
        data: DataMap,
        action: &str,
    ) -> Result<PublishOutcome, TransactionError> {
        let payload = Payload::routed(subject_type, action, data)?;
        self.publish(payload).await
    }

    /// Add an already prepared payload to a transaction.
    ///
    /// A finished transaction still accepts payloads until it is released;
    /// they go out with the rest of its buffer. Unbuffered transactions
    /// deliver immediately; such payloads cannot be rolled back.
    pub async fn add_payload(
        &mut self,
        id: TransactionId,
        outbound: impl Into<Outbound>,
    ) -> Result<PublishOutcome, TransactionError> {
        let outbound = outbound.into();
        let node = self.try_node(id)?;
        if !node.is_live() {
            return Err(TransactionError::NotOpen {
                id,
                state: node.state,
            });
        }

        let payload = outbound.payload();
        let key = payload
            .forced_ordering_key()
            .or(node.ordering_key.as_deref())
            .filter(|key| *key != payload.ordering_key())
            .map(str::to_string);
        let outbound = match key {
            Some(key) => outbound.map_payload(|payload| payload.with_ordering_key(key)),
            None => outbound,
        };

        if !node.use_buffer {
            return Ok(self.deliver(&outbound).await);
        }

        debug!(transaction = %id, payload = %outbound.payload(), "Payload buffered");
        self.node_mut(id).buffered.push(outbound);
        self.deliver_if_full(id).await;
        Ok(PublishOutcome::Buffered)
    }

    /// Commit a transaction.
    ///
    /// Finishing a rolled-back or already finished transaction is a no-op.
    pub async fn finish(&mut self, id: TransactionId) -> Result<(), TransactionError> {
        let node = self.try_node(id)?;
        match node.state {
            TransactionState::Open => {}
            TransactionState::RolledBack => {
                warn!(transaction = %id, "Finish on rolled back transaction ignored");
                return Ok(());
            }
            state => {
                warn!(transaction = %id, state = ?state, "Transaction already finished");
                return Ok(());
            }
        }

        let parent = node.parent;
        let has_children = !node.children.is_empty();
        self.node_mut(id).state = TransactionState::Finished;

        if self.current == Some(id) && !has_children {
            self.current = parent;
        }

        self.settle(id).await;
        Ok(())
    }

    /// Abort a transaction, its subtree and its ancestors.
    ///
    /// Buffered payloads are discarded; payloads already delivered (unbuffered
    /// transactions, early delivery) stay delivered.
    pub fn rollback(&mut self, id: TransactionId) -> Result<(), TransactionError> {
        let node = self.try_node(id)?;
        if !node.is_live() {
            warn!(transaction = %id, state = ?node.state, "Rollback on settled transaction ignored");
            return Ok(());
        }

        let mut next = Some(id);
        while let Some(id) = next {
            let discarded = self.discard_subtree(id);
            info!(transaction = %id, discarded, "Transaction rolled back");

            next = self
                .node(id)
                .parent
                .filter(|parent| self.node(*parent).is_live());
        }

        self.current = None;
        Ok(())
    }

    /// Walk upward from a finished node, merging buffers into parents until a
    /// node with pending children or the root is reached.
    async fn settle(&mut self, id: TransactionId) {
        let mut id = id;

        loop {
            let node = self.node(id);
            if node.state != TransactionState::Finished || !node.children.is_empty() {
                return;
            }

            let parent = node.parent.filter(|parent| self.node(*parent).is_live());
            match parent {
                Some(parent) => {
                    let buffered = std::mem::take(&mut self.node_mut(id).buffered);
                    self.node_mut(id).state = TransactionState::Released;

                    let parent_node = self.node_mut(parent);
                    parent_node.children.retain(|child| *child != id);
                    parent_node.buffered.extend(buffered);

                    debug!(transaction = %id, parent = %parent, "Child transaction merged into parent");
                    id = parent;
                }
                None => {
                    self.release(id).await;
                    self.current = None;
                    return;
                }
            }
        }
    }

    /// Deliver a root's buffer in FIFO order, isolating failures.
    async fn release(&mut self, id: TransactionId) {
        let buffered = std::mem::take(&mut self.node_mut(id).buffered);
        self.node_mut(id).state = TransactionState::Released;

        info!(transaction = %id, count = buffered.len(), "Releasing transaction");

        for outbound in &buffered {
            self.deliver(outbound).await;
        }
    }

    async fn deliver_if_full(&mut self, id: TransactionId) {
        let Some(max) = self.publisher.settings().max_buffer else {
            return;
        };

        let node = self.node(id);
        if node.parent.is_some() || node.buffered.len() < max {
            return;
        }

        let buffered = std::mem::take(&mut self.node_mut(id).buffered);
        info!(transaction = %id, count = buffered.len(), "Buffer limit reached, delivering early");

        for outbound in &buffered {
            self.deliver(outbound).await;
        }
    }

    async fn deliver(&self, outbound: &Outbound) -> PublishOutcome {
        // Non-strict dispatch reports failures itself and never errors.
        self.publisher
            .dispatch(outbound, false)
            .await
            .unwrap_or(PublishOutcome::Failed)
    }

    fn discard_subtree(&mut self, root: TransactionId) -> usize {
        let mut discarded = 0;
        let mut stack = vec![root];

        while let Some(id) = stack.pop() {
            let node = self.node_mut(id);
            if !node.is_live() {
                continue;
            }
            discarded += node.buffered.len();
            node.buffered.clear();
            node.state = TransactionState::RolledBack;
            stack.extend(node.children.drain(..));
        }

        discarded
    }

    fn create(&mut self, options: TransactionOptions, parent: Option<TransactionId>) -> TransactionId {
        let id = TransactionId(self.nodes.len());
        let ordering_key = options
            .ordering_key
            .or_else(|| parent.and_then(|p| self.node(p).ordering_key.clone()));

        self.nodes.push(TransactionNode {
            ordering_key,
            use_buffer: options
                .use_buffer
                .unwrap_or(self.publisher.settings().buffer_by_default),
            buffered: Vec::new(),
            parent,
            children: Vec::new(),
            state: TransactionState::Open,
        });

        if let Some(parent) = parent {
            self.node_mut(parent).children.push(id);
        }
        id
    }

    fn try_node(&self, id: TransactionId) -> Result<&TransactionNode, TransactionError> {
        self.nodes.get(id.0).ok_or(TransactionError::Unknown(id))
    }

    // Ids are only minted by this scope, so indexing cannot go out of bounds.
    fn node(&self, id: TransactionId) -> &TransactionNode {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: TransactionId) -> &mut TransactionNode {
        &mut self.nodes[id.0]
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        let pending: usize = self
            .nodes
            .iter()
            .filter(|node| node.is_live())
            .map(|node| node.buffered.len())
            .sum();

        if pending > 0 {
            warn!(pending, "Transaction scope dropped with unreleased payloads");
        }
    }
}

#[cfg(test)]
mod tests;
