//! Remote document store
//!
//! The agent follows two documents, its own record in `devices` and the
//! record of its group in `groups`. Everything it needs from the control
//! plane goes through [`DocumentStore`]: point reads, field updates and
//! change subscriptions delivering whole-document snapshots.

pub mod memory;
pub mod mqtt;
pub mod poll;
pub mod remote;
pub mod rest;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::errors::AgentError;

/// Collections the agent reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Devices,
    Groups,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Devices => "devices",
            Collection::Groups => "groups",
        }
    }
}

/// Reference to a single document
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocRef {
    pub collection: Collection,
    pub id: String,
}

impl DocRef {
    pub fn device(id: impl Into<String>) -> Self {
        Self {
            collection: Collection::Devices,
            id: id.into(),
        }
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self {
            collection: Collection::Groups,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for DocRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection.as_str(), self.id)
    }
}

/// Whether a delivery is the first snapshot of a subscription or a change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    Initial,
    Changed,
}

/// One delivery on a subscription
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotEvent {
    /// Full document contents; `None` when the document does not exist
    Snapshot {
        kind: DeliveryKind,
        document: Option<Value>,
    },

    /// The underlying transport failed; the subscription stays attached
    Error(String),
}

/// A live change subscription on one document.
///
/// Dropping the subscription detaches it from the store.
pub struct Subscription {
    doc: DocRef,
    rx: mpsc::UnboundedReceiver<SnapshotEvent>,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(doc: DocRef, rx: mpsc::UnboundedReceiver<SnapshotEvent>) -> Self {
        Self {
            doc,
            rx,
            detach: None,
        }
    }

    /// Run `detach` when the subscription is dropped
    pub fn on_detach(mut self, detach: impl FnOnce() + Send + 'static) -> Self {
        self.detach = Some(Box::new(detach));
        self
    }

    pub fn doc(&self) -> &DocRef {
        &self.doc
    }

    /// Next delivery, `None` once the store side has gone away
    pub async fn next(&mut self) -> Option<SnapshotEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

/// Narrow interface over the remote document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point read, `None` when the document does not exist
    async fn get(&self, doc: &DocRef) -> Result<Option<Value>, AgentError>;

    /// Overwrite the given top-level fields of an existing document
    async fn update(&self, doc: &DocRef, fields: Value) -> Result<(), AgentError>;

    /// Subscribe to whole-document snapshots. The first delivery is the
    /// current state; reconnection is handled by the implementation.
    async fn subscribe(&self, doc: &DocRef) -> Result<Subscription, AgentError>;

    /// Release connections held by the store
    async fn close(&self) {}
}
