//! In-process document store
//!
//! Backs the agent in tests and offline runs. Writes through [`MemoryStore::put`]
//! play the role of the control plane; writes through [`DocumentStore::update`]
//! are the agent's own and are recorded for inspection.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::errors::AgentError;
use crate::store::{DeliveryKind, DocRef, DocumentStore, SnapshotEvent, Subscription};

#[derive(Default)]
struct Inner {
    documents: HashMap<DocRef, Value>,
    subscribers: HashMap<DocRef, Vec<mpsc::UnboundedSender<SnapshotEvent>>>,
    updates: Vec<(DocRef, Value)>,
    fail_updates: bool,
}

impl Inner {
    fn notify(&mut self, doc: &DocRef, event: SnapshotEvent) {
        if let Some(senders) = self.subscribers.get_mut(doc) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

/// Document store held entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace a whole document, notifying subscribers
    pub fn put(&self, doc: &DocRef, document: Value) {
        let mut inner = self.lock();
        inner.documents.insert(doc.clone(), document.clone());
        inner.notify(
            doc,
            SnapshotEvent::Snapshot {
                kind: DeliveryKind::Changed,
                document: Some(document),
            },
        );
    }

    /// Delete a document, notifying subscribers
    pub fn remove(&self, doc: &DocRef) {
        let mut inner = self.lock();
        inner.documents.remove(doc);
        inner.notify(
            doc,
            SnapshotEvent::Snapshot {
                kind: DeliveryKind::Changed,
                document: None,
            },
        );
    }

    /// Deliver a transport error to the subscribers of `doc`
    pub fn fail_subscribers(&self, doc: &DocRef, message: &str) {
        self.lock()
            .notify(doc, SnapshotEvent::Error(message.to_string()));
    }

    /// Make every subsequent [`DocumentStore::update`] fail
    pub fn set_fail_updates(&self, fail: bool) {
        self.lock().fail_updates = fail;
    }

    /// Current contents of a document
    pub fn document(&self, doc: &DocRef) -> Option<Value> {
        self.lock().documents.get(doc).cloned()
    }

    /// Field updates issued through [`DocumentStore::update`], oldest first
    pub fn updates(&self) -> Vec<(DocRef, Value)> {
        self.lock().updates.clone()
    }

    /// Live subscriptions on a document
    pub fn subscriber_count(&self, doc: &DocRef) -> usize {
        let mut inner = self.lock();
        match inner.subscribers.get_mut(doc) {
            Some(senders) => {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            }
            None => 0,
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, doc: &DocRef) -> Result<Option<Value>, AgentError> {
        Ok(self.document(doc))
    }

    async fn update(&self, doc: &DocRef, fields: Value) -> Result<(), AgentError> {
        let mut inner = self.lock();
        if inner.fail_updates {
            return Err(AgentError::StoreError(format!("update of {doc} rejected")));
        }

        let Value::Object(fields) = fields else {
            return Err(AgentError::StoreError("update fields must be an object".to_string()));
        };

        let updated = {
            let Some(Value::Object(document)) = inner.documents.get_mut(doc) else {
                return Err(AgentError::NotFound(doc.to_string()));
            };
            for (key, value) in fields.iter() {
                document.insert(key.clone(), value.clone());
            }
            Value::Object(document.clone())
        };

        inner.updates.push((doc.clone(), Value::Object(fields)));
        inner.notify(
            doc,
            SnapshotEvent::Snapshot {
                kind: DeliveryKind::Changed,
                document: Some(updated),
            },
        );
        Ok(())
    }

    async fn subscribe(&self, doc: &DocRef) -> Result<Subscription, AgentError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();

        let current = inner.documents.get(doc).cloned();
        let _ = tx.send(SnapshotEvent::Snapshot {
            kind: DeliveryKind::Initial,
            document: current,
        });
        inner.subscribers.entry(doc.clone()).or_default().push(tx);

        Ok(Subscription::new(doc.clone(), rx))
    }
}
