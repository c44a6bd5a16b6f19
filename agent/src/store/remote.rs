//! Production document store: REST reads and writes, MQTT or polling
//! subscriptions

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::errors::AgentError;
use crate::store::mqtt::MqttSubscriber;
use crate::store::rest::RestStore;
use crate::store::{poll, DocRef, DocumentStore, Subscription};

/// Document store backed by the control plane
pub struct RemoteStore {
    rest: Arc<RestStore>,
    push: Option<MqttSubscriber>,
    poll_interval: Duration,
}

impl RemoteStore {
    /// Subscriptions use MQTT when `push` is set, polling otherwise
    pub fn new(rest: RestStore, push: Option<MqttSubscriber>, poll_interval: Duration) -> Self {
        match &push {
            Some(_) => info!("Document subscriptions use MQTT push"),
            None => info!("Document subscriptions poll every {:?}", poll_interval),
        }
        Self {
            rest: Arc::new(rest),
            push,
            poll_interval,
        }
    }
}

#[async_trait]
impl DocumentStore for RemoteStore {
    async fn get(&self, doc: &DocRef) -> Result<Option<Value>, AgentError> {
        self.rest.get_document(doc).await
    }

    async fn update(&self, doc: &DocRef, fields: Value) -> Result<(), AgentError> {
        self.rest.patch_document(doc, &fields).await
    }

    async fn subscribe(&self, doc: &DocRef) -> Result<Subscription, AgentError> {
        match &self.push {
            Some(push) => push.subscribe(doc).await,
            None => Ok(poll::subscribe(
                self.rest.clone(),
                doc.clone(),
                self.poll_interval,
            )),
        }
    }

    async fn close(&self) {
        if let Some(push) = &self.push {
            push.disconnect().await;
        }
    }
}
