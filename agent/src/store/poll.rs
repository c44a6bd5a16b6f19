//! Polling subscriptions
//!
//! Used when no push channel is configured: the document is re-read on a
//! fixed interval and delivered whenever its contents change.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::store::rest::RestStore;
use crate::store::{DeliveryKind, DocRef, SnapshotEvent, Subscription};

/// Start polling `doc` every `interval`
pub fn subscribe(rest: Arc<RestStore>, doc: DocRef, interval: Duration) -> Subscription {
    let (tx, rx) = mpsc::unbounded_channel();
    let task_doc = doc.clone();

    let handle = tokio::spawn(async move {
        let mut last: Option<Option<Value>> = None;

        loop {
            let event = match rest.get_document(&task_doc).await {
                Ok(document) => {
                    let kind = match &last {
                        None => Some(DeliveryKind::Initial),
                        Some(previous) if *previous != document => Some(DeliveryKind::Changed),
                        Some(_) => None,
                    };
                    last = Some(document.clone());
                    kind.map(|kind| SnapshotEvent::Snapshot { kind, document })
                }
                Err(e) => {
                    warn!("Polling {} failed: {}", task_doc, e);
                    Some(SnapshotEvent::Error(e.to_string()))
                }
            };

            if let Some(event) = event {
                if tx.send(event).is_err() {
                    debug!("Poll subscription on {} dropped", task_doc);
                    return;
                }
            }

            tokio::time::sleep(interval).await;
        }
    });

    Subscription::new(doc, rx).on_detach(move || handle.abort())
}
