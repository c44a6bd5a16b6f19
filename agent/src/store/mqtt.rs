//! MQTT push subscriptions
//!
//! The control plane publishes every document as a retained message on
//! `signage/{collection}/{id}`: the payload is the whole JSON document and an
//! empty payload marks a deletion. Subscribing therefore yields the current
//! state first, then one message per change.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::AgentError;
use crate::store::{DeliveryKind, DocRef, SnapshotEvent, Subscription};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// MQTT broker address
#[derive(Debug, Clone)]
pub struct MqttAddress {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// Optional path to a PEM-encoded CA certificate for broker verification.
    /// When `None` and `use_tls` is `true`, the system certificate store is used.
    pub ca_cert_path: Option<String>,
}

impl Default for MqttAddress {
    fn default() -> Self {
        Self {
            host: "".to_string(),
            port: 8883,
            use_tls: true,
            ca_cert_path: None,
        }
    }
}

/// Topic carrying the snapshots of `doc`
pub fn topic_for(doc: &DocRef) -> String {
    format!("signage/{}/{}", doc.collection.as_str(), doc.id)
}

struct Route {
    id: u64,
    tx: mpsc::UnboundedSender<SnapshotEvent>,
    delivered: bool,
}

type Routes = Arc<Mutex<HashMap<String, Vec<Route>>>>;

fn lock_routes(routes: &Routes) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Route>>> {
    routes.lock().unwrap_or_else(|e| e.into_inner())
}

/// Shared MQTT connection fanning retained document snapshots out to
/// [`Subscription`]s
pub struct MqttSubscriber {
    client: AsyncClient,
    routes: Routes,
    next_route_id: AtomicU64,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSubscriber {
    /// Create the client and start driving its event loop
    pub fn connect(
        address: &MqttAddress,
        client_id: &str,
        username: &str,
        password: Option<&str>,
    ) -> Result<Self, AgentError> {
        if address.host.is_empty() {
            return Err(AgentError::MqttError("MQTT host is not configured".to_string()));
        }

        let mut options = MqttOptions::new(client_id, &address.host, address.port);
        options.set_keep_alive(std::time::Duration::from_secs(30));
        if let Some(password) = password {
            options.set_credentials(username, password);
        }

        if address.use_tls {
            use rumqttc::{TlsConfiguration, Transport};
            use rustls::ClientConfig;

            let mut root_cert_store = rustls::RootCertStore::empty();

            if let Some(ref ca_path) = address.ca_cert_path {
                let ca_pem = std::fs::read(ca_path)
                    .map_err(|e| AgentError::MqttError(format!("Failed to read CA cert {ca_path}: {e}")))?;
                let mut cursor = std::io::Cursor::new(ca_pem);
                for cert in rustls_pemfile::certs(&mut cursor).flatten() {
                    let _ = root_cert_store.add(cert);
                }
            } else {
                for cert in rustls_native_certs::load_native_certs().unwrap_or_default() {
                    let _ = root_cert_store.add(cert);
                }
            }

            let client_config = ClientConfig::builder()
                .with_root_certificates(root_cert_store)
                .with_no_client_auth();

            options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(client_config),
            )));
        }

        let (client, eventloop) = AsyncClient::new(options, 10);
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));

        let driver = tokio::spawn(drive(eventloop, client.clone(), routes.clone()));

        Ok(Self {
            client,
            routes,
            next_route_id: AtomicU64::new(0),
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Subscribe to the snapshots of one document
    pub async fn subscribe(&self, doc: &DocRef) -> Result<Subscription, AgentError> {
        let topic = topic_for(doc);
        let (tx, rx) = mpsc::unbounded_channel();
        let route_id = self.next_route_id.fetch_add(1, Ordering::SeqCst);

        lock_routes(&self.routes)
            .entry(topic.clone())
            .or_default()
            .push(Route {
                id: route_id,
                tx,
                delivered: false,
            });

        if let Err(e) = self.client.subscribe(&topic, QoS::AtLeastOnce).await {
            detach_route(&self.routes, &self.client, &topic, route_id);
            return Err(AgentError::MqttError(e.to_string()));
        }
        info!("Subscribed to: {}", topic);

        let routes = self.routes.clone();
        let client = self.client.clone();
        Ok(Subscription::new(doc.clone(), rx)
            .on_detach(move || detach_route(&routes, &client, &topic, route_id)))
    }

    /// Disconnect from the broker and stop the event loop
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect failed: {}", e);
        }
        let driver = self.driver.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(driver) = driver {
            driver.abort();
        }
        info!("MQTT disconnected");
    }
}

fn detach_route(routes: &Routes, client: &AsyncClient, topic: &str, route_id: u64) {
    let mut routes = lock_routes(routes);
    let Some(list) = routes.get_mut(topic) else {
        return;
    };
    list.retain(|route| route.id != route_id);
    if list.is_empty() {
        routes.remove(topic);
        if let Err(e) = client.try_unsubscribe(topic) {
            debug!("Unsubscribe from {} failed: {}", topic, e);
        }
    }
}

/// Decode a retained document payload
fn parse_payload(payload: &[u8]) -> Result<Option<Value>, serde_json::Error> {
    if payload.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(payload).map(Some)
}

fn route_publish(routes: &Routes, topic: &str, payload: &[u8]) {
    let mut routes = lock_routes(routes);
    let Some(list) = routes.get_mut(topic) else {
        debug!("Dropping message on unrouted topic {}", topic);
        return;
    };

    match parse_payload(payload) {
        Ok(document) => list.retain_mut(|route| {
            let kind = if route.delivered {
                DeliveryKind::Changed
            } else {
                DeliveryKind::Initial
            };
            route.delivered = true;
            route
                .tx
                .send(SnapshotEvent::Snapshot {
                    kind,
                    document: document.clone(),
                })
                .is_ok()
        }),
        Err(e) => {
            warn!("Invalid document on {}: {}", topic, e);
            list.retain(|route| {
                route
                    .tx
                    .send(SnapshotEvent::Error(format!("invalid document: {e}")))
                    .is_ok()
            });
        }
    }
}

fn broadcast_error(routes: &Routes, message: &str) {
    for list in lock_routes(routes).values_mut() {
        list.retain(|route| route.tx.send(SnapshotEvent::Error(message.to_string())).is_ok());
    }
}

/// Poll the event loop forever; rumqttc reconnects on the next poll after an
/// error, and subscriptions are restored once the broker acknowledges.
async fn drive(mut eventloop: EventLoop, client: AsyncClient, routes: Routes) {
    let backoff = CooldownOptions::default();
    let mut err_streak: u32 = 0;
    let mut connected_once = false;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!("Received message on topic: {}", publish.topic);
                route_publish(&routes, &publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT connected");
                err_streak = 0;
                if connected_once {
                    let topics: Vec<String> = lock_routes(&routes).keys().cloned().collect();
                    for topic in topics {
                        if let Err(e) = client.try_subscribe(&topic, QoS::AtLeastOnce) {
                            warn!("Resubscribe to {} failed: {}", topic, e);
                        }
                    }
                }
                connected_once = true;
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                debug!("Subscription acknowledged");
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                broadcast_error(&routes, &e.to_string());
                let delay = calc_exp_backoff(&backoff, err_streak.min(8));
                err_streak = err_streak.saturating_add(1);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
