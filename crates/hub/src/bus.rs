//! In-process message bus.
//!
//! Devices, sensor adapters and the uplink bridge connect as authenticated
//! clients; the controller publishes through the hub-side [`Publisher`].
//! Every accepted publish passes through `on_publish` before fan-out, which
//! is where `<device>/state` telemetry is merged into the store.
//!
//! Topics:
//! - `<device>/state`                   telemetry, merged into the store
//! - `<device>/cmd/<relay>/<on|off>`    relay commands, never merged

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::error::BusError;
use crate::state::SharedState;
use crate::store::{DeviceReport, RelayState, Store};

/// Messages buffered per subscriber before it starts lagging.
const CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Publisher seam
// ---------------------------------------------------------------------------

/// Anything the controller can hand a command to.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Resolves once the bus has accepted the message for delivery.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError>;
}

// ---------------------------------------------------------------------------
// Messages & topics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Client id of the publisher, `None` for hub-originated messages.
    pub origin: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic<'a> {
    State {
        device: &'a str,
    },
    Command {
        device: &'a str,
        relay: &'a str,
        state: RelayState,
    },
    Other,
}

impl<'a> Topic<'a> {
    /// Classify by topic name alone; payload shape is never consulted.
    pub fn classify(topic: &'a str) -> Self {
        let parts: Vec<&str> = topic.split('/').collect();
        match *parts.as_slice() {
            [device, "state"] if !device.is_empty() => Topic::State { device },
            [device, "cmd", relay, state] if !device.is_empty() && !relay.is_empty() => {
                match RelayState::parse(state) {
                    Some(state) => Topic::Command {
                        device,
                        relay,
                        state,
                    },
                    None => Topic::Other,
                }
            }
            _ => Topic::Other,
        }
    }
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// The single shared username/password pair. Clients send the password
/// base64-encoded.
#[derive(Debug, Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<(), BusError> {
        let ok = match (username, password) {
            (Some(user), Some(encoded)) => {
                user == self.username
                    && STANDARD
                        .decode(encoded)
                        .is_ok_and(|decoded| decoded == self.password.as_bytes())
            }
            _ => false,
        };

        if ok {
            Ok(())
        } else {
            warn!(client = %client_id, "bus: authentication failed");
            Err(BusError::AuthFailure {
                client_id: client_id.to_string(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

pub struct Broker {
    credentials: Credentials,
    store: Arc<dyn Store>,
    shared: SharedState,
    sender: broadcast::Sender<Message>,
    closed: watch::Sender<bool>,
}

impl Broker {
    pub fn new(credentials: Credentials, store: Arc<dyn Store>, shared: SharedState) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (closed, _) = watch::channel(false);
        Self {
            credentials,
            store,
            shared,
            sender,
            closed,
        }
    }

    /// Authenticate a client and open a session for it. A rejected client
    /// gets no session and so can neither publish nor subscribe.
    pub fn connect(
        self: &Arc<Self>,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<ClientSession, BusError> {
        self.credentials
            .authenticate(client_id, username, password)?;
        info!(client = %client_id, "bus: client connected");
        Ok(ClientSession {
            broker: Arc::clone(self),
            client_id: client_id.to_string(),
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Stop accepting publishes and end every subscription.
    pub fn shutdown(&self) {
        if !self.closed.send_replace(true) {
            info!("bus: shut down");
        }
    }

    fn subscribe(&self, prefix: String) -> Subscription {
        debug!(prefix = %prefix, "bus: new subscription");
        Subscription {
            receiver: self.sender.subscribe(),
            closed: self.closed.subscribe(),
            prefix,
        }
    }

    async fn dispatch(&self, msg: Message) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed { topic: msg.topic });
        }

        self.on_publish(&msg).await;

        // No subscribers is not an error.
        let _ = self.sender.send(msg);
        Ok(())
    }

    /// Runs for every accepted publish, including the hub's own commands.
    /// Nothing in here can fail the publish.
    async fn on_publish(&self, msg: &Message) {
        let origin = msg.origin.as_deref().unwrap_or("hub");
        debug!(
            topic = %msg.topic,
            origin,
            bytes = msg.payload.len(),
            "bus: message published"
        );

        match Topic::classify(&msg.topic) {
            Topic::State { device } => self.apply_state(device, &msg.payload).await,
            Topic::Command {
                device,
                relay,
                state,
            } => {
                info!(device, relay, %state, origin, "bus: relay command");
                self.shared.write().await.record_command(&msg.topic);
            }
            Topic::Other => {
                if serde_json::from_slice::<serde_json::Value>(&msg.payload).is_err() {
                    debug!(topic = %msg.topic, "bus: payload is not json");
                }
            }
        }
    }

    async fn apply_state(&self, device: &str, payload: &[u8]) {
        let report = match DeviceReport::decode(device, payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(device, "bus: dropping malformed state payload: {e}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("{device}: malformed state payload ({e})"));
                return;
            }
        };

        if report.is_empty() {
            debug!(device, "bus: state payload carried no known fields");
            return;
        }

        if let Err(e) = self.store.apply_relay_update(&report).await {
            error!(device, "bus: store update failed: {e}");
            self.shared
                .write()
                .await
                .record_error(format!("{device}: store update failed ({e})"));
            return;
        }

        self.shared
            .write()
            .await
            .record_telemetry(device, describe(&report));
    }
}

#[async_trait]
impl Publisher for Broker {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        self.dispatch(Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            origin: None,
        })
        .await
    }
}

/// One-line summary of a report for the activity log.
fn describe(report: &DeviceReport) -> String {
    let s = &report.sensors;
    let sensors = [
        ("lightIntensity", s.light_intensity),
        ("temperature", s.temperature),
        ("humidity", s.humidity),
        ("pressure", s.pressure),
        ("gasResistance", s.gas_resistance),
        ("waterLevel", s.water_level),
    ];

    sensors
        .iter()
        .filter_map(|(name, v)| v.map(|v| format!("{name}={v}")))
        .chain(report.relays.iter().map(|(r, st)| format!("{r}={st}")))
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// An authenticated connection to the broker.
#[derive(Clone)]
pub struct ClientSession {
    broker: Arc<Broker>,
    client_id: String,
}

impl ClientSession {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        self.broker
            .dispatch(Message {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                origin: Some(self.client_id.clone()),
            })
            .await
    }

    /// Receive every message whose topic starts with `prefix` (empty for
    /// everything).
    pub fn subscribe(&self, prefix: impl Into<String>) -> Subscription {
        self.broker.subscribe(prefix.into())
    }
}

pub struct Subscription {
    receiver: broadcast::Receiver<Message>,
    closed: watch::Receiver<bool>,
    prefix: String,
}

impl Subscription {
    /// Next matching message, or `None` once the bus has shut down.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            if *self.closed.borrow() {
                return None;
            }
            tokio::select! {
                biased;
                res = self.receiver.recv() => match res {
                    Ok(msg) if msg.topic.starts_with(&self.prefix) => return Some(msg),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        warn!(lagged = count, "bus: subscriber lagged, messages dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                changed = self.closed.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
