//! Uplink to the external MQTT broker the relay firmware talks to.
//!
//! Upstream `<device>/state` publishes are injected into the local bus
//! through the bridge's own session. Relay commands published locally by
//! anyone but the bridge are forwarded upstream.

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::bus::{ClientSession, Message, Topic};
use crate::config::BridgeConfig;
use crate::error::BusError;
use crate::state::SharedState;

/// Delay before polling again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Upstream topics to subscribe to, one per relay device.
pub fn upstream_filters(devices: &[String]) -> Vec<String> {
    devices.iter().map(|d| format!("{d}/state")).collect()
}

/// Whether a local bus message should be sent upstream.
pub fn should_forward(msg: &Message, bridge_id: &str) -> bool {
    matches!(Topic::classify(&msg.topic), Topic::Command { .. })
        && msg.origin.as_deref() != Some(bridge_id)
}

/// Whether an upstream publish should be injected into the local bus.
pub fn should_inject(topic: &str) -> bool {
    matches!(Topic::classify(topic), Topic::State { .. })
}

/// Run the bridge until the local bus shuts down. Intended to be
/// `tokio::spawn`-ed from main.
pub async fn run(
    cfg: BridgeConfig,
    devices: Vec<String>,
    session: ClientSession,
    shared: SharedState,
) {
    let mut options = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    options.set_keep_alive(Duration::from_secs(cfg.keep_alive_sec));
    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        options.set_credentials(user, pass);
    }

    let (client, mut eventloop) = AsyncClient::new(options, 20);
    let filters = upstream_filters(&devices);

    // ── Local → upstream: relay commands ────────────────────────────
    let forward_client = client.clone();
    let mut local = session.subscribe("");
    let bridge_id = session.client_id().to_string();
    let mut forwarder = tokio::spawn(async move {
        while let Some(msg) = local.recv().await {
            if !should_forward(&msg, &bridge_id) {
                continue;
            }
            if let Err(e) = forward_client
                .publish(&msg.topic, QoS::AtLeastOnce, false, msg.payload)
                .await
            {
                error!(topic = %msg.topic, "bridge: upstream publish failed: {e}");
            }
        }
        debug!("bridge: local bus closed, forwarder done");
    });

    info!(host = %cfg.host, port = cfg.port, ?filters, "bridge starting");

    // ── Upstream → local: device state ──────────────────────────────
    loop {
        let event = tokio::select! {
            _ = &mut forwarder => break,
            event = eventloop.poll() => event,
        };
        match event {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if !should_inject(&p.topic) {
                    debug!(topic = %p.topic, "bridge: ignoring upstream topic");
                    continue;
                }
                match session.publish(&p.topic, &p.payload).await {
                    Ok(()) => {}
                    Err(BusError::Closed { .. }) => break,
                    Err(e) => warn!(topic = %p.topic, "bridge: local publish failed: {e}"),
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("bridge: connected upstream");
                for filter in &filters {
                    if let Err(e) = client.subscribe(filter, QoS::AtLeastOnce).await {
                        error!(filter = %filter, "bridge: subscribe failed: {e}");
                    }
                }
                shared.write().await.set_bridge_connected(true);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("bridge: upstream disconnected");
                shared.write().await.set_bridge_connected(false);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("bridge: connection error: {e}. reconnecting...");
                {
                    let mut st = shared.write().await;
                    st.set_bridge_connected(false);
                    st.record_error(format!("bridge: {e}"));
                }
                sleep(RECONNECT_DELAY).await;
            }
        }
    }

    forwarder.abort();
    if let Err(e) = client.disconnect().await {
        debug!("bridge: disconnect: {e}");
    }
    shared.write().await.set_bridge_connected(false);
    info!("bridge stopped");
}

// ===========================================================================
// Tests
// ===========================================================================
