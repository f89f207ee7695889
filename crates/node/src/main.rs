mod relays;
mod sim;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::{env, time::Duration};
use time::{OffsetDateTime, UtcOffset};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use relays::RelayBoard;
use sim::{LightSim, Scenario};

const ENVIRONMENT_TOPIC: &str = "arduinoEnvironment/state";

#[derive(Debug, Serialize)]
struct EnvironmentMsg {
    #[serde(rename = "lightIntensity")]
    light_intensity: f64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Comma separated relay names; blanks are dropped.
fn parse_relay_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fractional hour of day, e.g. 13:30 -> 13.5.
fn hour_of_day(now: OffsetDateTime) -> f64 {
    f64::from(now.hour()) + f64::from(now.minute()) / 60.0 + f64::from(now.second()) / 3600.0
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Must be probed before any runtime threads exist.
    let offset = UtcOffset::current_local_offset().unwrap_or_else(|e| {
        warn!("local utc offset unavailable ({e}), simulating in UTC");
        UtcOffset::UTC
    });

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(run(offset))
}

async fn run(offset: UtcOffset) -> Result<()> {
    // Env config
    let host = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let device = env::var("DEVICE_ID").unwrap_or_else(|_| "esp32lr20".to_string());
    let relay_names = parse_relay_list(
        &env::var("RELAYS").unwrap_or_else(|_| "relay1,relay2".to_string()),
    );
    let light_relay = env::var("LIGHT_RELAY").unwrap_or_else(|_| "relay1".to_string());
    let state_every_s: u64 = env_or("STATE_EVERY_S", 30);
    let sample_every_s: u64 = env_or("SAMPLE_EVERY_S", 10);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let mut board = RelayBoard::new(&device, &relay_names);
    let mut light = LightSim::new(scenario);

    let mut mqttoptions = MqttOptions::new(format!("greenhouse-node-{device}"), host, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    if let (Ok(user), Ok(pass)) = (env::var("MQTT_USERNAME"), env::var("MQTT_PASSWORD")) {
        mqttoptions.set_credentials(user, pass);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    info!(%device, relays = ?relay_names, %scenario, "relay board simulator starting");

    let mut state_tick = interval(Duration::from_secs(state_every_s.max(1)));
    state_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sample_tick = interval(Duration::from_secs(sample_every_s.max(1)));
    sample_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    // Publishing goes through try_* since this same task drives the
    // event loop; an awaited publish on a full request queue would stall.
    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("node connected to mqtt");
                    if let Err(e) = client.try_subscribe(board.command_filter(), QoS::AtLeastOnce) {
                        warn!("subscribe failed: {e}");
                    }
                    publish_state(&client, &board);
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    match board.apply_command(&p.topic) {
                        Some(true) => {
                            info!(topic = %p.topic, "relay switched");
                            light.set_lamp(board.is_on(&light_relay));
                            publish_state(&client, &board);
                        }
                        Some(false) => debug!(topic = %p.topic, "relay already in requested state"),
                        None => debug!(topic = %p.topic, "ignoring message"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            },
            _ = state_tick.tick() => publish_state(&client, &board),
            _ = sample_tick.tick() => {
                let now = OffsetDateTime::now_utc().to_offset(offset);
                let msg = EnvironmentMsg {
                    light_intensity: light.sample(hour_of_day(now)),
                };
                match serde_json::to_vec(&msg) {
                    Ok(payload) => {
                        let sent =
                            client.try_publish(ENVIRONMENT_TOPIC, QoS::AtLeastOnce, false, payload);
                        if let Err(e) = sent {
                            warn!("light publish failed: {e}");
                        } else {
                            debug!(light = msg.light_intensity, "published light reading");
                        }
                    }
                    Err(e) => warn!("light reading encode failed: {e}"),
                }
            }
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
        }
    }

    if let Err(e) = client.try_disconnect() {
        debug!("disconnect: {e}");
    }
    Ok(())
}

fn publish_state(client: &AsyncClient, board: &RelayBoard) {
    if let Err(e) = client.try_publish(
        board.state_topic(),
        QoS::AtLeastOnce,
        false,
        board.state_payload(),
    ) {
        warn!("state publish failed: {e}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn relay_list_trims_and_drops_blanks() {
        assert_eq!(
            parse_relay_list(" relay1, relay2,,"),
            vec!["relay1".to_string(), "relay2".to_string()]
        );
        assert!(parse_relay_list("").is_empty());
    }

    #[test]
    fn hour_of_day_is_fractional() {
        assert_eq!(hour_of_day(datetime!(2024-06-01 13:30:00 UTC)), 13.5);
        assert_eq!(hour_of_day(datetime!(2024-06-01 00:00:00 UTC)), 0.0);
    }

    #[test]
    fn environment_msg_uses_camel_case_key() {
        let json = serde_json::to_value(EnvironmentMsg {
            light_intensity: 312.0,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"lightIntensity": 312.0}));
    }
}
