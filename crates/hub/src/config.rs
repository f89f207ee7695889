//! TOML config file loading and validation: broker credentials, the relay
//! role mapping, controller policy, the uplink bridge, and sensor ports.
//!
//! Every field has a default, so an empty (or missing) file is a valid
//! configuration.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use time::macros::format_description;
use time::{Time, UtcOffset};

use crate::controller::ControllerOptions;
use crate::schedule::DailyWindow;
use crate::store::RelayTarget;

/// A pump run or its start grace never spans more than a day.
const MAX_PUMP_DURATION_MIN: u64 = 24 * 60;
const MAX_PUMP_START_GRACE_SEC: u64 = 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local time zone for time-of-day decisions, e.g. "+02:00".
    pub utc_offset: Option<String>,
    pub broker: BrokerConfig,
    pub relays: RelayMap,
    pub controller: ControllerConfig,
    pub bridge: BridgeConfig,
    pub sensors: SensorsConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub username: String,
    pub password: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            username: "admin".into(),
            password: "root".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayEntry {
    pub device: String,
    pub relay: String,
}

impl RelayEntry {
    pub fn target(&self) -> RelayTarget {
        RelayTarget::new(&self.device, &self.relay)
    }
}

/// Logical relay role → physical device topic and relay name.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RelayMap {
    pub light: RelayEntry,
    pub pump: RelayEntry,
}

impl Default for RelayMap {
    fn default() -> Self {
        Self {
            light: RelayEntry {
                device: "esp32lr20".into(),
                relay: "relay1".into(),
            },
            pump: RelayEntry {
                device: "esp32lr20".into(),
                relay: "relay2".into(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct ClockTime {
    pub hour: u8,
    pub minute: u8,
}

impl ClockTime {
    pub const fn new(hour: u8, minute: u8) -> Self {
        Self { hour, minute }
    }

    pub fn to_time(self) -> Result<Time> {
        Time::from_hms(self.hour, self.minute, 0)
            .with_context(|| format!("invalid time of day {:02}:{:02}", self.hour, self.minute))
    }

    fn is_valid(self) -> bool {
        self.hour < 24 && self.minute < 60
    }
}

#[derive(Debug, Deserialize)]
pub struct WindowEntry {
    pub start: ClockTime,
    pub stop: ClockTime,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub tick_interval_sec: u64,
    pub light_threshold: f64,
    pub light_window: WindowEntry,
    pub pump_duration_min: u64,
    pub pump_start_grace_sec: u64,
    pub pump_schedule: Vec<ClockTime>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval_sec: 5,
            light_threshold: 500.0,
            light_window: WindowEntry {
                start: ClockTime::new(8, 0),
                stop: ClockTime::new(20, 0),
            },
            pump_duration_min: 10,
            pump_start_grace_sec: 60,
            pump_schedule: vec![ClockTime::new(9, 0), ClockTime::new(15, 0)],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_sec: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "greenhouse-hub".into(),
            username: None,
            password: None,
            keep_alive_sec: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SensorsConfig {
    pub environment_port: Option<String>,
    pub environment_baud: u32,
    pub ultrasonic_port: Option<String>,
    pub ultrasonic_baud: u32,
    pub water_level_full_scale: f64,
    pub water_level_interval_sec: u64,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            environment_port: None,
            environment_baud: 9600,
            ultrasonic_port: None,
            ultrasonic_baud: 9600,
            water_level_full_scale: 250.0,
            water_level_interval_sec: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all entries. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_broker(&mut errors);
        self.validate_relays(&mut errors);
        self.validate_controller(&mut errors);
        self.validate_sensors(&mut errors);

        if let Some(s) = &self.utc_offset {
            if parse_utc_offset(s).is_err() {
                errors.push(format!("utc_offset '{s}' is not of the form +HH:MM"));
            }
        }
        if self.bridge.enabled && self.bridge.host.trim().is_empty() {
            errors.push("bridge: host is empty".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_broker(&self, errors: &mut Vec<String>) {
        if self.broker.username.is_empty() {
            errors.push("broker: username is empty".into());
        }
        if self.broker.password.is_empty() {
            errors.push("broker: password is empty".into());
        }
    }

    fn validate_relays(&self, errors: &mut Vec<String>) {
        for (role, entry) in [("light", &self.relays.light), ("pump", &self.relays.pump)] {
            for (field, value) in [("device", &entry.device), ("relay", &entry.relay)] {
                if value.trim().is_empty() {
                    errors.push(format!("relays.{role}: {field} is empty"));
                } else if value.contains(['/', '+', '#']) {
                    errors.push(format!(
                        "relays.{role}: {field} '{value}' must not contain '/', '+' or '#'"
                    ));
                }
            }
        }
        if self.relays.light.target() == self.relays.pump.target() {
            errors.push(format!(
                "relays: light and pump both map to {}",
                self.relays.light.target()
            ));
        }
    }

    fn validate_controller(&self, errors: &mut Vec<String>) {
        let c = &self.controller;

        if c.tick_interval_sec == 0 {
            errors.push("controller: tick_interval_sec must be positive".into());
        }
        if !c.light_threshold.is_finite() {
            errors.push(format!(
                "controller: light_threshold {} is not a finite number",
                c.light_threshold
            ));
        }
        for (name, t) in [
            ("light_window.start", c.light_window.start),
            ("light_window.stop", c.light_window.stop),
        ] {
            if !t.is_valid() {
                errors.push(format!(
                    "controller: {name} {:02}:{:02} is not a valid time of day",
                    t.hour, t.minute
                ));
            }
        }
        if c.pump_duration_min == 0 || c.pump_duration_min > MAX_PUMP_DURATION_MIN {
            errors.push(format!(
                "controller: pump_duration_min must be between 1 and {}, got {}",
                MAX_PUMP_DURATION_MIN, c.pump_duration_min
            ));
        }
        if c.pump_start_grace_sec == 0 || c.pump_start_grace_sec > MAX_PUMP_START_GRACE_SEC {
            errors.push(format!(
                "controller: pump_start_grace_sec must be between 1 and {}, got {}",
                MAX_PUMP_START_GRACE_SEC, c.pump_start_grace_sec
            ));
        }

        if c.pump_schedule.is_empty() {
            errors.push("controller: pump_schedule needs at least one start time".into());
        }
        let mut seen: HashSet<ClockTime> = HashSet::new();
        for (i, t) in c.pump_schedule.iter().enumerate() {
            if !t.is_valid() {
                errors.push(format!(
                    "controller: pump_schedule[{i}] {:02}:{:02} is not a valid time of day",
                    t.hour, t.minute
                ));
            } else if !seen.insert(*t) {
                errors.push(format!(
                    "controller: pump_schedule[{i}] {:02}:{:02} is a duplicate start time",
                    t.hour, t.minute
                ));
            }
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let s = &self.sensors;
        if !(s.water_level_full_scale.is_finite() && s.water_level_full_scale > 0.0) {
            errors.push(format!(
                "sensors: water_level_full_scale must be positive, got {}",
                s.water_level_full_scale
            ));
        }
        for (name, baud) in [
            ("environment_baud", s.environment_baud),
            ("ultrasonic_baud", s.ultrasonic_baud),
        ] {
            if baud == 0 {
                errors.push(format!("sensors: {name} must be positive"));
            }
        }
        if s.water_level_interval_sec == 0 {
            errors.push("sensors: water_level_interval_sec must be positive".into());
        }
    }

    /// Build the controller's options from a validated config.
    pub fn controller_options(&self) -> Result<ControllerOptions> {
        let c = &self.controller;
        let pump_schedule = c
            .pump_schedule
            .iter()
            .map(|t| t.to_time())
            .collect::<Result<Vec<_>>>()?;

        Ok(ControllerOptions {
            tick_interval: Duration::from_secs(c.tick_interval_sec),
            light_threshold: c.light_threshold,
            light_window: DailyWindow::new(
                c.light_window.start.to_time()?,
                c.light_window.stop.to_time()?,
            ),
            light_relay: self.relays.light.target(),
            pump_relay: self.relays.pump.target(),
            pump_schedule,
            pump_duration: Duration::from_secs(c.pump_duration_min.saturating_mul(60)),
            pump_start_grace: Duration::from_secs(c.pump_start_grace_sec),
        })
    }

    /// Device topic prefixes whose `<device>/state` telemetry the hub cares
    /// about upstream.
    pub fn relay_devices(&self) -> Vec<String> {
        let mut devices = vec![self.relays.light.device.clone()];
        if self.relays.pump.device != self.relays.light.device {
            devices.push(self.relays.pump.device.clone());
        }
        devices
    }

    /// Apply `MQTT_HOST`, `MQTT_PORT`, `SERIAL_PORT` and `SERIAL_BAUD_RATE`
    /// overrides.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = var("MQTT_HOST") {
            self.bridge.host = host;
        }
        if let Some(port) = var("MQTT_PORT").and_then(|s| s.parse().ok()) {
            self.bridge.port = port;
        }
        if let Some(port) = var("SERIAL_PORT") {
            self.sensors.environment_port = Some(port);
        }
        if let Some(baud) = var("SERIAL_BAUD_RATE").and_then(|s| s.parse().ok()) {
            self.sensors.environment_baud = baud;
        }
    }
}

pub fn parse_utc_offset(s: &str) -> Result<UtcOffset> {
    UtcOffset::parse(
        s.trim(),
        format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
    )
    .with_context(|| format!("invalid utc offset: {s}"))
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// defaults.
pub fn load(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::warn!(path, "config file not found, using defaults");
        let config = Config::default();
        config.validate()?;
        return Ok(config);
    }

    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_config_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.broker.username, "admin");
        assert_eq!(config.relays.light.relay, "relay1");
        assert_eq!(config.relays.pump.relay, "relay2");
        assert_eq!(config.controller.tick_interval_sec, 5);
        assert_eq!(config.controller.pump_schedule.len(), 2);
        assert!(!config.bridge.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
utc_offset = "+02:00"

[broker]
username = "greenhouse"
password = "s3cret"

[relays.light]
device = "esp32lr20"
relay = "relay2"

[relays.pump]
device = "esp32lr20"
relay = "relay1"

[controller]
tick_interval_sec = 10
light_threshold = 800.0
light_window = { start = { hour = 7, minute = 30 }, stop = { hour = 21, minute = 0 } }
pump_duration_min = 7
pump_schedule = [{ hour = 8, minute = 0 }, { hour = 16, minute = 0 }]

[bridge]
enabled = true
host = "192.168.20.1"

[sensors]
environment_port = "/dev/ttyACM0"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();

        assert_eq!(config.relays.light.target(), RelayTarget::new("esp32lr20", "relay2"));
        assert_eq!(config.controller.light_threshold, 800.0);
        assert_eq!(config.controller.light_window.start, ClockTime::new(7, 30));
        // Unset fields inside a present section keep their defaults.
        assert_eq!(config.controller.pump_start_grace_sec, 60);
        assert_eq!(config.bridge.port, 1883);
        assert_eq!(config.sensors.environment_port.as_deref(), Some("/dev/ttyACM0"));
    }

    #[test]
    fn parse_rejects_unknown_type() {
        let toml_str = r#"
[controller]
tick_interval_sec = "fast"
"#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn empty_credentials_rejected() {
        let mut cfg = Config::default();
        cfg.broker.username.clear();
        cfg.broker.password.clear();
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("2 errors"), "got: {msg}");
    }

    #[test]
    fn relay_with_topic_separator_rejected() {
        let mut cfg = Config::default();
        cfg.relays.light.device = "esp32/lr20".into();
        assert_validation_err(&cfg, "must not contain");
    }

    #[test]
    fn relay_with_wildcard_rejected() {
        let mut cfg = Config::default();
        cfg.relays.pump.relay = "#".into();
        assert_validation_err(&cfg, "relays.pump: relay");
    }

    #[test]
    fn light_and_pump_on_same_relay_rejected() {
        let mut cfg = Config::default();
        cfg.relays.pump.relay = cfg.relays.light.relay.clone();
        assert_validation_err(&cfg, "light and pump both map to");
    }

    #[test]
    fn zero_tick_rejected() {
        let mut cfg = Config::default();
        cfg.controller.tick_interval_sec = 0;
        assert_validation_err(&cfg, "tick_interval_sec");
    }

    #[test]
    fn invalid_window_time_rejected() {
        let mut cfg = Config::default();
        cfg.controller.light_window.stop = ClockTime::new(24, 0);
        assert_validation_err(&cfg, "light_window.stop 24:00");
    }

    #[test]
    fn nan_threshold_rejected() {
        let mut cfg = Config::default();
        cfg.controller.light_threshold = f64::NAN;
        assert_validation_err(&cfg, "light_threshold");
    }

    #[test]
    fn empty_pump_schedule_rejected() {
        let mut cfg = Config::default();
        cfg.controller.pump_schedule.clear();
        assert_validation_err(&cfg, "at least one start time");
    }

    #[test]
    fn duplicate_pump_start_rejected() {
        let mut cfg = Config::default();
        cfg.controller.pump_schedule = vec![ClockTime::new(9, 0), ClockTime::new(9, 0)];
        assert_validation_err(&cfg, "duplicate start time");
    }

    #[test]
    fn invalid_pump_minute_rejected() {
        let mut cfg = Config::default();
        cfg.controller.pump_schedule = vec![ClockTime::new(9, 60)];
        assert_validation_err(&cfg, "pump_schedule[0] 09:60");
    }

    #[test]
    fn zero_pump_duration_rejected() {
        let mut cfg = Config::default();
        cfg.controller.pump_duration_min = 0;
        assert_validation_err(&cfg, "pump_duration_min");
    }

    #[test]
    fn pump_duration_longer_than_a_day_rejected() {
        let mut cfg = Config::default();
        cfg.controller.pump_duration_min = 1_000_000_000_000;
        assert_validation_err(&cfg, "pump_duration_min must be between 1 and 1440");

        cfg.controller.pump_duration_min = 24 * 60;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn pump_grace_longer_than_a_day_rejected() {
        let mut cfg = Config::default();
        cfg.controller.pump_start_grace_sec = 86_401;
        assert_validation_err(&cfg, "pump_start_grace_sec must be between 1 and 86400");
    }

    #[test]
    fn bad_utc_offset_rejected() {
        let cfg = Config {
            utc_offset: Some("CEST".into()),
            ..Default::default()
        };
        assert_validation_err(&cfg, "utc_offset 'CEST'");
    }

    #[test]
    fn zero_baud_rejected() {
        let mut cfg = Config::default();
        cfg.sensors.ultrasonic_baud = 0;
        assert_validation_err(&cfg, "ultrasonic_baud must be positive");
    }

    #[test]
    fn zero_full_scale_rejected() {
        let mut cfg = Config::default();
        cfg.sensors.water_level_full_scale = 0.0;
        assert_validation_err(&cfg, "water_level_full_scale");
    }

    // -- Conversion -------------------------------------------------------

    #[test]
    fn controller_options_from_defaults() {
        let opts = Config::default().controller_options().unwrap();
        assert_eq!(opts.tick_interval, Duration::from_secs(5));
        assert_eq!(opts.pump_duration, Duration::from_secs(600));
        assert_eq!(opts.pump_schedule.len(), 2);
        assert_eq!(opts.pump_schedule[0], time::macros::time!(9:00));
        assert_eq!(opts.light_relay, RelayTarget::new("esp32lr20", "relay1"));
        assert_eq!(opts.pump_relay, RelayTarget::new("esp32lr20", "relay2"));
    }

    #[test]
    fn relay_devices_deduplicated() {
        let mut cfg = Config::default();
        assert_eq!(cfg.relay_devices(), vec!["esp32lr20".to_string()]);
        cfg.relays.pump.device = "pumpboard".into();
        assert_eq!(
            cfg.relay_devices(),
            vec!["esp32lr20".to_string(), "pumpboard".to_string()]
        );
    }

    #[test]
    fn parse_utc_offset_accepts_signed_offsets() {
        assert_eq!(parse_utc_offset("+02:00").unwrap().whole_hours(), 2);
        assert_eq!(parse_utc_offset("-05:30").unwrap().whole_minutes(), -330);
        assert!(parse_utc_offset("2").is_err());
    }

    // -- Env overrides ----------------------------------------------------

    #[test]
    fn env_overrides_bridge_and_serial() {
        let vars: HashMap<&str, &str> = [
            ("MQTT_HOST", "10.0.0.5"),
            ("MQTT_PORT", "8883"),
            ("SERIAL_PORT", "/dev/ttyUSB0"),
            ("SERIAL_BAUD_RATE", "115200"),
        ]
        .into_iter()
        .collect();

        let mut cfg = Config::default();
        cfg.apply_env(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.bridge.host, "10.0.0.5");
        assert_eq!(cfg.bridge.port, 8883);
        assert_eq!(cfg.sensors.environment_port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cfg.sensors.environment_baud, 115_200);
        assert_eq!(cfg.sensors.ultrasonic_baud, 9600);
    }

    #[test]
    fn env_bad_port_ignored() {
        let mut cfg = Config::default();
        cfg.apply_env(|k| (k == "MQTT_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(cfg.bridge.port, 1883);
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let cfg = load("/nonexistent/greenhouse-config.toml").unwrap();
        assert_eq!(cfg.controller.light_threshold, 500.0);
    }
}
