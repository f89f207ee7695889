//! Shared state store contract: the snapshot record, relay states, and the
//! decoded device reports that get merged into it.
//!
//! The store holds *reported* state only. Relay hardware is the source of
//! truth and reports back asynchronously over `<device>/state`; nothing in
//! here is guaranteed current at the moment it is read.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::error::{DecodeError, StoreError};

// ---------------------------------------------------------------------------
// Relay identity + state
// ---------------------------------------------------------------------------

/// On/off state of a relay, normalised from case-insensitive strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    On,
    Off,
}

impl RelayState {
    /// Parse `"on"`/`"off"` (any case, surrounding whitespace ignored).
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("on") {
            Some(Self::On)
        } else if s.eq_ignore_ascii_case("off") {
            Some(Self::Off)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A physical relay: the device topic prefix plus the relay name on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelayTarget {
    pub device: String,
    pub relay: String,
}

impl RelayTarget {
    pub fn new(device: impl Into<String>, relay: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            relay: relay.into(),
        }
    }

    /// Key under which the snapshot stores this relay's reported state.
    pub fn key(&self) -> String {
        format!("{}/{}", self.device, self.relay)
    }

    /// `<device>/cmd/<relay>/<on|off>`
    pub fn command_topic(&self, state: RelayState) -> String {
        format!("{}/cmd/{}/{}", self.device, self.relay, state)
    }
}

impl fmt::Display for RelayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.relay)
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// The single shared record, as read at one instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub light_intensity: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub gas_resistance: Option<f64>,
    pub water_level: Option<f64>,
    /// Reported relay states keyed by `"<device>/<relay>"`.
    pub relays: BTreeMap<String, RelayState>,
    /// Unix seconds of the last merge, 0 for a fresh default record.
    pub updated_at: i64,
}

impl Snapshot {
    pub fn relay_state(&self, target: &RelayTarget) -> Option<RelayState> {
        self.relays.get(&target.key()).copied()
    }

    /// Last-write-wins merge of every field present in `report`.
    pub fn merge(&mut self, report: &DeviceReport, now_unix: i64) {
        let s = &report.sensors;
        merge_field(&mut self.light_intensity, s.light_intensity);
        merge_field(&mut self.temperature, s.temperature);
        merge_field(&mut self.humidity, s.humidity);
        merge_field(&mut self.pressure, s.pressure);
        merge_field(&mut self.gas_resistance, s.gas_resistance);
        merge_field(&mut self.water_level, s.water_level);

        for (relay, state) in &report.relays {
            self.relays
                .insert(format!("{}/{relay}", report.device), *state);
        }
        self.updated_at = now_unix;
    }
}

fn merge_field(slot: &mut Option<f64>, value: Option<f64>) {
    if value.is_some() {
        *slot = value;
    }
}

// ---------------------------------------------------------------------------
// Device reports (decoded telemetry)
// ---------------------------------------------------------------------------

/// Sensor fields a report may carry. Absent fields leave the store as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorFields {
    pub light_intensity: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub gas_resistance: Option<f64>,
    pub water_level: Option<f64>,
}

/// A decoded `<device>/state` payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceReport {
    pub device: String,
    pub sensors: SensorFields,
    /// Relay name on `device` → reported state.
    pub relays: BTreeMap<String, RelayState>,
}

impl DeviceReport {
    /// Decode a JSON object published by `device`.
    ///
    /// Known sensor fields (camelCase) must be numbers or null. Any other
    /// field holding an `"on"`/`"off"` string is a relay report; everything
    /// else is ignored.
    pub fn decode(device: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(payload)?;
        let Value::Object(fields) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let mut report = DeviceReport {
            device: device.to_string(),
            ..Default::default()
        };
        report.sensors = SensorFields {
            light_intensity: number_field(&fields, "lightIntensity")?,
            temperature: number_field(&fields, "temperature")?,
            humidity: number_field(&fields, "humidity")?,
            pressure: number_field(&fields, "pressure")?,
            gas_resistance: number_field(&fields, "gasResistance")?,
            water_level: number_field(&fields, "waterLevel")?,
        };

        for (name, v) in &fields {
            if SENSOR_FIELDS.contains(&name.as_str()) {
                continue;
            }
            if let Some(state) = v.as_str().and_then(RelayState::parse) {
                report.relays.insert(name.clone(), state);
            }
        }

        Ok(report)
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty() && self.sensors == SensorFields::default()
    }
}

const SENSOR_FIELDS: &[&str] = &[
    "lightIntensity",
    "temperature",
    "humidity",
    "pressure",
    "gasResistance",
    "waterLevel",
];

fn number_field(fields: &Map<String, Value>, name: &str) -> Result<Option<f64>, DecodeError> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| DecodeError::NotANumber(name.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Store accessor
// ---------------------------------------------------------------------------

/// Async accessor to the shared state record.
///
/// Implementations serialise individual reads and merges; neither is ever
/// held across a controller tick. A missing record is created with
/// defaults on first access.
#[async_trait]
pub trait Store: Send + Sync {
    async fn read_snapshot(&self) -> Result<Snapshot, StoreError>;

    async fn apply_relay_update(&self, report: &DeviceReport) -> Result<(), StoreError>;
}

/// Volatile store: one record behind a lock. Used when no database is
/// configured (`DB_URL=memory`) and in tests.
#[derive(Default)]
pub struct MemoryStore {
    record: RwLock<Snapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read_snapshot(&self) -> Result<Snapshot, StoreError> {
        Ok(self.record.read().await.clone())
    }

    async fn apply_relay_update(&self, report: &DeviceReport) -> Result<(), StoreError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.record.write().await.merge(report, now);
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
