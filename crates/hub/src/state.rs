use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

pub fn new_shared() -> SharedState {
    Arc::new(RwLock::new(SystemState::new()))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Hub activity as seen by operators: connection flags, last controller
/// tick and a bounded event log. Not read by any decision path.
pub struct SystemState {
    pub started_at: Instant,
    pub bridge_connected: bool,
    pub last_tick: Option<OffsetDateTime>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Telemetry,
    Command,
    Controller,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub bridge_connected: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_tick: Option<OffsetDateTime>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            bridge_connected: false,
            last_tick: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a state report merged into the store.
    pub fn record_telemetry(&mut self, device: &str, detail: String) {
        self.push_event(EventKind::Telemetry, format!("{device}: {detail}"));
    }

    /// Record a relay command seen on the bus.
    pub fn record_command(&mut self, topic: &str) {
        self.push_event(EventKind::Command, topic.to_string());
    }

    pub fn record_controller(&mut self, detail: String) {
        self.push_event(EventKind::Controller, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Update the uplink flag; only a change is logged.
    pub fn set_bridge_connected(&mut self, connected: bool) {
        if self.bridge_connected == connected {
            return;
        }
        self.bridge_connected = connected;
        let detail = if connected {
            "bridge connected"
        } else {
            "bridge disconnected"
        };
        self.push_event(EventKind::System, detail.to_string());
    }

    pub fn mark_tick(&mut self, at: OffsetDateTime) {
        self.last_tick = Some(at);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            bridge_connected: self.bridge_connected,
            last_tick: self.last_tick,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_keeps_latest_events() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().map(|e| e.detail.as_str()), Some("event 25"));
    }

    #[test]
    fn status_lists_newest_first() {
        let mut st = SystemState::new();
        st.record_command("esp32lr20/cmd/relay1/on");
        st.record_telemetry("esp32lr20", "relay1=on".into());

        let status = st.to_status();
        assert_eq!(status.events[0].kind, EventKind::Telemetry);
        assert_eq!(status.events[0].detail, "esp32lr20: relay1=on");
        assert_eq!(status.events[1].kind, EventKind::Command);
    }

    #[test]
    fn bridge_flag_logs_changes_only() {
        let mut st = SystemState::new();
        st.set_bridge_connected(false);
        assert!(st.events.is_empty());

        st.set_bridge_connected(true);
        st.set_bridge_connected(true);
        assert!(st.bridge_connected);
        assert_eq!(st.events.len(), 1);
    }

    #[test]
    fn status_serialises_event_kinds_lowercase() {
        let mut st = SystemState::new();
        st.record_error("store unavailable".into());
        let json = serde_json::to_value(st.to_status()).unwrap();
        assert_eq!(json["events"][0]["kind"], "error");
        assert!(json["last_tick"].is_null());
    }
}
