//! Simulated relay board: obeys `<device>/cmd/<relay>/<on|off>` and
//! reports `{"<relay>":"on"|"off",...}` on `<device>/state`.

use std::collections::BTreeMap;

pub struct RelayBoard {
    device: String,
    relays: BTreeMap<String, bool>,
}

impl RelayBoard {
    /// All relays start off, as after a power cycle.
    pub fn new(device: &str, relay_names: &[String]) -> Self {
        Self {
            device: device.to_string(),
            relays: relay_names.iter().map(|r| (r.clone(), false)).collect(),
        }
    }

    pub fn command_filter(&self) -> String {
        format!("{}/cmd/+/+", self.device)
    }

    pub fn state_topic(&self) -> String {
        format!("{}/state", self.device)
    }

    pub fn is_on(&self, relay: &str) -> bool {
        self.relays.get(relay).copied().unwrap_or(false)
    }

    /// Apply a command topic. Returns `Some(changed)` for a command
    /// addressed to a known relay on this board, `None` otherwise.
    pub fn apply_command(&mut self, topic: &str) -> Option<bool> {
        let parts: Vec<&str> = topic.split('/').collect();
        let [device, "cmd", relay, state] = parts.as_slice() else {
            return None;
        };
        if *device != self.device {
            return None;
        }
        let on = match state.to_ascii_lowercase().as_str() {
            "on" => true,
            "off" => false,
            _ => return None,
        };

        let slot = self.relays.get_mut(*relay)?;
        let changed = *slot != on;
        *slot = on;
        Some(changed)
    }

    pub fn state_payload(&self) -> Vec<u8> {
        let map: serde_json::Map<String, serde_json::Value> = self
            .relays
            .iter()
            .map(|(name, on)| {
                let state = if *on { "on" } else { "off" };
                (name.clone(), serde_json::Value::from(state))
            })
            .collect();
        serde_json::Value::Object(map).to_string().into_bytes()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
