//! Serial sensor adapters.
//!
//! Both adapters open their serial device raw (8N1, no flow control) and
//! publish what they decode through their own bus session, so their
//! readings take the same state-sync path as any remote device. A port
//! that cannot be opened disables that adapter only.

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, info, warn};

use crate::bus::ClientSession;
use crate::error::BusError;

pub const ENVIRONMENT_DEVICE: &str = "arduinoEnvironment";
pub const ENVIRONMENT_TOPIC: &str = "arduinoEnvironment/state";
pub const WATER_LEVEL_TOPIC: &str = "waterLevelSensor/state";

const FRAME_START: &str = "SENSOR_START";
const FRAME_END: &str = "SENSOR_END";

const ULTRASONIC_HEADER: u8 = 0xFF;
const ULTRASONIC_FRAME_LEN: usize = 4;

/// Open `path` as a raw serial port at `baud`.
fn open_port(path: &str, baud: u32) -> tokio_serial::Result<SerialStream> {
    tokio_serial::new(path, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open_native_async()
}

// ---------------------------------------------------------------------------
// Environment sensor (line protocol)
// ---------------------------------------------------------------------------

/// The JSON text between `SENSOR_START` and `SENSOR_END`, if the line
/// carries a frame.
pub fn extract_environment_frame(line: &str) -> Option<&str> {
    let start = line.find(FRAME_START)? + FRAME_START.len();
    let end = line[start..].find(FRAME_END)? + start;
    Some(line[start..end].trim())
}

/// Read environment frames line by line until the port closes.
pub async fn run_environment(path: String, baud: u32, session: ClientSession) {
    let port = match open_port(&path, baud) {
        Ok(p) => p,
        Err(e) => {
            warn!(port = %path, "ingest: cannot open environment port, adapter disabled: {e}");
            return;
        }
    };
    info!(port = %path, baud, "ingest: environment sensor attached");
    read_environment(port, &path, &session).await;
    info!(port = %path, "ingest: environment sensor detached");
}

async fn read_environment<R: AsyncRead + Unpin>(source: R, path: &str, session: &ClientSession) {
    let mut reader = BufReader::new(source);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(port = %path, "ingest: environment read failed: {e}");
                break;
            }
        }

        let line = String::from_utf8_lossy(&raw);
        let Some(frame) = extract_environment_frame(&line) else {
            continue;
        };
        if let Err(e) = serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(frame) {
            warn!(port = %path, "ingest: bad environment frame: {e}");
            continue;
        }

        if let Err(e) = session.publish(ENVIRONMENT_TOPIC, frame.as_bytes()).await {
            if matches!(e, BusError::Closed { .. }) {
                break;
            }
            warn!("ingest: environment publish failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Ultrasonic water-level sensor (binary frames)
// ---------------------------------------------------------------------------

/// Reassembles `FF hi lo sum` frames from an arbitrary byte stream,
/// resynchronising on the header after garbage or a bad checksum.
#[derive(Debug, Default)]
pub struct UltrasonicDecoder {
    buf: Vec<u8>,
}

impl UltrasonicDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every distance (mm) completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<u16> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();

        loop {
            match self.buf.iter().position(|b| *b == ULTRASONIC_HEADER) {
                Some(0) => {}
                Some(i) => {
                    self.buf.drain(..i);
                }
                None => {
                    self.buf.clear();
                    break;
                }
            }
            if self.buf.len() < ULTRASONIC_FRAME_LEN {
                break;
            }

            let (hi, lo, sum) = (self.buf[1], self.buf[2], self.buf[3]);
            let expected = ULTRASONIC_HEADER.wrapping_add(hi).wrapping_add(lo);
            if sum == expected {
                out.push(u16::from_be_bytes([hi, lo]));
                self.buf.drain(..ULTRASONIC_FRAME_LEN);
            } else {
                debug!(hi, lo, sum, expected, "ingest: ultrasonic checksum mismatch");
                self.buf.drain(..1);
            }
        }

        out
    }
}

/// Tank fill level in percent from the sensor-to-surface distance, rounded
/// to two decimals. `full_scale` is the distance of an empty tank.
pub fn water_level_percent(distance: u16, full_scale: f64) -> f64 {
    let pct = 100.0 - (f64::from(distance) / full_scale * 100.0).min(100.0);
    (pct * 100.0).round() / 100.0
}

fn water_level_payload(pct: f64) -> Vec<u8> {
    serde_json::json!({ "waterLevel": pct }).to_string().into_bytes()
}

/// Decode ultrasonic frames and publish the latest distance as a water
/// level every `period`. A reading is published once, then cleared until a
/// new frame arrives.
pub async fn run_ultrasonic(
    path: String,
    baud: u32,
    full_scale: f64,
    period: Duration,
    session: ClientSession,
) {
    let port = match open_port(&path, baud) {
        Ok(p) => p,
        Err(e) => {
            warn!(port = %path, "ingest: cannot open ultrasonic port, adapter disabled: {e}");
            return;
        }
    };
    info!(port = %path, baud, "ingest: ultrasonic sensor attached");
    read_ultrasonic(port, &path, full_scale, period, &session).await;
    info!(port = %path, "ingest: ultrasonic sensor detached");
}

async fn read_ultrasonic<R: AsyncRead + Unpin>(
    mut source: R,
    path: &str,
    full_scale: f64,
    period: Duration,
    session: &ClientSession,
) {

    let mut decoder = UltrasonicDecoder::new();
    let mut latest: Option<u16> = None;
    let mut chunk = [0u8; 64];
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            read = source.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => {
                    if let Some(d) = decoder.feed(&chunk[..n]).last() {
                        latest = Some(*d);
                    }
                }
                Err(e) => {
                    warn!(port = %path, "ingest: ultrasonic read failed: {e}");
                    break;
                }
            },
            _ = ticker.tick() => {
                let Some(distance) = latest.take() else {
                    debug!("ingest: no valid distance received yet");
                    continue;
                };
                if !publish_water_level(session, distance, full_scale).await {
                    return;
                }
            }
        }
    }

    // Port closed: flush what was read last.
    if let Some(distance) = latest {
        publish_water_level(session, distance, full_scale).await;
    }
}

/// Returns false once the bus is gone.
async fn publish_water_level(session: &ClientSession, distance: u16, full_scale: f64) -> bool {
    let pct = water_level_percent(distance, full_scale);
    debug!(distance, pct, "ingest: water level");
    match session
        .publish(WATER_LEVEL_TOPIC, &water_level_payload(pct))
        .await
    {
        Ok(()) => true,
        Err(BusError::Closed { .. }) => false,
        Err(e) => {
            warn!("ingest: water level publish failed: {e}");
            true
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Broker, Credentials};
    use crate::state;
    use crate::store::{MemoryStore, Store};
    use std::sync::Arc;

    fn frame(distance: u16) -> [u8; 4] {
        let [hi, lo] = distance.to_be_bytes();
        [0xFF, hi, lo, 0xFFu8.wrapping_add(hi).wrapping_add(lo)]
    }

    fn bus() -> (Arc<Broker>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(Broker::new(
            Credentials::new("admin", "root"),
            store.clone(),
            state::new_shared(),
        ));
        (broker, store)
    }

    fn sensor_session(broker: &Arc<Broker>, id: &str) -> ClientSession {
        broker.connect(id, Some("admin"), Some(b"cm9vdA==")).unwrap()
    }

    // -- Environment frames -------------------------------------------------

    #[test]
    fn extracts_json_between_markers() {
        assert_eq!(
            extract_environment_frame(r#"SENSOR_START{"lightIntensity":312}SENSOR_END"#),
            Some(r#"{"lightIntensity":312}"#)
        );
        assert_eq!(
            extract_environment_frame("boot ok SENSOR_START {\"temperature\":20} SENSOR_END\r\n"),
            Some("{\"temperature\":20}")
        );
    }

    #[test]
    fn lines_without_both_markers_are_not_frames() {
        assert_eq!(extract_environment_frame("arduino ready"), None);
        assert_eq!(extract_environment_frame("SENSOR_START{\"a\":1}"), None);
        assert_eq!(extract_environment_frame("{\"a\":1}SENSOR_END"), None);
        assert_eq!(extract_environment_frame("SENSOR_ENDSENSOR_START"), None);
    }

    #[tokio::test]
    async fn environment_frames_reach_the_store() {
        let (broker, store) = bus();
        let serial: &[u8] = b"arduino ready\n\
              SENSOR_START{\"lightIntensity\":312,\"humidity\":55.5}SENSOR_END\n\
              SENSOR_START{broken}SENSOR_END\n\
              \xff\xfe noise\n\
              SENSOR_START{\"lightIntensity\":640}SENSOR_END\n";

        read_environment(serial, "ttyACM0", &sensor_session(&broker, "arduino")).await;

        let snap = store.read_snapshot().await.unwrap();
        assert_eq!(snap.light_intensity, Some(640.0));
        assert_eq!(snap.humidity, Some(55.5));
    }

    #[tokio::test]
    async fn missing_environment_port_disables_adapter() {
        let (broker, store) = bus();
        run_environment(
            "/nonexistent/greenhouse/ttyUSB9".into(),
            9600,
            sensor_session(&broker, "arduino"),
        )
        .await;
        assert_eq!(store.read_snapshot().await.unwrap().light_intensity, None);
    }

    #[tokio::test]
    async fn regular_file_is_not_opened_as_a_serial_port() {
        let path = std::env::temp_dir().join(format!("greenhouse-{}.port", std::process::id()));
        std::fs::write(&path, b"SENSOR_START{\"lightIntensity\":312}SENSOR_END\n").unwrap();

        assert!(open_port(&path.to_string_lossy(), 9600).is_err());
        std::fs::remove_file(path).ok();
    }

    // -- Ultrasonic frames --------------------------------------------------

    #[test]
    fn decodes_consecutive_frames() {
        let mut d = UltrasonicDecoder::new();
        let mut bytes = frame(120).to_vec();
        bytes.extend_from_slice(&frame(1500));
        assert_eq!(d.feed(&bytes), vec![120, 1500]);
    }

    #[test]
    fn frame_split_across_reads() {
        let mut d = UltrasonicDecoder::new();
        let f = frame(300);
        assert!(d.feed(&f[..1]).is_empty());
        assert!(d.feed(&f[1..3]).is_empty());
        assert_eq!(d.feed(&f[3..]), vec![300]);
    }

    #[test]
    fn control_bytes_inside_frames_pass_through() {
        // CR, DEL, EOT and LF as distance bytes: a cooked tty would mangle these.
        let mut d = UltrasonicDecoder::new();
        let distances = [0x0D7F, 0x0400, 0x000A, 0x7F0D];
        let bytes: Vec<u8> = distances.iter().flat_map(|x| frame(*x)).collect();
        assert_eq!(d.feed(&bytes), distances.to_vec());
    }

    #[test]
    fn resyncs_after_garbage_and_bad_checksum() {
        let mut d = UltrasonicDecoder::new();
        let mut bytes = vec![0x12, 0x34];
        bytes.extend_from_slice(&[0xFF, 0x00, 0x64, 0x00]); // bad checksum
        bytes.extend_from_slice(&frame(100));
        assert_eq!(d.feed(&bytes), vec![100]);
    }

    #[test]
    fn water_level_from_distance() {
        assert_eq!(water_level_percent(0, 250.0), 100.0);
        assert_eq!(water_level_percent(100, 250.0), 60.0);
        assert_eq!(water_level_percent(33, 250.0), 86.8);
        assert_eq!(water_level_percent(1, 300.0), 99.67);
        assert_eq!(water_level_percent(250, 250.0), 0.0);
        assert_eq!(water_level_percent(900, 250.0), 0.0);
    }

    #[test]
    fn water_level_payload_shape() {
        let v: serde_json::Value = serde_json::from_slice(&water_level_payload(42.5)).unwrap();
        assert_eq!(v, serde_json::json!({ "waterLevel": 42.5 }));
    }

    #[tokio::test]
    async fn ultrasonic_publishes_latest_level() {
        let (broker, store) = bus();
        let mut bytes = frame(200).to_vec();
        bytes.extend_from_slice(&frame(50));

        read_ultrasonic(
            bytes.as_slice(),
            "ttyUSB0",
            250.0,
            Duration::from_millis(10),
            &sensor_session(&broker, "ultrasonic"),
        )
        .await;

        let snap = store.read_snapshot().await.unwrap();
        assert_eq!(snap.water_level, Some(80.0));
    }
}
