//! Poll Scheduler: drives one acquisition every `poll_interval` and keeps
//! the link alive across faults.
//!
//! Grounded in `original_source/bms-monitor/app/services/bms_service.py`'s
//! `read_bms_data`/`estimate_soc`, generalized to try the bulk read first
//! per §4.3 and fall back to per-register reads only where the bulk read
//! left fields unset.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::codec;
use crate::error::TransportError;
use crate::model::{
    Direction, HealthStatus, LinkStatus, PartialTelemetry, RegisterMap, SessionCounters,
    SystemStatusRecord, TelemetryRecord, BULK_READ_BASE, BULK_READ_COUNT,
};

/// Abstraction over the BLE transport the scheduler drives, so that tests
/// can substitute a fixed request -> response table instead of real BLE
/// I/O. [`crate::transport::Transport`] implements this for production use.
#[async_trait::async_trait]
pub trait PolledTransport: Send {
    async fn connect(&mut self) -> Result<(), TransportError>;
    async fn send(&mut self, request: &[u8], wait: Duration) -> Result<Vec<Vec<u8>>, TransportError>;
    fn is_connected(&self) -> bool;
}

pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub registers: RegisterMap,
    pub cell_count: usize,
    pub temp_count: usize,
    pub soc_low_voltage: f64,
    pub soc_high_voltage: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            registers: RegisterMap::default(),
            cell_count: 8,
            temp_count: 4,
            soc_low_voltage: 24.0,
            soc_high_voltage: 29.2,
        }
    }
}

/// Voltage-based SOC estimate used when no register read yields a valid
/// value. Monotonic non-decreasing, 0 at `low`, 100 at `high`.
pub fn estimate_soc_from_voltage(voltage: f64, low: f64, high: f64) -> f64 {
    let raw = (voltage - low) / (high - low) * 100.0;
    let clamped = raw.clamp(0.0, 100.0);
    (clamped * 10.0).round() / 10.0
}

/// Runs one acquisition tick: connect-if-needed, bulk read, per-register
/// fallback, power/SOC derivation, and counter updates. Returns the
/// telemetry record produced (possibly `status = no_data`/`error`).
///
/// `last_bulk_payload` caches the most recent CRC-valid bulk-read payload
/// so the `/api/diagnostics/soc-candidates` query handler has something to
/// scan without holding its own transport handle.
pub async fn tick<T: PolledTransport>(
    transport: &mut T,
    config: &SchedulerConfig,
    counters: &Arc<Mutex<SessionCounters>>,
    last_bulk_payload: &Arc<Mutex<Option<Vec<u8>>>>,
) -> TelemetryRecord {
    let now = Utc::now();

    if !transport.is_connected() {
        if let Err(e) = transport.connect().await {
            warn!(error = %e, "connect failed, will retry next tick");
            counters.lock().await.reads_err += 1;
            tokio::time::sleep(Duration::from_secs(10)).await;
            return TelemetryRecord::empty(now, LinkStatus::Disconnected);
        }
        let wake = codec::encode_read_request(config.registers.total_voltage, 1);
        let _ = transport.send(&wake, Duration::from_secs(1)).await;
    }

    let bulk_request = codec::encode_read_request(BULK_READ_BASE, BULK_READ_COUNT);
    let responses = match transport.send(&bulk_request, Duration::from_secs(4)).await {
        Ok(frames) => frames,
        Err(e) => {
            warn!(error = %e, "bulk read failed");
            counters.lock().await.reads_err += 1;
            return TelemetryRecord::empty(now, LinkStatus::Error);
        }
    };

    let mut partial = PartialTelemetry::default();
    for frame in &responses {
        if codec::is_echo(&bulk_request, frame) {
            continue;
        }
        match codec::decode_response(frame) {
            Ok(payload) => {
                partial = codec::bulk_extract(
                    payload,
                    &config.registers,
                    config.cell_count,
                    config.temp_count,
                );
                *last_bulk_payload.lock().await = Some(payload.to_vec());
                break;
            }
            Err(e) => {
                info!(error = %e, "bulk frame rejected by codec");
            }
        }
    }

    if partial.total_voltage.is_none() {
        fallback_reads(transport, config, &mut partial).await;
    }

    finalize(now, partial, config, transport.is_connected(), counters).await
}

async fn fallback_reads<T: PolledTransport>(
    transport: &mut T,
    config: &SchedulerConfig,
    partial: &mut PartialTelemetry,
) {
    let spacing = Duration::from_millis(500);

    let request = codec::encode_read_request(config.registers.total_voltage, 1);
    if let Ok(frames) = transport.send(&request, Duration::from_secs(2)).await {
        if let Some(payload) = first_valid_payload(&request, &frames) {
            partial.total_voltage = codec::decode_total_voltage_response(payload);
        }
    }
    tokio::time::sleep(spacing).await;

    let request = codec::encode_read_request(config.registers.current, 1);
    if let Ok(frames) = transport.send(&request, Duration::from_secs(2)).await {
        if let Some(payload) = first_valid_payload(&request, &frames) {
            if let Some((amps, direction)) = codec::decode_current_response(payload) {
                partial.current = Some(amps);
                partial.direction = Some(direction);
            }
        }
    }
    tokio::time::sleep(spacing).await;

    let request = codec::encode_read_request(config.registers.temperature_base, config.temp_count as u16);
    if let Ok(frames) = transport.send(&request, Duration::from_secs(2)).await {
        if let Some(payload) = first_valid_payload(&request, &frames) {
            let temps = codec::decode_temperatures_response(payload);
            if !temps.is_empty() {
                partial.temperatures = temps;
            }
        }
    }
    tokio::time::sleep(spacing).await;

    let request = codec::encode_read_request(config.registers.soc, 1);
    if let Ok(frames) = transport.send(&request, Duration::from_secs(2)).await {
        if let Some(payload) = first_valid_payload(&request, &frames) {
            partial.soc = codec::decode_soc_response(payload, config.registers.soc_scale, config.registers.soc_offset);
        }
    }
}

fn first_valid_payload<'a>(request: &[u8], frames: &'a [Vec<u8>]) -> Option<&'a [u8]> {
    frames
        .iter()
        .filter(|f| !codec::is_echo(request, f))
        .find_map(|f| codec::decode_response(f).ok())
}

async fn finalize(
    timestamp: chrono::DateTime<Utc>,
    mut partial: PartialTelemetry,
    config: &SchedulerConfig,
    link_connected: bool,
    counters: &Arc<Mutex<SessionCounters>>,
) -> TelemetryRecord {
    let power = match (partial.total_voltage, partial.current) {
        (Some(v), Some(i)) => Some(v * i),
        _ => None,
    };

    if partial.soc.is_none() {
        if let Some(voltage) = partial.total_voltage {
            partial.soc = Some(estimate_soc_from_voltage(
                voltage,
                config.soc_low_voltage,
                config.soc_high_voltage,
            ));
        }
    }

    let temperature = if partial.temperatures.is_empty() {
        None
    } else {
        Some(partial.temperatures.iter().sum::<f64>() / partial.temperatures.len() as f64)
    };

    let has_any = partial.total_voltage.is_some()
        || partial.current.is_some()
        || partial.soc.is_some()
        || !partial.cells.is_empty()
        || !partial.temperatures.is_empty();

    let connection_status = if link_connected {
        LinkStatus::Connected
    } else {
        LinkStatus::Disconnected
    };

    let status = if has_any && link_connected {
        HealthStatus::Normal
    } else if !link_connected {
        HealthStatus::Error
    } else {
        HealthStatus::NoData
    };

    let mut counters_guard = counters.lock().await;
    if has_any {
        counters_guard.reads_ok += 1;
        counters_guard.last_read_at = Some(timestamp);
    } else {
        counters_guard.reads_err += 1;
    }
    drop(counters_guard);

    TelemetryRecord {
        timestamp,
        total_voltage: partial.total_voltage,
        current: partial.current,
        direction: partial.direction.or(if has_any { Some(Direction::Idle) } else { None }),
        power,
        soc: partial.soc,
        temperature,
        cells: partial.cells,
        temperatures: partial.temperatures,
        status,
        connection_status,
    }
}

/// Drives `tick` on `config.poll_interval` until `shutdown` flips true.
/// Sleeps between ticks are interruptible; an in-flight tick always
/// finishes with its own per-call timeouts before the loop checks for
/// shutdown again.
pub async fn run<T, F>(
    mut transport: T,
    config: SchedulerConfig,
    counters: Arc<Mutex<SessionCounters>>,
    last_bulk_payload: Arc<Mutex<Option<Vec<u8>>>>,
    mut shutdown: watch::Receiver<bool>,
    mut on_tick: F,
) where
    T: PolledTransport,
    F: FnMut(TelemetryRecord),
{
    loop {
        if *shutdown.borrow() {
            info!("scheduler received shutdown signal, exiting");
            return;
        }

        let record = tick(&mut transport, &config, &counters, &last_bulk_payload).await;
        on_tick(record);

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("scheduler interrupted during sleep, exiting after this tick");
                    return;
                }
            }
        }
    }
}

/// Builds a [`SystemStatusRecord`] snapshot from the scheduler's counters.
pub async fn status_snapshot(
    counters: &Arc<Mutex<SessionCounters>>,
    connected: bool,
    started_at: chrono::DateTime<Utc>,
) -> SystemStatusRecord {
    let guard = counters.lock().await;
    SystemStatusRecord {
        timestamp: Utc::now(),
        connected,
        last_read_at: guard.last_read_at,
        read_count: guard.reads_ok,
        error_count: guard.reads_err,
        uptime_seconds: (Utc::now() - started_at).num_milliseconds() as f64 / 1000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// A mock transport backed by a fixed request -> response table, per
    /// SPEC_FULL.md §8's test-tooling note.
    struct MockTransport {
        connected: bool,
        responses: HashMap<Vec<u8>, Vec<Vec<u8>>>,
        connect_should_fail: bool,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                connected: false,
                responses: HashMap::new(),
                connect_should_fail: false,
            }
        }

        fn with_response(mut self, request: Vec<u8>, response: Vec<u8>) -> Self {
            self.responses.entry(request).or_default().push(response);
            self
        }
    }

    #[async_trait::async_trait]
    impl PolledTransport for MockTransport {
        async fn connect(&mut self) -> Result<(), TransportError> {
            if self.connect_should_fail {
                return Err(TransportError::DeviceNotFound);
            }
            self.connected = true;
            Ok(())
        }

        async fn send(&mut self, request: &[u8], _wait: Duration) -> Result<Vec<Vec<u8>>, TransportError> {
            Ok(self.responses.get(request).cloned().unwrap_or_default())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    fn build_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![codec::SLAVE_ADDR, codec::FUNC_READ, payload.len() as u8];
        frame.extend_from_slice(payload);
        let crc = codec::modbus_crc16(&frame);
        frame.push((crc & 0xFF) as u8);
        frame.push((crc >> 8) as u8);
        frame
    }

    #[tokio::test]
    async fn s3_crc_failure_emits_no_data_without_killing_the_link() {
        let bulk_request = codec::encode_read_request(BULK_READ_BASE, BULK_READ_COUNT).to_vec();
        let mut corrupt_frame = build_frame(&vec![0u8; 124]);
        let last = corrupt_frame.len() - 1;
        corrupt_frame[last] ^= 0xFF;

        let mut transport = MockTransport::new()
            .with_response(bulk_request, vec![corrupt_frame]);
        transport.connected = true;

        let config = SchedulerConfig::default();
        let counters = Arc::new(Mutex::new(SessionCounters::default()));
        let last_bulk_payload = Arc::new(Mutex::new(None));

        let record = tick(&mut transport, &config, &counters, &last_bulk_payload).await;

        assert_eq!(record.status, HealthStatus::NoData);
        assert!(record.total_voltage.is_none());
        assert_eq!(counters.lock().await.reads_err, 1);
    }

    #[tokio::test]
    async fn bulk_read_populates_record_without_fallback() {
        let mut payload = vec![0u8; 124];
        payload[80] = 0x01;
        payload[81] = 0x09;
        payload[82] = 0x75;
        payload[83] = 0x30;

        let bulk_request = codec::encode_read_request(BULK_READ_BASE, BULK_READ_COUNT).to_vec();
        let frame = build_frame(&payload);

        let mut transport = MockTransport::new().with_response(bulk_request, frame);
        transport.connected = true;

        let config = SchedulerConfig::default();
        let counters = Arc::new(Mutex::new(SessionCounters::default()));
        let last_bulk_payload = Arc::new(Mutex::new(None));

        let record = tick(&mut transport, &config, &counters, &last_bulk_payload).await;

        assert_eq!(record.status, HealthStatus::Normal);
        assert_eq!(record.total_voltage, Some(26.5));
        assert_eq!(record.current, Some(0.0));
        assert_eq!(counters.lock().await.reads_ok, 1);
    }

    #[test]
    fn invariant_4_soc_estimator_clamps_and_is_monotonic() {
        assert_eq!(estimate_soc_from_voltage(20.0, 24.0, 29.2), 0.0);
        assert_eq!(estimate_soc_from_voltage(24.0, 24.0, 29.2), 0.0);
        assert_eq!(estimate_soc_from_voltage(29.2, 24.0, 29.2), 100.0);
        assert_eq!(estimate_soc_from_voltage(35.0, 24.0, 29.2), 100.0);

        let mut previous = estimate_soc_from_voltage(24.0, 24.0, 29.2);
        let mut v = 24.1;
        while v <= 29.2 {
            let current = estimate_soc_from_voltage(v, 24.0, 29.2);
            assert!(current >= previous);
            previous = current;
            v += 0.1;
        }
    }

    #[tokio::test]
    async fn connect_failure_increments_error_counter() {
        let mut transport = MockTransport::new();
        transport.connect_should_fail = true;

        let config = SchedulerConfig::default();
        let counters = Arc::new(Mutex::new(SessionCounters::default()));
        let last_bulk_payload = Arc::new(Mutex::new(None));

        let record = tick(&mut transport, &config, &counters, &last_bulk_payload).await;

        assert_eq!(record.connection_status, LinkStatus::Disconnected);
        assert_eq!(counters.lock().await.reads_err, 1);
    }
}
