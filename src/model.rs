//! Shared data model: telemetry, alerts, status, and the register map.
//!
//! Every record here is built once by its producer and shared by value to
//! each sink; nothing in this module is mutated after construction except
//! [`AlertEvent::acknowledged`], which only ever flips false -> true.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of current flow through the pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Charging,
    Discharging,
    Idle,
}

/// Overall health tag for a telemetry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Normal,
    Error,
    NoData,
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus::NoData
    }
}

/// BLE link status as observed by the Poll Scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Connected,
    Disconnected,
    Error,
}

impl Default for LinkStatus {
    fn default() -> Self {
        LinkStatus::Disconnected
    }
}

/// One decoded BMS reading. Produced once per successful acquisition tick
/// and never mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub timestamp: DateTime<Utc>,
    pub total_voltage: Option<f64>,
    pub current: Option<f64>,
    pub direction: Option<Direction>,
    pub power: Option<f64>,
    pub soc: Option<f64>,
    pub temperature: Option<f64>,
    pub cells: Vec<f64>,
    pub temperatures: Vec<f64>,
    pub status: HealthStatus,
    pub connection_status: LinkStatus,
}

impl TelemetryRecord {
    /// A record carrying no data, used as the Query Interface's last-resort
    /// default and as the record emitted for a failed tick.
    pub fn empty(timestamp: DateTime<Utc>, connection_status: LinkStatus) -> Self {
        Self {
            timestamp,
            total_voltage: None,
            current: None,
            direction: None,
            power: None,
            soc: None,
            temperature: None,
            cells: Vec::new(),
            temperatures: Vec::new(),
            status: HealthStatus::NoData,
            connection_status,
        }
    }

    /// True if at least one measured field was populated this tick.
    pub fn has_any_field(&self) -> bool {
        self.total_voltage.is_some()
            || self.current.is_some()
            || self.soc.is_some()
            || self.temperature.is_some()
            || !self.cells.is_empty()
            || !self.temperatures.is_empty()
    }
}

/// Severity tag for an [`AlertEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Kind of threshold crossing that produced an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    CriticalLowVoltage,
    LowVoltage,
    HighVoltage,
    CriticalCellVoltage,
    HighCellVoltage,
    HighTemperature,
}

/// One alert raised by the Alert Synthesizer from a telemetry record.
/// `acknowledged` only transitions false -> true, via the acknowledge
/// operation in the Query Interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub value: Option<f64>,
    pub threshold: Option<f64>,
    pub cell: Option<u32>,
    pub acknowledged: bool,
}

/// Periodic snapshot of scheduler health, derived from [`SessionCounters`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatusRecord {
    pub timestamp: DateTime<Utc>,
    pub connected: bool,
    pub last_read_at: Option<DateTime<Utc>>,
    pub read_count: u64,
    pub error_count: u64,
    pub uptime_seconds: f64,
}

impl SystemStatusRecord {
    pub fn zero(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            connected: false,
            last_read_at: None,
            read_count: 0,
            error_count: 0,
            uptime_seconds: 0.0,
        }
    }
}

/// Process-lifetime monotonic counters. Owned exclusively by the Poll
/// Scheduler; other components only ever read a snapshot.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub reads_ok: u64,
    pub reads_err: u64,
    pub last_read_at: Option<DateTime<Utc>>,
}

/// One entry per active Live Push Hub subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberHandle {
    pub id: uuid::Uuid,
    pub connected_at: DateTime<Utc>,
    pub peer: Option<String>,
    pub last_ping: DateTime<Utc>,
}

/// Register addresses for the fields this crate decodes. The SOC register,
/// scale, and offset are configurable at startup for firmware variants.
#[derive(Debug, Clone, Copy)]
pub struct RegisterMap {
    pub cell_voltage_base: u16,
    pub temperature_base: u16,
    pub total_voltage: u16,
    pub current: u16,
    pub soc: u16,
    pub soc_scale: f64,
    pub soc_offset: f64,
    pub mosfet_status: u16,
    pub fault_bitmap: u16,
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self {
            cell_voltage_base: 0x0000,
            temperature_base: 0x0020,
            total_voltage: 0x0028,
            current: 0x0029,
            soc: 0x002C,
            soc_scale: 0.1,
            soc_offset: 0.0,
            mosfet_status: 0x002D,
            fault_bitmap: 0x003A,
        }
    }
}

/// Bulk read covers the 62 registers starting at 0x0000 (0x0000..=0x003D).
pub const BULK_READ_BASE: u16 = 0x0000;
pub const BULK_READ_COUNT: u16 = 62;

/// Accumulates fields decoded from either a bulk read or a sequence of
/// per-register reads. The scheduler finalizes this into a
/// [`TelemetryRecord`] once acquisition for a tick is done.
#[derive(Debug, Default, Clone)]
pub struct PartialTelemetry {
    pub total_voltage: Option<f64>,
    pub current: Option<f64>,
    pub direction: Option<Direction>,
    pub soc: Option<f64>,
    pub cells: Vec<f64>,
    pub temperatures: Vec<f64>,
}

impl PartialTelemetry {
    /// Layers `other` on top of `self`: any field `other` populated wins.
    /// Used to let a per-register fallback read fill in what a bulk read
    /// missed without clobbering fields the bulk read already had.
    pub fn merge(&mut self, other: PartialTelemetry) {
        if other.total_voltage.is_some() {
            self.total_voltage = other.total_voltage;
        }
        if other.current.is_some() {
            self.current = other.current;
            self.direction = other.direction;
        }
        if other.soc.is_some() {
            self.soc = other.soc;
        }
        if !other.cells.is_empty() {
            self.cells = other.cells;
        }
        if !other.temperatures.is_empty() {
            self.temperatures = other.temperatures;
        }
    }
}
