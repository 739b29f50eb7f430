//! Durable store sink: appends telemetry/alert/status rows to Postgres.
//!
//! Grounded in `original_source/bms-monitor/app/services/database_service.py`
//! (`save_battery_data`, `save_battery_alert`, `update_system_status`,
//! `get_latest_battery_data`, `get_battery_history`, `get_active_alerts`,
//! `acknowledge_alert`), table shapes per §6.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use tracing::warn;

use crate::error::{QueryError, SinkError};
use crate::model::{
    AlertEvent, AlertKind, Direction, HealthStatus, LinkStatus, Severity, SystemStatusRecord,
    TelemetryRecord,
};

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, SinkError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| SinkError::StoreWriteFailed(e.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn is_available(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    /// Appends one row. Serialized cell/temperature vectors are stored as
    /// JSON text, per §6.
    pub async fn save_telemetry(&self, record: &TelemetryRecord) -> Result<(), SinkError> {
        let cells = serde_json::to_string(&record.cells).unwrap_or_default();
        let temperatures = serde_json::to_string(&record.temperatures).unwrap_or_default();
        let status = status_text(record.status);
        let connection_status = connection_status_text(record.connection_status);

        sqlx::query(
            "INSERT INTO battery_data \
             (timestamp, total_voltage, current, power, soc, temperature, status, cells, temperatures, connection_status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(record.timestamp)
        .bind(record.total_voltage)
        .bind(record.current)
        .bind(record.power)
        .bind(record.soc)
        .bind(record.temperature)
        .bind(status)
        .bind(cells)
        .bind(temperatures)
        .bind(connection_status)
        .execute(&self.pool)
        .await
        .map_err(|e| SinkError::StoreWriteFailed(e.to_string()))?;

        Ok(())
    }

    pub async fn save_alert(&self, alert: &AlertEvent) -> Result<(), SinkError> {
        sqlx::query(
            "INSERT INTO battery_alerts \
             (timestamp, type, severity, message, value, threshold, cell, acknowledged) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(alert.timestamp)
        .bind(alert_kind_text(alert.kind))
        .bind(severity_text(alert.severity))
        .bind(&alert.message)
        .bind(alert.value)
        .bind(alert.threshold)
        .bind(alert.cell.map(|c| c as i32))
        .bind(alert.acknowledged)
        .execute(&self.pool)
        .await
        .map_err(|e| SinkError::StoreWriteFailed(e.to_string()))?;

        Ok(())
    }

    pub async fn save_system_status(&self, status: &SystemStatusRecord) -> Result<(), SinkError> {
        sqlx::query(
            "INSERT INTO system_status \
             (timestamp, connected, last_read, read_count, error_count, uptime) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(status.timestamp)
        .bind(status.connected)
        .bind(status.last_read_at)
        .bind(status.read_count as i64)
        .bind(status.error_count as i64)
        .bind(status.uptime_seconds)
        .execute(&self.pool)
        .await
        .map_err(|e| SinkError::StoreWriteFailed(e.to_string()))?;

        Ok(())
    }

    pub async fn latest_telemetry(&self) -> Result<Option<TelemetryRecord>, QueryError> {
        let row = sqlx::query_as::<_, TelemetryRow>(
            "SELECT timestamp, total_voltage, current, power, soc, temperature, status, cells, temperatures, connection_status \
             FROM battery_data ORDER BY timestamp DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|_| QueryError::DependencyUnavailable)?;

        Ok(row.map(Into::into))
    }

    pub async fn history(&self, window: ChronoDuration, limit: i64) -> Result<Vec<TelemetryRecord>, QueryError> {
        let since = Utc::now() - window;
        let rows = sqlx::query_as::<_, TelemetryRow>(
            "SELECT timestamp, total_voltage, current, power, soc, temperature, status, cells, temperatures, connection_status \
             FROM battery_data WHERE timestamp >= $1 ORDER BY timestamp DESC LIMIT $2",
        )
        .bind(since)
        .bind(limit.min(1000))
        .fetch_all(&self.pool)
        .await
        .map_err(|_| QueryError::DependencyUnavailable)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn active_alerts(&self, limit: i64) -> Result<Vec<AlertEvent>, QueryError> {
        let rows = sqlx::query_as::<_, AlertRow>(
            "SELECT id, timestamp, type, severity, message, value, threshold, cell, acknowledged \
             FROM battery_alerts WHERE acknowledged = false ORDER BY timestamp DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|_| QueryError::DependencyUnavailable)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Idempotent: acknowledging an already-acknowledged alert still
    /// returns success with no state change. Returns `NotFound` only when
    /// the id does not exist at all.
    pub async fn acknowledge_alert(&self, alert_id: i64) -> Result<(), QueryError> {
        let result = sqlx::query("UPDATE battery_alerts SET acknowledged = true WHERE id = $1")
            .bind(alert_id)
            .execute(&self.pool)
            .await
            .map_err(|_| QueryError::DependencyUnavailable)?;

        if result.rows_affected() == 0 {
            return Err(QueryError::NotFound);
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct TelemetryRow {
    timestamp: DateTime<Utc>,
    total_voltage: Option<f64>,
    current: Option<f64>,
    power: Option<f64>,
    soc: Option<f64>,
    temperature: Option<f64>,
    status: String,
    cells: String,
    temperatures: String,
    connection_status: String,
}

impl From<TelemetryRow> for TelemetryRecord {
    fn from(row: TelemetryRow) -> Self {
        let cells: Vec<f64> = serde_json::from_str(&row.cells).unwrap_or_default();
        let temperatures: Vec<f64> = serde_json::from_str(&row.temperatures).unwrap_or_default();
        let direction = match row.current {
            Some(c) if c > 0.0 => Some(Direction::Discharging),
            Some(c) if c < 0.0 => Some(Direction::Charging),
            Some(_) => Some(Direction::Idle),
            None => None,
        };
        Self {
            timestamp: row.timestamp,
            total_voltage: row.total_voltage,
            current: row.current,
            direction,
            power: row.power,
            soc: row.soc,
            temperature: row.temperature,
            cells,
            temperatures,
            status: parse_status(&row.status),
            connection_status: parse_connection_status(&row.connection_status),
        }
    }
}

#[derive(sqlx::FromRow)]
struct AlertRow {
    id: i64,
    timestamp: DateTime<Utc>,
    #[sqlx(rename = "type")]
    kind: String,
    severity: String,
    message: String,
    value: Option<f64>,
    threshold: Option<f64>,
    cell: Option<i32>,
    acknowledged: bool,
}

impl From<AlertRow> for AlertEvent {
    fn from(row: AlertRow) -> Self {
        Self {
            id: Some(row.id),
            timestamp: row.timestamp,
            kind: parse_alert_kind(&row.kind),
            severity: parse_severity(&row.severity),
            message: row.message,
            value: row.value,
            threshold: row.threshold,
            cell: row.cell.map(|c| c as u32),
            acknowledged: row.acknowledged,
        }
    }
}

fn status_text(status: HealthStatus) -> &'static str {
    match status {
        HealthStatus::Normal => "normal",
        HealthStatus::Error => "error",
        HealthStatus::NoData => "no_data",
    }
}

fn parse_status(s: &str) -> HealthStatus {
    match s {
        "normal" => HealthStatus::Normal,
        "error" => HealthStatus::Error,
        _ => HealthStatus::NoData,
    }
}

fn connection_status_text(status: LinkStatus) -> &'static str {
    match status {
        LinkStatus::Connected => "connected",
        LinkStatus::Disconnected => "disconnected",
        LinkStatus::Error => "error",
    }
}

fn parse_connection_status(s: &str) -> LinkStatus {
    match s {
        "connected" => LinkStatus::Connected,
        "error" => LinkStatus::Error,
        _ => LinkStatus::Disconnected,
    }
}

fn alert_kind_text(kind: AlertKind) -> &'static str {
    match kind {
        AlertKind::CriticalLowVoltage => "critical_low_voltage",
        AlertKind::LowVoltage => "low_voltage",
        AlertKind::HighVoltage => "high_voltage",
        AlertKind::CriticalCellVoltage => "critical_cell_voltage",
        AlertKind::HighCellVoltage => "high_cell_voltage",
        AlertKind::HighTemperature => "high_temperature",
    }
}

fn parse_alert_kind(s: &str) -> AlertKind {
    match s {
        "critical_low_voltage" => AlertKind::CriticalLowVoltage,
        "low_voltage" => AlertKind::LowVoltage,
        "high_voltage" => AlertKind::HighVoltage,
        "critical_cell_voltage" => AlertKind::CriticalCellVoltage,
        "high_cell_voltage" => AlertKind::HighCellVoltage,
        _ => AlertKind::HighTemperature,
    }
}

fn severity_text(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "info",
        Severity::Warning => "warning",
        Severity::Critical => "critical",
    }
}

fn parse_severity(s: &str) -> Severity {
    match s {
        "critical" => Severity::Critical,
        "warning" => Severity::Warning,
        _ => {
            warn!(value = s, "unrecognized severity in store row, defaulting to info");
            Severity::Info
        }
    }
}
