//! Alert Synthesizer: a pure mapping from a [`TelemetryRecord`] to zero or
//! more [`AlertEvent`]s.
//!
//! Grounded in `original_source/bms-bluetooth-poc/core/bms_mqtt_bridge.py`'s
//! threshold table (confirmed, including the 3.8 V cell-high rule Open
//! Question 1 resolves in favor of).

use chrono::{DateTime, Utc};

use crate::model::{AlertEvent, AlertKind, Severity, TelemetryRecord};

const CRITICAL_LOW_VOLTAGE: f64 = 24.0;
const LOW_VOLTAGE_HIGH: f64 = 25.6;
const HIGH_VOLTAGE: f64 = 30.4;
const CRITICAL_CELL_VOLTAGE: f64 = 3.0;
const HIGH_CELL_VOLTAGE: f64 = 3.8;
const HIGH_TEMPERATURE_WARNING: f64 = 45.0;
const HIGH_TEMPERATURE_CRITICAL: f64 = 55.0;

/// Evaluates every threshold rule against `record`, in the order they are
/// listed in §4.4. Identical back-to-back alerts are not deduplicated here.
pub fn synthesize(record: &TelemetryRecord) -> Vec<AlertEvent> {
    let mut alerts = Vec::new();
    let ts = record.timestamp;

    if let Some(voltage) = record.total_voltage {
        if voltage < CRITICAL_LOW_VOLTAGE {
            alerts.push(alert(
                ts,
                AlertKind::CriticalLowVoltage,
                Severity::Critical,
                format!("pack voltage {voltage:.1} V below critical threshold {CRITICAL_LOW_VOLTAGE:.1} V"),
                Some(voltage),
                Some(CRITICAL_LOW_VOLTAGE),
                None,
            ));
        } else if voltage < LOW_VOLTAGE_HIGH {
            alerts.push(alert(
                ts,
                AlertKind::LowVoltage,
                Severity::Warning,
                format!("pack voltage {voltage:.1} V below {LOW_VOLTAGE_HIGH:.1} V"),
                Some(voltage),
                Some(LOW_VOLTAGE_HIGH),
                None,
            ));
        }
        if voltage > HIGH_VOLTAGE {
            alerts.push(alert(
                ts,
                AlertKind::HighVoltage,
                Severity::Critical,
                format!("pack voltage {voltage:.1} V above critical threshold {HIGH_VOLTAGE:.1} V"),
                Some(voltage),
                Some(HIGH_VOLTAGE),
                None,
            ));
        }
    }

    for (index, &cell) in record.cells.iter().enumerate() {
        let cell_number = (index + 1) as u32;
        if cell < CRITICAL_CELL_VOLTAGE {
            alerts.push(alert(
                ts,
                AlertKind::CriticalCellVoltage,
                Severity::Critical,
                format!("cell {cell_number} voltage {cell:.3} V below {CRITICAL_CELL_VOLTAGE:.1} V"),
                Some(cell),
                Some(CRITICAL_CELL_VOLTAGE),
                Some(cell_number),
            ));
        }
        if cell > HIGH_CELL_VOLTAGE {
            alerts.push(alert(
                ts,
                AlertKind::HighCellVoltage,
                Severity::Warning,
                format!("cell {cell_number} voltage {cell:.3} V above {HIGH_CELL_VOLTAGE:.1} V"),
                Some(cell),
                Some(HIGH_CELL_VOLTAGE),
                Some(cell_number),
            ));
        }
    }

    if let Some(avg_temp) = average_temperature(&record.temperatures) {
        if avg_temp > HIGH_TEMPERATURE_CRITICAL {
            alerts.push(alert(
                ts,
                AlertKind::HighTemperature,
                Severity::Critical,
                format!("average temperature {avg_temp:.1} C above {HIGH_TEMPERATURE_CRITICAL:.1} C"),
                Some(avg_temp),
                Some(HIGH_TEMPERATURE_CRITICAL),
                None,
            ));
        } else if avg_temp > HIGH_TEMPERATURE_WARNING {
            alerts.push(alert(
                ts,
                AlertKind::HighTemperature,
                Severity::Warning,
                format!("average temperature {avg_temp:.1} C above {HIGH_TEMPERATURE_WARNING:.1} C"),
                Some(avg_temp),
                Some(HIGH_TEMPERATURE_WARNING),
                None,
            ));
        }
    }

    alerts
}

fn average_temperature(temperatures: &[f64]) -> Option<f64> {
    if temperatures.is_empty() {
        None
    } else {
        Some(temperatures.iter().sum::<f64>() / temperatures.len() as f64)
    }
}

fn alert(
    timestamp: DateTime<Utc>,
    kind: AlertKind,
    severity: Severity,
    message: String,
    value: Option<f64>,
    threshold: Option<f64>,
    cell: Option<u32>,
) -> AlertEvent {
    AlertEvent {
        id: None,
        timestamp,
        kind,
        severity,
        message,
        value,
        threshold,
        cell,
        acknowledged: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HealthStatus, LinkStatus};

    fn base_record() -> TelemetryRecord {
        TelemetryRecord {
            timestamp: Utc::now(),
            total_voltage: None,
            current: None,
            direction: None,
            power: None,
            soc: None,
            temperature: None,
            cells: Vec::new(),
            temperatures: Vec::new(),
            status: HealthStatus::Normal,
            connection_status: LinkStatus::Connected,
        }
    }

    /// S4 — exactly one alert for a 23.9 V reading, no per-cell alert.
    #[test]
    fn s4_critical_low_voltage() {
        let mut record = base_record();
        record.total_voltage = Some(23.9);
        let alerts = synthesize(&record);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::CriticalLowVoltage);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert_eq!(alerts[0].value, Some(23.9));
        assert_eq!(alerts[0].threshold, Some(24.0));
    }

    /// Invariant 8 — the 24.0 boundary belongs to the warning band, not
    /// critical (strict `<` on critical_low_voltage).
    #[test]
    fn alert_boundary_24_0_is_warning_band() {
        let mut record = base_record();
        record.total_voltage = Some(24.0);
        let alerts = synthesize(&record);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::LowVoltage);
    }

    #[test]
    fn high_voltage_boundary_is_exclusive() {
        let mut record = base_record();
        record.total_voltage = Some(30.4);
        assert!(synthesize(&record).is_empty());

        record.total_voltage = Some(30.40001);
        let alerts = synthesize(&record);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::HighVoltage);
    }

    #[test]
    fn per_cell_alerts_carry_one_based_index() {
        let mut record = base_record();
        record.total_voltage = Some(27.0);
        record.cells = vec![3.3, 2.9, 3.9];
        let alerts = synthesize(&record);
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].kind, AlertKind::CriticalCellVoltage);
        assert_eq!(alerts[0].cell, Some(2));
        assert_eq!(alerts[1].kind, AlertKind::HighCellVoltage);
        assert_eq!(alerts[1].cell, Some(3));
    }

    #[test]
    fn temperature_warning_then_critical_band() {
        let mut record = base_record();
        record.temperatures = vec![46.0];
        let alerts = synthesize(&record);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warning);

        record.temperatures = vec![60.0];
        let alerts = synthesize(&record);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);
    }

    #[test]
    fn no_alerts_when_all_fields_nominal() {
        let mut record = base_record();
        record.total_voltage = Some(27.0);
        record.cells = vec![3.3, 3.3, 3.3];
        record.temperatures = vec![25.0];
        assert!(synthesize(&record).is_empty());
    }
}
