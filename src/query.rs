//! Query Interface: read-side handlers backing the external request
//! surface in §6.
//!
//! Grounded in `original_source/bms-monitor/app/api/routes.py` (`/realtime`
//! cache-then-store-then-zero fallback, `/history/{duration}` duration
//! map, `/diagnostics/soc-candidates` register scan).

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;

use crate::codec;
use crate::error::QueryError;
use crate::hub::Hub;
use crate::model::{AlertEvent, RegisterMap, SystemStatusRecord, TelemetryRecord};
use crate::sinks::cache::Cache;
use crate::sinks::store::Store;

/// 5 s soft deadline applied to every Query Interface operation, per §5.
const QUERY_DEADLINE: Duration = Duration::from_secs(5);

pub struct QueryInterface {
    pub store: Option<Store>,
    pub cache: Option<Cache>,
    pub hub: Arc<Hub>,
    pub mqtt_available: bool,
    pub registers: RegisterMap,
    /// Last CRC-valid bulk-read payload seen by the Poll Scheduler. The
    /// Query Interface holds no transport handle of its own, so this is its
    /// only source of data for `soc_candidates`.
    pub last_bulk_payload: Arc<Mutex<Option<Vec<u8>>>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthCheck {
    pub timestamp: chrono::DateTime<Utc>,
    pub connections: ConnectionHealth,
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionHealth {
    pub database: bool,
    pub redis: bool,
    pub mqtt: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CellsResponse {
    pub cells: Vec<f64>,
    pub timestamp: chrono::DateTime<Utc>,
    pub count: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SocCandidate {
    pub register: u16,
    pub raw: u16,
    pub value: f64,
    pub selected: bool,
}

impl QueryInterface {
    pub async fn health(&self) -> HealthCheck {
        let database = match &self.store {
            Some(store) => timeout(store.is_available()).await.unwrap_or(false),
            None => false,
        };
        let redis = match &self.cache {
            Some(cache) => timeout(cache.is_available()).await.unwrap_or(false),
            None => false,
        };

        HealthCheck {
            timestamp: Utc::now(),
            connections: ConnectionHealth {
                database,
                redis,
                mqtt: self.mqtt_available,
            },
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    /// Cache first, then durable store (limit 1 newest), then a
    /// default-zero record.
    pub async fn latest_telemetry(&self) -> TelemetryRecord {
        if let Some(cache) = &self.cache {
            if let Some(record) = timeout(cache.get_latest::<TelemetryRecord>("realtime")).await.flatten() {
                return record;
            }
        }
        if let Some(store) = &self.store {
            if let Ok(Some(record)) = timeout(store.latest_telemetry()).await.unwrap_or(Ok(None)) {
                return record;
            }
        }
        TelemetryRecord::empty(Utc::now(), crate::model::LinkStatus::Disconnected)
    }

    pub async fn history(&self, window: &str) -> Result<Vec<TelemetryRecord>, QueryError> {
        let duration = window_to_duration(window).ok_or(QueryError::NotFound)?;
        match &self.store {
            Some(store) => timeout(store.history(duration, 1000))
                .await
                .unwrap_or(Err(QueryError::DependencyUnavailable)),
            None => Ok(Vec::new()),
        }
    }

    pub async fn cells(&self) -> CellsResponse {
        let record = self.latest_telemetry().await;
        CellsResponse {
            count: record.cells.len(),
            cells: record.cells,
            timestamp: record.timestamp,
        }
    }

    pub async fn alerts(&self, limit: i64) -> Vec<AlertEvent> {
        match &self.store {
            Some(store) => timeout(store.active_alerts(limit)).await.unwrap_or(Ok(Vec::new())).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    pub async fn system_status(&self) -> SystemStatusRecord {
        if let Some(cache) = &self.cache {
            if let Some(status) = timeout(cache.get_latest::<SystemStatusRecord>("status")).await.flatten() {
                return status;
            }
        }
        SystemStatusRecord::zero(Utc::now())
    }

    /// 404 is surfaced as `QueryError::NotFound` by the caller when the id
    /// truly does not exist. Acknowledging twice is a success both times
    /// (idempotent at the store layer).
    pub async fn acknowledge(&self, alert_id: i64) -> Result<(), QueryError> {
        match &self.store {
            Some(store) => timeout(store.acknowledge_alert(alert_id)).await.unwrap_or(Err(QueryError::DependencyUnavailable)),
            None => Err(QueryError::DependencyUnavailable),
        }
    }

    /// Scans the most recent bulk-read payload for registers `[0x20, 0x40)`
    /// that plausibly hold SOC, flagging the one currently configured.
    /// Returns `None` if the scheduler hasn't completed a bulk read yet.
    pub async fn soc_candidates(&self) -> Option<Vec<SocCandidate>> {
        let payload = self.last_bulk_payload.lock().await.clone()?;
        Some(Self::soc_candidates_from_payload(&payload, &self.registers))
    }

    fn soc_candidates_from_payload(payload: &[u8], registers: &RegisterMap) -> Vec<SocCandidate> {
        codec::soc_candidates(payload, registers)
            .into_iter()
            .map(|(register, raw, value, selected)| SocCandidate {
                register,
                raw,
                value,
                selected,
            })
            .collect()
    }
}

fn window_to_duration(window: &str) -> Option<ChronoDuration> {
    match window {
        "1h" => Some(ChronoDuration::hours(1)),
        "24h" => Some(ChronoDuration::hours(24)),
        "7d" => Some(ChronoDuration::hours(168)),
        "30d" => Some(ChronoDuration::hours(720)),
        _ => None,
    }
}

async fn timeout<F: std::future::Future>(fut: F) -> Option<F::Output> {
    tokio::time::timeout(QUERY_DEADLINE, fut).await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;

    #[test]
    fn window_to_duration_matches_the_fixed_set() {
        assert_eq!(window_to_duration("1h"), Some(ChronoDuration::hours(1)));
        assert_eq!(window_to_duration("24h"), Some(ChronoDuration::hours(24)));
        assert_eq!(window_to_duration("7d"), Some(ChronoDuration::hours(168)));
        assert_eq!(window_to_duration("30d"), Some(ChronoDuration::hours(720)));
        assert_eq!(window_to_duration("bogus"), None);
    }

    fn make_query(last_bulk_payload: Option<Vec<u8>>) -> QueryInterface {
        QueryInterface {
            store: None,
            cache: None,
            hub: Hub::new(),
            mqtt_available: false,
            registers: RegisterMap::default(),
            last_bulk_payload: Arc::new(Mutex::new(last_bulk_payload)),
        }
    }

    #[tokio::test]
    async fn soc_candidates_is_none_before_any_bulk_read() {
        let query = make_query(None);
        assert!(query.soc_candidates().await.is_none());
    }

    #[tokio::test]
    async fn soc_candidates_scans_the_cached_bulk_payload() {
        let mut payload = vec![0u8; 124];
        payload[88] = 0x01;
        payload[89] = 0xF4;
        let query = make_query(Some(payload));

        let candidates = query.soc_candidates().await.expect("bulk read cached");
        let selected = candidates.iter().find(|c| c.selected).expect("selected candidate");
        assert_eq!(selected.register, 0x002C);
        assert_eq!(selected.value, 50.0);
    }
}
