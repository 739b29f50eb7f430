//! Concurrent dispatch across all configured sinks with a per-sink
//! deadline, per §4.5/§5: durable store write precedes cache and pub/sub so
//! that a query reading from cache never observes a record the store
//! doesn't have; none of the three remote sinks delay each other beyond
//! their own timeout.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::warn;

use crate::hub::Hub;
use crate::model::{AlertEvent, SystemStatusRecord, TelemetryRecord};
use crate::sinks::cache::Cache;
use crate::sinks::pubsub::{PubSub, TOPIC_ALERTS, TOPIC_REALTIME, TOPIC_STATUS};
use crate::sinks::store::Store;

const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(2);

pub struct FanOut {
    pub store: Option<Store>,
    pub cache: Option<Cache>,
    pub pubsub: Option<PubSub>,
    pub hub: Arc<Hub>,
    pub sink_timeout: Duration,
}

impl FanOut {
    pub fn new(store: Option<Store>, cache: Option<Cache>, pubsub: Option<PubSub>, hub: Arc<Hub>) -> Self {
        Self {
            store,
            cache,
            pubsub,
            hub,
            sink_timeout: DEFAULT_SINK_TIMEOUT,
        }
    }

    /// Publishes one telemetry record, then its derived alerts, in that
    /// order (invariant 6: every subscriber sees telemetry before alerts
    /// from the same tick).
    pub async fn publish_telemetry(&self, record: &TelemetryRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = with_timeout(self.sink_timeout, store.save_telemetry(record)).await {
                warn!(error = %e, "durable store write failed for telemetry");
            }
        }

        let cache_fut = async {
            if let Some(cache) = &self.cache {
                if let Err(e) = with_timeout(self.sink_timeout, cache.set_latest_and_history("realtime", record)).await {
                    warn!(error = %e, "cache write failed for telemetry");
                }
            }
        };
        let pubsub_fut = async {
            if let Some(pubsub) = &self.pubsub {
                if let Err(e) = with_timeout(self.sink_timeout, pubsub.publish(TOPIC_REALTIME, record)).await {
                    warn!(error = %e, "pub/sub publish failed for telemetry");
                }
            }
        };
        tokio::join!(cache_fut, pubsub_fut);

        self.hub.broadcast("realtime", json!(record));
    }

    pub async fn publish_alert(&self, alert: &AlertEvent) {
        if let Some(store) = &self.store {
            if let Err(e) = with_timeout(self.sink_timeout, store.save_alert(alert)).await {
                warn!(error = %e, "durable store write failed for alert");
            }
        }

        if let Some(pubsub) = &self.pubsub {
            if let Err(e) = with_timeout(self.sink_timeout, pubsub.publish(TOPIC_ALERTS, alert)).await {
                warn!(error = %e, "pub/sub publish failed for alert");
            }
        }

        self.hub.broadcast("alerts", json!(alert));
    }

    pub async fn publish_status(&self, status: &SystemStatusRecord) {
        let cache_fut = async {
            if let Some(cache) = &self.cache {
                if let Err(e) = with_timeout(self.sink_timeout, cache.set_latest_and_history("status", status)).await {
                    warn!(error = %e, "cache write failed for status");
                }
            }
        };
        let pubsub_fut = async {
            if let Some(pubsub) = &self.pubsub {
                if let Err(e) = with_timeout(self.sink_timeout, pubsub.publish(TOPIC_STATUS, status)).await {
                    warn!(error = %e, "pub/sub publish failed for status");
                }
            }
        };
        tokio::join!(cache_fut, pubsub_fut);

        self.hub.broadcast("status", json!(status));
    }
}

async fn with_timeout<T, E: std::fmt::Display>(
    duration: Duration,
    fut: impl std::future::Future<Output = Result<T, E>>,
) -> Result<T, String> {
    match tokio::time::timeout(duration, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("sink timed out".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HealthStatus, LinkStatus};
    use chrono::Utc;

    /// Invariant 6 / S6-adjacent: with no store/cache/pubsub configured
    /// (all `None`), publishing telemetry must not panic and must still
    /// reach the hub — the fan-out degrades gracefully.
    #[tokio::test]
    async fn publish_with_no_sinks_configured_does_not_panic() {
        let hub = Hub::new();
        let fanout = FanOut::new(None, None, None, hub.clone());

        let record = TelemetryRecord {
            timestamp: Utc::now(),
            total_voltage: Some(26.5),
            current: Some(0.0),
            direction: None,
            power: Some(0.0),
            soc: Some(50.0),
            temperature: Some(24.3),
            cells: vec![3.3; 8],
            temperatures: vec![24.3],
            status: HealthStatus::Normal,
            connection_status: LinkStatus::Connected,
        };

        fanout.publish_telemetry(&record).await;
    }
}
