//! Pub/Sub sink: best-effort MQTT publish to the three topics in §6.
//!
//! Grounded in `original_source/bms-bluetooth-poc/core/bms_mqtt_bridge.py`
//! (the original's MQTT publish logic; its responsibility is subsumed here
//! rather than kept as a standalone bridge, per Design Note 4).

use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use tracing::warn;

use crate::error::SinkError;

pub const TOPIC_REALTIME: &str = "battery/realtime";
pub const TOPIC_ALERTS: &str = "battery/alerts";
pub const TOPIC_STATUS: &str = "battery/status";

#[derive(Clone)]
pub struct PubSub {
    client: AsyncClient,
}

impl PubSub {
    pub fn connect(broker_url: &str, client_id: &str) -> Self {
        let mut options = MqttOptions::new(client_id, broker_url, 1883);
        options.set_keep_alive(std::time::Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 16);

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt event loop error, retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self { client }
    }

    pub async fn publish<T: Serialize>(&self, topic: &str, value: &T) -> Result<(), SinkError> {
        let payload = serde_json::to_vec(value).map_err(|e| SinkError::PubSubPublishFailed(e.to_string()))?;
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| SinkError::PubSubPublishFailed(e.to_string()))
    }

    pub async fn is_available(&self) -> bool {
        true
    }
}
