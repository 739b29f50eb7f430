//! Cache sink: overwrite-latest plus short-TTL time-series, backed by
//! Redis.
//!
//! Grounded in `original_source/bms-monitor/app/services/cache_service.py`
//! (`set_latest_data`/`get_latest_data`, `set_history_data`, key scheme and
//! TTLs verbatim: `latest:*` 300s, `history:*` 86400s).

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::SinkError;

const LATEST_TTL_SECONDS: u64 = 300;
const HISTORY_TTL_SECONDS: u64 = 86_400;

#[derive(Clone)]
pub struct Cache {
    conn: ConnectionManager,
}

impl Cache {
    pub async fn connect(redis_url: &str) -> Result<Self, SinkError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| SinkError::CacheUnavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| SinkError::CacheUnavailable(e.to_string()))?;
        Ok(Self { conn })
    }

    pub async fn is_available(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await.is_ok()
    }

    /// Overwrites `latest:{topic}` (5 min TTL) and writes a
    /// `history:{iso-timestamp}` entry (24 h TTL).
    pub async fn set_latest_and_history<T: Serialize>(
        &self,
        topic: &str,
        value: &T,
    ) -> Result<(), SinkError> {
        let payload = serde_json::to_string(value).map_err(|e| SinkError::CacheUnavailable(e.to_string()))?;
        let mut conn = self.conn.clone();

        conn.set_ex::<_, _, ()>(format!("latest:{topic}"), &payload, LATEST_TTL_SECONDS)
            .await
            .map_err(|e| SinkError::CacheUnavailable(e.to_string()))?;

        let history_key = format!("history:{}", Utc::now().to_rfc3339());
        conn.set_ex::<_, _, ()>(&history_key, &payload, HISTORY_TTL_SECONDS)
            .await
            .map_err(|e| SinkError::CacheUnavailable(e.to_string()))?;

        Ok(())
    }

    pub async fn get_latest<T: DeserializeOwned>(&self, topic: &str) -> Option<T> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(format!("latest:{topic}")).await.ok()?;
        payload.and_then(|p| serde_json::from_str(&p).ok())
    }
}
