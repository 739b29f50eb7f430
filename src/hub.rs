//! Live Push Hub: WebSocket fan-out to live subscribers.
//!
//! Grounded in `original_source/bms-monitor/app/api/websocket.py`'s
//! `WebSocketManager`, ported onto `axum`'s WebSocket extractor with the
//! two-task (send/receive) split pattern adapted from
//! `prospectorengine-prospector-btc/apps/orchestrator/src/handlers/stream.rs`,
//! the only pack example with a production `axum` WebSocket handler —
//! simplified to two tasks since this hub needs no command-dispatch worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::SubscriberHandle;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const BROADCAST_CAPACITY: usize = 256;

/// One outbound broadcast message: a topic tag and its JSON payload.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastMessage {
    pub topic: &'static str,
    pub data: serde_json::Value,
    pub timestamp: chrono::DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    Subscribe { topics: Vec<String> },
}

/// Shared hub state: the broadcast sender every subscriber task clones,
/// plus a metadata map used for `system_status`/diagnostics reporting.
/// `broadcast::Sender` is append-only and self-cleaning (a dropped receiver
/// just lags/ends), so no `Mutex<Vec<_>>` of connections is needed here —
/// only the metadata map needs explicit mutual exclusion.
pub struct Hub {
    sender: broadcast::Sender<BroadcastMessage>,
    subscribers: RwLock<HashMap<Uuid, SubscriberHandle>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            sender,
            subscribers: RwLock::new(HashMap::new()),
        })
    }

    pub fn broadcast(&self, topic: &'static str, data: serde_json::Value) {
        let message = BroadcastMessage {
            topic,
            data,
            timestamp: Utc::now(),
        };
        // No receivers is not an error; it just means nobody is subscribed.
        let _ = self.sender.send(message);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn subscriber_snapshot(&self) -> Vec<SubscriberHandle> {
        self.subscribers.read().await.values().cloned().collect()
    }

    async fn register(&self, peer: Option<String>) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.subscribers.write().await.insert(
            id,
            SubscriberHandle {
                id,
                connected_at: now,
                peer,
                last_ping: now,
            },
        );
        id
    }

    async fn touch_ping(&self, id: Uuid) {
        if let Some(handle) = self.subscribers.write().await.get_mut(&id) {
            handle.last_ping = Utc::now();
        }
    }

    async fn unregister(&self, id: Uuid) {
        self.subscribers.write().await.remove(&id);
    }
}

/// Drives one accepted WebSocket connection to completion: sends the
/// welcome envelope, then splits into a send task (broadcast + heartbeat)
/// and a receive task (ping/subscribe handling), and cleans up on either
/// task's exit.
pub async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, peer: Option<String>) {
    let id = hub.register(peer).await;
    let (mut sink, mut stream) = socket.split();

    let welcome = json!({
        "type": "welcome",
        "timestamp": Utc::now(),
        "client_count": hub.subscriber_count().await,
    });
    if sink
        .send(Message::Text(welcome.to_string()))
        .await
        .is_err()
    {
        hub.unregister(id).await;
        return;
    }

    let mut receiver = hub.sender.subscribe();
    // Direct replies (pong / subscription_confirmed) are produced by the
    // receive task but must go out over `sink`, which the send task owns —
    // route them through a per-connection mpsc instead of replying inline.
    let (direct_tx, mut direct_rx) = mpsc::channel::<String>(8);
    let send_hub = hub.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                received = receiver.recv() => {
                    match received {
                        Ok(message) => {
                            let envelope = json!({
                                "topic": message.topic,
                                "data": message.data,
                                "timestamp": message.timestamp,
                            });
                            if sink.send(Message::Text(envelope.to_string())).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "subscriber lagged behind broadcast, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                direct = direct_rx.recv() => {
                    match direct {
                        Some(payload) => {
                            if sink.send(Message::Text(payload)).await.is_err() {
                                break;
                            }
                        }
                        None => {}
                    }
                }
                _ = heartbeat.tick() => {
                    let payload = json!({
                        "type": "heartbeat",
                        "timestamp": Utc::now(),
                        "server_time": Utc::now(),
                    });
                    if sink.send(Message::Text(payload.to_string())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = send_hub;
    });

    let recv_hub = hub.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Ping) => {
                    recv_hub.touch_ping(id).await;
                    let pong = json!({
                        "type": "pong",
                        "timestamp": Utc::now(),
                    });
                    if direct_tx.send(pong.to_string()).await.is_err() {
                        break;
                    }
                }
                Ok(ClientMessage::Subscribe { topics }) => {
                    debug!("subscribe received; no per-topic filtering is applied");
                    let confirmed = json!({
                        "type": "subscription_confirmed",
                        "topics": topics,
                        "timestamp": Utc::now(),
                    });
                    if direct_tx.send(confirmed.to_string()).await.is_err() {
                        break;
                    }
                }
                Err(_) => debug!(raw = %text, "unrecognized client message"),
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.unregister(id).await;
}
