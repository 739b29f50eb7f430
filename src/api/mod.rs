//! HTTP/WS surface: an `axum` router exposing the Query Interface as JSON
//! routes and the Live Push Hub as a `/ws` upgrade, per §6.
//!
//! Grounded in `original_source/bms-monitor/app/api/routes.py` for route
//! shapes, and `prospectorengine-prospector-btc`'s orchestrator app for the
//! `axum` + `tower-http` composition style.

use std::sync::Arc;

use axum::extract::{ws::WebSocketUpgrade, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::hub;
use crate::query::QueryInterface;

pub struct AppState {
    pub query: QueryInterface,
    pub hub: Arc<hub::Hub>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/realtime", get(realtime))
        .route("/api/history/:window", get(history))
        .route("/api/cells", get(cells))
        .route("/api/alerts", get(alerts))
        .route("/api/system-status", get(system_status))
        .route("/api/alerts/:id/acknowledge", post(acknowledge))
        .route("/api/diagnostics/soc-candidates", get(soc_candidates))
        .route("/ws", get(websocket_upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.query.health().await)
}

async fn realtime(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.query.latest_telemetry().await)
}

async fn history(State(state): State<Arc<AppState>>, Path(window): Path<String>) -> impl IntoResponse {
    match state.query.history(&window).await {
        Ok(data) => {
            let start_time = chrono::Utc::now();
            let count = data.len();
            Json(json!({
                "data": data,
                "duration": window,
                "start_time": start_time,
                "count": count,
            }))
            .into_response()
        }
        Err(crate::error::QueryError::NotFound) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown window" }))).into_response()
        }
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "backend unavailable" }))).into_response(),
    }
}

async fn cells(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.query.cells().await)
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    limit: Option<i64>,
}

async fn alerts(State(state): State<Arc<AppState>>, Query(params): Query<AlertsQuery>) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(100);
    let alerts = state.query.alerts(limit).await;
    let count = alerts.len();
    Json(json!({ "alerts": alerts, "count": count }))
}

async fn system_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.query.system_status().await)
}

async fn acknowledge(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.query.acknowledge(id).await {
        Ok(()) => Json(json!({ "message": "acknowledged", "alert_id": id })).into_response(),
        Err(crate::error::QueryError::NotFound) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown alert id", "alert_id": id }))).into_response()
        }
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "backend unavailable" }))).into_response(),
    }
}

async fn soc_candidates(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.query.soc_candidates().await {
        Some(candidates) => Json(json!({ "candidates": candidates })).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "no bulk read completed yet" })),
        )
            .into_response(),
    }
}

async fn websocket_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| hub::handle_socket(socket, hub, None))
}
