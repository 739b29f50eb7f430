use std::sync::Arc;

use daly_bms_gateway::api::{self, AppState};
use daly_bms_gateway::config::Config;
use daly_bms_gateway::error::GatewayError;
use daly_bms_gateway::hub::Hub;
use daly_bms_gateway::model::SessionCounters;
use daly_bms_gateway::query::QueryInterface;
use daly_bms_gateway::scheduler::{self, SchedulerConfig};
use daly_bms_gateway::sinks::cache::Cache;
use daly_bms_gateway::sinks::fanout::FanOut;
use daly_bms_gateway::sinks::pubsub::PubSub;
use daly_bms_gateway::sinks::store::Store;
use daly_bms_gateway::transport::Transport;
use tokio::sync::{watch, Mutex};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), GatewayError> {
    let config = Config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log_level))
        .init();

    info!(host = %config.host, port = config.port, "starting gateway");

    let store = match &config.database_url {
        Some(url) => match Store::connect(url).await {
            Ok(store) => Some(store),
            Err(e) => {
                error!(error = %e, "durable store unavailable at startup, continuing without it");
                None
            }
        },
        None => None,
    };

    let cache = match &config.redis_url {
        Some(url) => match Cache::connect(url).await {
            Ok(cache) => Some(cache),
            Err(e) => {
                error!(error = %e, "cache unavailable at startup, continuing without it");
                None
            }
        },
        None => None,
    };

    let pubsub = config
        .mqtt_broker_url
        .as_ref()
        .map(|url| PubSub::connect(url, &config.mqtt_client_id));

    let hub = Hub::new();
    let fanout = Arc::new(FanOut::new(store.clone(), cache.clone(), pubsub.clone(), hub.clone()));

    let counters = Arc::new(Mutex::new(SessionCounters::default()));
    let last_bulk_payload = Arc::new(Mutex::new(None));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let transport = Transport::new(config.bms_mac_address.clone(), config.disconnect_helper_path.clone()).await?;
    let scheduler_config = SchedulerConfig {
        poll_interval: config.poll_interval,
        registers: config.registers,
        ..SchedulerConfig::default()
    };
    let query_registers = scheduler_config.registers;

    let scheduler_fanout = fanout.clone();
    let scheduler_last_bulk_payload = last_bulk_payload.clone();
    let scheduler_handle = tokio::spawn(async move {
        scheduler::run(transport, scheduler_config, counters, scheduler_last_bulk_payload, shutdown_rx, move |record| {
            let fanout = scheduler_fanout.clone();
            let alerts = daly_bms_gateway::alerts::synthesize(&record);
            tokio::spawn(async move {
                fanout.publish_telemetry(&record).await;
                for alert in &alerts {
                    fanout.publish_alert(alert).await;
                }
            });
        })
        .await;
    });

    let query = QueryInterface {
        store,
        cache,
        hub: hub.clone(),
        mqtt_available: config.mqtt_broker_url.is_some(),
        registers: query_registers,
        last_bulk_payload,
    };
    let state = Arc::new(AppState { query, hub: hub.clone() });
    let router = api::router(state);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .map_err(GatewayError::Io)?;

    info!(addr = %listener.local_addr().map_err(GatewayError::Io)?, "HTTP/WS surface listening");

    tokio::select! {
        result = axum::serve(listener, router) => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server exited with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    }

    let _ = scheduler_handle.await;
    Ok(())
}
