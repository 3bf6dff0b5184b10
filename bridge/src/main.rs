mod broadcaster;
mod commands;
mod config;
mod db;
mod dispatcher;
mod errors;
mod metrics;
mod model;
mod registry;
mod rest;
mod validate;

use anyhow::Context;
use axum::{routing::get, Router};
use broadcaster::Broadcaster;
use commands::CommandService;
use config::Config;
use db::PgDeviceRegistry;
use dispatcher::{run_bridge, Dispatcher};
use registry::{DeviceRegistry, InMemoryRegistry};
use rest::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use transport::{MqttTransport, Transport, TransportConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting MQTT bridge");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("HTTP server: {}", config.http_addr);
    info!("CORS origin: {}", config.cors_origin);
    info!("Database: {}", config.database_host());

    metrics::init_metrics().context("failed to register metrics")?;

    let registry: Arc<dyn DeviceRegistry> = match &config.database_url {
        Some(url) => {
            let pool = db::make_pool(url)
                .await
                .context("failed to connect to database")?;
            Arc::new(PgDeviceRegistry::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set, device registry is kept in memory");
            Arc::new(InMemoryRegistry::new())
        }
    };

    let client_id = format!("bridge-{}", uuid::Uuid::new_v4());
    let mut transport_config =
        TransportConfig::new(&config.mqtt_broker, config.mqtt_port, client_id);
    transport_config.channel_capacity = config.channel_capacity;
    let transport: Arc<dyn Transport> = Arc::new(MqttTransport::new(transport_config));

    let broadcaster = Broadcaster::new(config.channel_capacity);
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), broadcaster.clone()));

    let bridge_transport = Arc::clone(&transport);
    let backoff = config.reconnect_backoff;
    let bridge_handle = tokio::spawn(async move {
        if let Err(e) = run_bridge(bridge_transport, dispatcher, backoff).await {
            error!("Bridge task failed: {}", e);
        }
    });

    let state = AppState {
        registry: Arc::clone(&registry),
        commands: Arc::new(CommandService::new(registry, Arc::clone(&transport))),
        broadcaster,
        sse_timeout: config.sse_timeout,
    };

    // Build HTTP app with REST API and metrics endpoint
    let cors = rest::cors_layer(&config.cors_origin).context("failed to build CORS policy")?;
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(state))
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = bridge_handle => {
            error!("Bridge task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    if let Err(e) = transport.disconnect().await {
        warn!("Failed to disconnect from broker cleanly: {}", e);
    }
    info!("Shutting down");
    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
