use anyhow::Context;
use axum::{routing::get, Router};
use meter_sync::api::{HttpMeteringClient, StaticToken};
use meter_sync::config::{load_devices, Config};
use meter_sync::device::{Device, EngineSettings};
use meter_sync::sink::MemoryStore;
use meter_sync::transport::MqttTransport;
use meter_sync::{metrics, rest, validate};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    info!("Starting meter sync");
    info!("Metering API: {}", config.api_url);
    info!("MQTT broker: {}:{}", config.mqtt.broker, config.mqtt.port);
    info!("HTTP server: {}", config.http_addr);
    info!("Hub: {}", config.hub_id);

    // Initialize metrics
    metrics::init_metrics();

    let paired = load_devices(&config.devices_file)
        .with_context(|| format!("Failed to load devices from {}", config.devices_file))?;

    let api = Arc::new(
        HttpMeteringClient::new(
            &config.api_url,
            Arc::new(StaticToken(config.access_token.clone())),
        )
        .context("Failed to build metering API client")?,
    );
    let transport = Arc::new(MqttTransport::new(
        &config.mqtt.broker,
        config.mqtt.port,
        config.mqtt.tls,
    ));
    let store = MemoryStore::new();
    let settings = EngineSettings::from_config(&config);

    let mut devices = Vec::new();
    for device_config in paired {
        if let Err(e) = validate::validate(&device_config) {
            warn!("Skipping device {}: {}", device_config.id, e);
            continue;
        }

        let sink = store.sink_for(&device_config.id);
        let device = Device::new(
            device_config,
            settings.clone(),
            api.clone(),
            transport.clone(),
            sink,
        );
        device.init().await;
        devices.push(device);
    }
    info!("{} device(s) running", devices.len());

    // Build HTTP app with REST API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(store));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    for device in &devices {
        device.remove().await;
    }

    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
