use anyhow::{Context, Result};
use snapshot_trigger::config::{Config, LoggingConfig};
use snapshot_trigger::{
    rate_limiter_for, EventDispatcher, EventFilter, HttpCameraApi, ImageStore, MessageLog,
    MqttConsumer, SnapshotWorkflow,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        broker = %format!("{}:{}", config.mqtt.host, config.mqtt.port),
        "Starting snapshot trigger service"
    );

    config.validate().context("Invalid configuration")?;

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    // Initialize components
    let camera_api = Arc::new(
        HttpCameraApi::new(&config.camera_api).context("Failed to initialize camera API client")?,
    );
    let image_store = ImageStore::new(
        config.storage.output_dir.clone(),
        config.storage.timestamp_format.clone(),
    );
    let workflow = Arc::new(SnapshotWorkflow::new(
        camera_api,
        image_store,
        config.workflow.clone(),
    ));
    let message_log = Arc::new(
        MessageLog::open(&config.storage.message_log_path)
            .await
            .context("Failed to open message log")?,
    );

    let dispatcher = Arc::new(
        EventDispatcher::new(
            EventFilter::new(config.trigger.clone()),
            rate_limiter_for(&config.rate_limit),
            workflow,
            config.workflow.dispatch,
            config.workflow.max_concurrent_jobs,
        )
        .with_message_log(message_log),
    );

    info!(
        cooldown_secs = config.rate_limit.cooldown_secs,
        scope = ?config.rate_limit.scope,
        dispatch = ?config.workflow.dispatch,
        poll_strategy = ?config.workflow.poll_strategy,
        "Snapshot pipeline configured"
    );

    // Spawn MQTT consumer task
    let consumer = Arc::new(MqttConsumer::new(config.mqtt.clone()));
    let consumer_handle = tokio::spawn({
        let consumer = consumer.clone();
        let dispatcher = dispatcher.clone();
        async move {
            if let Err(e) = consumer.run(dispatcher).await {
                error!(error = %e, "MQTT consumer error");
            }
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down snapshot trigger service");
    consumer.shutdown();
    if let Err(e) = consumer_handle.await {
        error!(error = %e, "MQTT consumer task failed");
    }

    // Let captures already in flight finish writing their image
    let grace = config.workflow.deadline();
    if tokio::time::timeout(grace, dispatcher.drain()).await.is_err() {
        warn!(grace_secs = grace.as_secs(), "Snapshot jobs still running at shutdown");
    }

    info!("Snapshot trigger service stopped");

    Ok(())
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = log_filter(config, std::env::var("RUST_LOG").ok().as_deref())?;
    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .init();
    }

    Ok(())
}

/// `RUST_LOG` when set, otherwise the configured level for this crate.
fn log_filter(config: &LoggingConfig, rust_log: Option<&str>) -> Result<EnvFilter> {
    if let Some(directives) = rust_log.filter(|d| !d.trim().is_empty()) {
        return Ok(EnvFilter::try_new(directives)?);
    }

    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    Ok(EnvFilter::try_new(format!(
        "snapshot_trigger={},rumqttc=warn,reqwest=info",
        level
    ))?)
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
