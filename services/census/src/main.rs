use anyhow::{Context, Result};
use census_service::config::Config;
use census_service::household_store::PgHouseholdStore;
use census_service::photo_upload::PhotoUploader;
use census_service::s3_gateway::{PhotoGateway, S3ObjectStore};
use census_service::transcoder::Transcoder;
use census_service::{start_api_server, AppState};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        environment = %config.service.environment,
        "Starting Census Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let household_store = Arc::new(
        PgHouseholdStore::new(&config.database)
            .await
            .context("Failed to initialize household store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        household_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let object_store = Arc::new(
        S3ObjectStore::new(&config.s3)
            .await
            .context("Failed to initialize S3 object store")?,
    );

    let gateway = PhotoGateway::new(object_store, &config.s3, config.service.environment);
    let photos = Arc::new(PhotoUploader::new(
        gateway,
        Transcoder::default(),
        &config.s3,
        &config.upload,
    ));

    let api_state = AppState {
        store: household_store,
        photos,
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = ?e, "API server error");
        }
    });

    info!("Census service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down census service");

    api_handle.abort();

    info!("Census service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
