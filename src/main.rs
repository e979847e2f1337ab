//! Fleet Manager - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use fleet_manager::{
    FileModelStorage, HealthMonitor, HttpConnector, Supervisor, SupervisorConfig, api,
    config::ManagerConfig, metrics,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "fleet-manager")]
#[command(about = "Model-serving fleet supervisor", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override API port
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting Fleet Manager");

    // Load configuration
    let mut config = ManagerConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.port {
        config.api_port = port;
    }

    config.validate()?;

    tracing::info!(
        api_port = config.api_port,
        catalog_file = ?config.catalog_file,
        log_dir = ?config.log_dir,
        workers = config.workers.len(),
        build_slots = config.build_slots,
        tls = config.tls.is_some(),
        "Configuration loaded"
    );

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    // Open the model catalog; its records drive startup reconciliation
    let storage = Arc::new(
        FileModelStorage::open(config.catalog_file.clone())
            .await
            .context("Failed to open model catalog")?,
    );
    let deployments = storage.deployment_records().await;

    let connector = Arc::new(
        HttpConnector::new(Duration::from_secs(config.worker_request_timeout_secs))
            .context("Failed to build worker HTTP client")?,
    );

    let supervisor = Supervisor::new(SupervisorConfig {
        storage,
        connector,
        workers: config.workers.clone(),
        deployments,
        build_slots: config.build_slots,
        log_dir: config.log_dir.clone(),
        rng_seed: None,
    })
    .await
    .context("Failed to start supervisor")?;

    // Start health monitor
    let health_monitor = Arc::new(HealthMonitor::new(
        supervisor.clone(),
        config.worker_ping_interval_secs,
        config.monitor_interval_secs,
        config.monitor_initial_delay_secs,
        config.log_flush_interval_secs,
        config.auto_redeploy,
    ));

    let monitor_handle = tokio::spawn({
        let monitor = health_monitor.clone();
        async move {
            monitor.run().await;
        }
    });

    // Setup API
    let app_state = api::AppState {
        supervisor: supervisor.clone(),
        auth: Arc::new(api::PredictionAuth::new(&config.auth)),
        prometheus_handle,
    };

    let app = api::create_router(app_state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.api_port));

    if let Some(tls) = &config.tls {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let rustls_config =
            axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                .await
                .context("Failed to load TLS certificate")?;

        let handle: axum_server::Handle<std::net::SocketAddr> = axum_server::Handle::new();
        tokio::spawn({
            let handle = handle.clone();
            async move {
                shutdown_signal().await;
                handle.graceful_shutdown(Some(Duration::from_secs(30)));
            }
        });

        tracing::info!(addr = %addr, "Starting API server with TLS");
        axum_server::bind_rustls(addr, rustls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("API server error")?;
    } else {
        tracing::info!(addr = %addr, "Starting API server");

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("Failed to bind API server")?;

        // Graceful shutdown
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("API server error")?;
    }

    tracing::info!("Shutting down...");

    // Stop periodic checks before the final flush
    monitor_handle.abort();

    // Instances keep running on the workers; the next start adopts them
    supervisor.shutdown().await;

    tracing::info!("Shutdown complete");

    Ok(())
}

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
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
