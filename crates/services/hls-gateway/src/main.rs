//! RTSP → HLS Gateway Binary
//!
//! Entry point for the gateway service.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtsp_hls_gateway::{
    api::{build_router, AppState},
    config::Config,
    controller::SessionController,
    events::NotificationPublisher,
    registry::{FsProcessStore, ProcessRegistry},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting RTSP → HLS Gateway...");

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GATEWAY_CONFIG").ok());
    let config = Arc::new(Config::load(config_path)?);

    tracing::info!(
        "Configuration: HTTP port={}, storage={}, transcoder={}, ready timeout={}s",
        config.server.http_port,
        config.storage.root.display(),
        config.transcoder.binary,
        config.readiness.timeout_secs
    );

    tokio::fs::create_dir_all(&config.storage.root)
        .await
        .with_context(|| format!("creating {}", config.storage.root.display()))?;

    let registry = match &config.registry.state_dir {
        Some(dir) => {
            let store = FsProcessStore::open(dir)
                .await
                .with_context(|| format!("opening process store {}", dir.display()))?;
            tracing::info!("Durable process records in {}", dir.display());
            ProcessRegistry::with_store(Arc::new(store))
        }
        None => ProcessRegistry::new(),
    };

    let publisher =
        NotificationPublisher::new(config.events.topic.clone(), config.events.channel_capacity);
    let controller = Arc::new(SessionController::new(
        config.clone(),
        Arc::new(registry),
        publisher,
    ));

    // Create shutdown signal channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Spawn expiry reaper
    let reaper_handle = {
        let controller = controller.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        let interval = config.registry.reap_interval();
        tokio::spawn(async move {
            controller.run_reaper(interval, shutdown_rx).await;
        })
    };

    let state = AppState::new(controller.clone(), config.clone());
    let router = build_router(state);

    let bind_addr = format!("{}:{}", config.server.host, config.server.http_port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("HTTP server listening on {}", bind_addr);

    // Run the HTTP server with graceful shutdown on SIGTERM/SIGINT.
    // In-flight starts are cancelled first so the drain does not wait on them.
    let shutdown_tx_clone = shutdown_tx.clone();
    let controller_clone = controller.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, initiating graceful shutdown...");
            let _ = shutdown_tx_clone.send(());
            controller_clone.shutdown().await;
        })
        .await?;

    let _ = shutdown_tx.send(());

    // Anything registered while the server drained
    controller.shutdown().await;

    let _ = reaper_handle.await;

    tracing::info!("RTSP → HLS Gateway shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
