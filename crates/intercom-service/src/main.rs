//! Intercom Service
//!
//! Entry point for the intercom audio relay. Serves the control API, the
//! notification stream, health probes and metrics on one HTTP listener.

use intercom_service::actors::SessionRegistry;
use intercom_service::config::Config;
use intercom_service::notify::Notifier;
use intercom_service::observability::{metrics::init_metrics_recorder, HealthState};
use intercom_service::routes::{self, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "intercom_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Intercom Service");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        service_id = %config.service_id,
        bind_address = %config.http_bind_address,
        endpoint_port = config.endpoint_port,
        audio_queue_capacity = config.audio_queue_capacity,
        "Configuration loaded successfully"
    );

    let metrics_handle = init_metrics_recorder().map_err(|e| {
        error!("Failed to initialize metrics: {}", e);
        anyhow::anyhow!(e)
    })?;

    let registry = Arc::new(SessionRegistry::new(
        config.session_settings(),
        Notifier::default(),
    ));
    let health_state = Arc::new(HealthState::new());

    let shutdown = CancellationToken::new();

    let state = Arc::new(AppState {
        registry: Arc::clone(&registry),
        shutdown: shutdown.clone(),
    });
    let app = routes::build_routes(state, Arc::clone(&health_state), metrics_handle);

    let addr: SocketAddr = config.http_bind_address.parse().map_err(|e| {
        error!("Invalid bind address: {}", e);
        e
    })?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    health_state.set_ready();
    info!("Intercom Service listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            health_state.set_not_ready();
            // Hang up every endpoint first so event subscribers see the
            // final state changes, then close their streams.
            registry.shutdown().await;
            shutdown.cancel();
        })
        .await?;

    info!("Intercom Service shutdown complete");

    Ok(())
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
