//! HTTP routes for the intercom service.
//!
//! Defines the Axum router and application state.

use crate::actors::SessionRegistry;
use crate::handlers;
use crate::middleware::http_metrics_middleware;
use crate::observability::{health_router, HealthState};
use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Upper bound on a command request. Covers two connect timeouts plus both
/// reply waits of a bridge handshake.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Live call sessions and bridges.
    pub registry: Arc<SessionRegistry>,

    /// Cancelled on process shutdown; ends open event streams.
    pub shutdown: CancellationToken,
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/health`, `/ready` - Liveness and readiness probes
/// - `/metrics` - Prometheus metrics
/// - `/api/sessions/...` - Call session commands and snapshot
/// - `/api/bridges` - Bridge commands
/// - `/api/events` - Notification stream (no request timeout)
/// - TraceLayer for request logging
/// - HTTP metrics middleware on every response
pub fn build_routes(
    state: Arc<AppState>,
    health_state: Arc<HealthState>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let command_routes = Router::new()
        .route("/api/sessions", get(handlers::list_sessions))
        .route("/api/sessions/:device_id/start", post(handlers::start_session))
        .route("/api/sessions/:device_id/answer-call", post(handlers::answer_call))
        .route("/api/sessions/:device_id/answer", post(handlers::answer))
        .route("/api/sessions/:device_id/stop", post(handlers::stop_session))
        .route("/api/sessions/:device_id/decline", post(handlers::decline))
        .route("/api/sessions/:device_id/audio", post(handlers::queue_audio))
        .route("/api/bridges", post(handlers::create_bridge))
        .route("/api/bridges/:bridge_id", delete(handlers::delete_bridge))
        .with_state(state.clone())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    // The event stream lives as long as the client keeps it open.
    let event_routes = Router::new()
        .route("/api/events", get(handlers::event_stream))
        .with_state(state);

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    command_routes
        .merge(event_routes)
        .merge(metrics_routes)
        .merge(health_router(health_state))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(http_metrics_middleware))
}
