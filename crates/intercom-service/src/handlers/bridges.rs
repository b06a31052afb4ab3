//! Bridge handlers.
//!
//! - `POST /api/bridges` - Relay audio between two endpoints
//! - `DELETE /api/bridges/:bridge_id` - Tear a bridge down

use super::{parse_body, require_non_blank, StoppedResponse};
use crate::actors::{BridgeRequest, CallState};
use crate::errors::IntercomError;
use crate::routes::AppState;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

/// Body of `POST /api/bridges`.
#[derive(Debug, Deserialize)]
pub struct CreateBridgeBody {
    #[serde(flatten)]
    pub request: BridgeRequest,
    /// Set when an endpoint asked for the bridge itself. An existing bridge
    /// with the same id then wins instead of being replaced.
    #[serde(default)]
    pub auto: bool,
}

#[derive(Debug, Serialize)]
pub struct BridgeResponse {
    pub success: bool,
    pub bridge_id: String,
    pub state: CallState,
}

fn validate(request: &BridgeRequest) -> Result<(), IntercomError> {
    require_non_blank("source_device_id", &request.source_device_id)?;
    require_non_blank("source_host", &request.source_host)?;
    require_non_blank("dest_device_id", &request.dest_device_id)?;
    require_non_blank("dest_host", &request.dest_host)?;
    if request.source_device_id == request.dest_device_id {
        return Err(IntercomError::InvalidRequest(
            "source and dest must be different devices".to_string(),
        ));
    }
    if request.source_port == Some(0) || request.dest_port == Some(0) {
        return Err(IntercomError::InvalidRequest("port must be non-zero".to_string()));
    }
    Ok(())
}

/// Handler for POST /api/bridges
///
/// # Response
///
/// - 200 OK: `{success, bridge_id, state}` with `connected` or `ringing`
/// - 400 Bad Request: Missing fields or source equals dest
/// - 409 Conflict: `auto` set and the bridge already exists
/// - 502 Bad Gateway: Either endpoint unreachable
#[instrument(skip_all, name = "intercom.http.bridge", fields(bridge_id = tracing::field::Empty))]
pub async fn create_bridge(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<BridgeResponse>, IntercomError> {
    let body: CreateBridgeBody = parse_body(&body)?;
    validate(&body.request)?;

    let bridge_id = body.request.bridge_id();
    tracing::Span::current().record("bridge_id", bridge_id.as_str());

    let call_state = if body.auto {
        state.registry.auto_bridge(&body.request).await?
    } else {
        state.registry.bridge(&body.request).await?
    };
    Ok(Json(BridgeResponse {
        success: true,
        bridge_id,
        state: call_state,
    }))
}

/// Handler for DELETE /api/bridges/:bridge_id
///
/// # Response
///
/// - 200 OK: `{success, stopped}`
/// - 404 Not Found: No bridge with this id
#[instrument(skip_all, name = "intercom.http.bridge_stop", fields(bridge_id = %bridge_id))]
pub async fn delete_bridge(
    State(state): State<Arc<AppState>>,
    Path(bridge_id): Path<String>,
) -> Result<Json<StoppedResponse>, IntercomError> {
    if !state.registry.bridge_stop(&bridge_id).await {
        return Err(IntercomError::BridgeNotFound(bridge_id));
    }
    Ok(Json(StoppedResponse {
        success: true,
        stopped: true,
    }))
}
