//! Call session handlers.
//!
//! - `POST /api/sessions/:device_id/start` - Call the endpoint
//! - `POST /api/sessions/:device_id/answer-call` - Accept a call the endpoint placed
//! - `POST /api/sessions/:device_id/answer` - Answer a ringing endpoint
//! - `POST /api/sessions/:device_id/stop` - Hang up
//! - `POST /api/sessions/:device_id/decline` - Refuse an incoming call
//! - `POST /api/sessions/:device_id/audio` - Queue one raw PCM chunk
//! - `GET /api/sessions` - Registry snapshot

use super::{parse_body, require_non_blank, StoppedResponse};
use crate::actors::{CallState, RegistrySnapshot};
use crate::errors::IntercomError;
use crate::routes::AppState;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use intercom_protocol::Frame;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Where to reach the endpoint.
#[derive(Debug, Deserialize)]
pub struct EndpointTarget {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub success: bool,
    pub state: CallState,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct QueuedResponse {
    pub success: bool,
    /// `false` when the outbound queue was full and the chunk was dropped.
    pub queued: bool,
}

fn parse_target(body: &[u8]) -> Result<EndpointTarget, IntercomError> {
    let target: EndpointTarget = parse_body(body)?;
    require_non_blank("host", &target.host)?;
    if target.port == Some(0) {
        return Err(IntercomError::InvalidRequest("port must be non-zero".to_string()));
    }
    Ok(target)
}

/// Handler for POST /api/sessions/:device_id/start
///
/// # Response
///
/// - 200 OK: `{success, state}` with `streaming` or `ringing`
/// - 400 Bad Request: Missing or blank host
/// - 502 Bad Gateway: Endpoint unreachable
#[instrument(skip_all, name = "intercom.http.start", fields(device_id = %device_id))]
pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    body: Bytes,
) -> Result<Json<StateResponse>, IntercomError> {
    let target = parse_target(&body)?;
    let call_state = state
        .registry
        .start(&device_id, target.host.trim(), target.port)
        .await?;
    Ok(Json(StateResponse {
        success: true,
        state: call_state,
    }))
}

/// Handler for POST /api/sessions/:device_id/answer-call
#[instrument(skip_all, name = "intercom.http.answer_call", fields(device_id = %device_id))]
pub async fn answer_call(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    body: Bytes,
) -> Result<Json<StateResponse>, IntercomError> {
    let target = parse_target(&body)?;
    let call_state = state
        .registry
        .answer_incoming(&device_id, target.host.trim(), target.port)
        .await?;
    Ok(Json(StateResponse {
        success: true,
        state: call_state,
    }))
}

/// Handler for POST /api/sessions/:device_id/answer
///
/// Answers the device's ringing call session, or a ringing bridge whose
/// dest it is.
#[instrument(skip_all, name = "intercom.http.answer", fields(device_id = %device_id))]
pub async fn answer(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Result<Json<SuccessResponse>, IntercomError> {
    state.registry.answer(&device_id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// Handler for POST /api/sessions/:device_id/stop
#[instrument(skip_all, name = "intercom.http.stop", fields(device_id = %device_id))]
pub async fn stop_session(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Json<StoppedResponse> {
    let stopped = state.registry.stop(&device_id).await;
    Json(StoppedResponse {
        success: true,
        stopped,
    })
}

/// Handler for POST /api/sessions/:device_id/decline
#[instrument(skip_all, name = "intercom.http.decline", fields(device_id = %device_id))]
pub async fn decline(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Json<StoppedResponse> {
    let stopped = state.registry.decline(&device_id).await;
    Json(StoppedResponse {
        success: true,
        stopped,
    })
}

/// Handler for POST /api/sessions/:device_id/audio
///
/// The body is one chunk of raw 16 kHz mono PCM. Never waits for the
/// endpoint.
///
/// # Response
///
/// - 202 Accepted: `{success, queued}`
/// - 400 Bad Request: Empty body or longer than one frame payload
/// - 404 Not Found: No call session for the device
/// - 409 Conflict: Session is not streaming yet
pub async fn queue_audio(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<QueuedResponse>), IntercomError> {
    if body.is_empty() {
        return Err(IntercomError::InvalidRequest(
            "audio body must not be empty".to_string(),
        ));
    }
    if body.len() > Frame::MAX_PAYLOAD_SIZE {
        return Err(IntercomError::InvalidRequest(format!(
            "audio body exceeds {} bytes",
            Frame::MAX_PAYLOAD_SIZE
        )));
    }

    let queued = state.registry.queue_audio(&device_id, body).await?;
    if !queued {
        debug!(target: "intercom.handlers", device_id = %device_id, "Audio queue full, chunk dropped");
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(QueuedResponse {
            success: true,
            queued,
        }),
    ))
}

/// Handler for GET /api/sessions
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<RegistrySnapshot> {
    Json(state.registry.snapshot().await)
}
