//! Intercom service error types.
//!
//! Transport and protocol failures stay inside the endpoint connection and
//! surface to sessions only as events. The errors here are what operations
//! return to their callers; each maps to a stable short code and a
//! client-safe message. Host addresses are logged, never returned.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use intercom_protocol::CodecError;
use serde::Serialize;
use thiserror::Error;

/// Intercom service error type.
#[derive(Debug, Error)]
pub enum IntercomError {
    /// TCP connect failed or timed out.
    #[error("Connect failed: {0}")]
    ConnectFailure(String),

    /// Peer declared a payload longer than the protocol allows.
    #[error("Protocol desync: {0}")]
    ProtocolDesync(String),

    /// Writing to the endpoint failed.
    #[error("Send failed: {0}")]
    SendFailure(String),

    /// A bounded wait elapsed.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Operation requires a connected endpoint.
    #[error("Not connected")]
    NotConnected,

    /// Operation requires an active audio stream.
    #[error("Not streaming")]
    NotStreaming,

    /// Answer attempted while nothing is ringing.
    #[error("Not ringing")]
    NotRinging,

    /// No session for the identifier.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// No bridge for the identifier.
    #[error("Bridge not found: {0}")]
    BridgeNotFound(String),

    /// A bridge with this id is already registered.
    #[error("Already bridging: {0}")]
    AlreadyBridging(String),

    /// Malformed request from the control API.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The session was stopped while the operation was in flight.
    #[error("Cancelled")]
    Cancelled,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntercomError {
    /// Returns the short error code reported to external callers.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            IntercomError::ConnectFailure(_) | IntercomError::Timeout(_) => "connection_failed",
            IntercomError::ProtocolDesync(_) | IntercomError::SendFailure(_) => "connection_lost",
            IntercomError::NotConnected
            | IntercomError::NotStreaming
            | IntercomError::NotRinging => "invalid_state",
            IntercomError::SessionNotFound(_) | IntercomError::BridgeNotFound(_) => "not_found",
            IntercomError::AlreadyBridging(_) => "already_bridging",
            IntercomError::InvalidRequest(_) => "invalid_request",
            IntercomError::Cancelled => "cancelled",
            IntercomError::Internal(_) => "internal_error",
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            IntercomError::ConnectFailure(_) | IntercomError::Timeout(_) => {
                "Failed to connect to endpoint".to_string()
            }
            IntercomError::ProtocolDesync(_) | IntercomError::SendFailure(_) => {
                "Connection to endpoint lost".to_string()
            }
            IntercomError::NotConnected => "Endpoint is not connected".to_string(),
            IntercomError::NotStreaming => "Endpoint is not streaming".to_string(),
            IntercomError::NotRinging => "Endpoint is not ringing".to_string(),
            IntercomError::SessionNotFound(id) => format!("No session or bridge for {id}"),
            IntercomError::BridgeNotFound(id) => format!("Bridge not found: {id}"),
            IntercomError::AlreadyBridging(id) => format!("Bridge already exists: {id}"),
            IntercomError::InvalidRequest(reason) => reason.clone(),
            IntercomError::Cancelled => "Call was stopped".to_string(),
            IntercomError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// HTTP status used by the control API.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            IntercomError::ConnectFailure(_)
            | IntercomError::Timeout(_)
            | IntercomError::ProtocolDesync(_)
            | IntercomError::SendFailure(_) => StatusCode::BAD_GATEWAY,
            IntercomError::NotConnected
            | IntercomError::NotStreaming
            | IntercomError::NotRinging
            | IntercomError::AlreadyBridging(_)
            | IntercomError::Cancelled => StatusCode::CONFLICT,
            IntercomError::SessionNotFound(_) | IntercomError::BridgeNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            IntercomError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            IntercomError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Failure body returned by the control API.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub state: &'static str,
    pub code: &'static str,
    pub message: String,
}

impl IntoResponse for IntercomError {
    fn into_response(self) -> Response {
        if let IntercomError::Internal(detail) = &self {
            tracing::error!(target: "intercom.http", error = %detail, "Internal error");
        } else {
            tracing::debug!(target: "intercom.http", error = %self, "Request failed");
        }

        let body = ErrorResponse {
            success: false,
            state: "error",
            code: self.error_code(),
            message: self.client_message(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<CodecError> for IntercomError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::ProtocolDesync { .. } => IntercomError::ProtocolDesync(err.to_string()),
            CodecError::PayloadTooLarge(_) => IntercomError::SendFailure(err.to_string()),
            CodecError::InsufficientData | CodecError::UnknownMessageType { .. } => {
                IntercomError::Internal(err.to_string())
            }
        }
    }
}
