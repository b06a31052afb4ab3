//! HTTP request handlers for the intercom control API.

pub mod bridges;
pub mod events;
pub mod metrics;
pub mod sessions;

pub use bridges::{create_bridge, delete_bridge};
pub use events::event_stream;
pub use metrics::metrics_handler;
pub use sessions::{
    answer, answer_call, decline, list_sessions, queue_audio, start_session, stop_session,
};

use crate::errors::IntercomError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// `{success, stopped}` body of the stop-style commands.
#[derive(Debug, Serialize)]
pub struct StoppedResponse {
    pub success: bool,
    pub stopped: bool,
}

/// Parse a JSON body by hand so malformed input answers 400 in the error
/// shape of the API instead of axum's 422 plain text.
pub(crate) fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, IntercomError> {
    serde_json::from_slice(body).map_err(|e| {
        debug!(target: "intercom.handlers", error = %e, "Invalid request body");
        IntercomError::InvalidRequest("Invalid request body".to_string())
    })
}

/// Reject blank values of a required field.
pub(crate) fn require_non_blank(field: &'static str, value: &str) -> Result<(), IntercomError> {
    if value.trim().is_empty() {
        return Err(IntercomError::InvalidRequest(format!("{field} must not be empty")));
    }
    Ok(())
}
