//! Server-Sent Events stream of notifications.
//!
//! Each notification becomes one event named after its kind
//! (`intercom_state`, `intercom_bridge_state`, `intercom_audio`) with the
//! JSON notification as data. A client that falls behind loses the oldest
//! notifications and keeps its stream. Streams end on process shutdown.

use crate::actors::Notification;
use crate::routes::AppState;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

/// Handler for GET /api/events
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!(target: "intercom.handlers.events", "Event subscriber connected");

    let stream = BroadcastStream::new(state.registry.notifier().subscribe())
        .filter_map(|received| async move { to_event(received).map(Ok) })
        .take_until(state.shutdown.clone().cancelled_owned());

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_event(received: Result<Notification, BroadcastStreamRecvError>) -> Option<Event> {
    match received {
        Ok(notification) => match Event::default()
            .event(notification.kind())
            .json_data(&notification)
        {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(target: "intercom.handlers.events", error = %e, "Failed to encode notification");
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            debug!(target: "intercom.handlers.events", skipped, "Event subscriber lagged");
            None
        }
    }
}
