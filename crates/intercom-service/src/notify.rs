//! Notification sink.
//!
//! Sessions publish state changes and received audio here. Publishing never
//! blocks: a subscriber that falls behind loses the oldest notifications,
//! and with no subscribers notifications are simply discarded.

use crate::actors::{CallState, Notification};
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::trace;

/// Default number of notifications buffered per subscriber.
pub const DEFAULT_NOTIFICATION_BUFFER: usize = 256;

/// Broadcast handle shared by every session.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFICATION_BUFFER)
    }
}

impl Notifier {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to notifications published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn publish(&self, notification: Notification) {
        if self.sender.send(notification).is_err() {
            trace!(target: "intercom.notify", "No subscribers");
        }
    }

    pub fn session_state(&self, device_id: &str, state: CallState) {
        self.publish(Notification::SessionState {
            device_id: device_id.to_string(),
            state,
        });
    }

    pub fn bridge_state(
        &self,
        bridge_id: &str,
        source_device_id: &str,
        dest_device_id: &str,
        state: CallState,
    ) {
        self.publish(Notification::BridgeState {
            bridge_id: bridge_id.to_string(),
            source_device_id: source_device_id.to_string(),
            dest_device_id: dest_device_id.to_string(),
            state,
        });
    }

    pub fn audio_received(&self, device_id: &str, audio: Bytes) {
        self.publish(Notification::AudioReceived {
            device_id: device_id.to_string(),
            audio,
        });
    }
}
