//! `SessionRegistry` - the live call sessions and bridges.
//!
//! At most one call session per device identifier and one bridge per bridge
//! identifier. Every insert, replace and remove happens under one lock;
//! stopping and starting happen outside it so a slow endpoint never blocks
//! other requests.
//!
//! Replacement order: the new entry is registered, the incumbent is stopped
//! completely, and only then does the new entry connect. A bridge is
//! therefore registered before its handshake, which lets `auto_bridge`
//! reject a duplicate that arrives mid-connect.
//!
//! Handshakes run on their own task. A caller that gives up (request
//! timeout, client gone) only stops waiting: the handshake still finishes,
//! and a failed one is still unregistered.

use super::bridge::{BridgeSession, EndpointSpec};
use super::call::{CallSession, SessionSettings};
use super::messages::CallState;
use crate::errors::IntercomError;
use crate::notify::Notifier;
use crate::observability::metrics;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, Instrument};

/// Display name used when a bridge request does not give one.
pub const DEFAULT_DISPLAY_NAME: &str = "Intercom";

/// Parameters of a bridge between two endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BridgeRequest {
    pub source_device_id: String,
    pub source_host: String,
    #[serde(default)]
    pub source_port: Option<u16>,
    #[serde(default)]
    pub source_name: Option<String>,
    pub dest_device_id: String,
    pub dest_host: String,
    #[serde(default)]
    pub dest_port: Option<u16>,
    #[serde(default)]
    pub dest_name: Option<String>,
}

impl BridgeRequest {
    /// Identifier the bridge will be registered under.
    #[must_use]
    pub fn bridge_id(&self) -> String {
        BridgeSession::id_for(&self.source_device_id, &self.dest_device_id)
    }

    fn endpoints(&self, default_port: u16) -> (EndpointSpec, EndpointSpec) {
        let display_name = |name: &Option<String>| {
            name.as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .unwrap_or(DEFAULT_DISPLAY_NAME)
                .to_string()
        };
        (
            EndpointSpec {
                device_id: self.source_device_id.clone(),
                host: self.source_host.clone(),
                port: self.source_port.unwrap_or(default_port),
                name: display_name(&self.source_name),
            },
            EndpointSpec {
                device_id: self.dest_device_id.clone(),
                host: self.dest_host.clone(),
                port: self.dest_port.unwrap_or(default_port),
                name: display_name(&self.dest_name),
            },
        )
    }
}

/// A call session as listed by [`SessionRegistry::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub device_id: String,
    pub host: String,
    pub port: u16,
    pub state: CallState,
}

/// A bridge as listed by [`SessionRegistry::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeSummary {
    pub bridge_id: String,
    pub source_device_id: String,
    pub dest_device_id: String,
    pub state: CallState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    pub sessions: Vec<SessionSummary>,
    pub bridges: Vec<BridgeSummary>,
}

#[derive(Default)]
struct Entries {
    sessions: HashMap<String, CallSession>,
    bridges: HashMap<String, BridgeSession>,
}

impl Entries {
    /// Forget sessions and bridges that ended on their own.
    fn prune(&mut self) {
        self.sessions.retain(|_, session| !session.has_ended());
        self.bridges.retain(|_, bridge| !bridge.is_stopped());
    }

    fn take_bridges_involving(&mut self, device_id: &str) -> Vec<BridgeSession> {
        let ids: Vec<String> = self
            .bridges
            .iter()
            .filter(|(_, bridge)| bridge.involves(device_id))
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.bridges.remove(id))
            .collect()
    }

    /// Remove `session` unless a newer session replaced it already.
    fn remove_session(&mut self, session: &CallSession) {
        let registered = self
            .sessions
            .get(session.device_id())
            .is_some_and(|current| current.same_as(session));
        if registered {
            self.sessions.remove(session.device_id());
        }
    }

    /// Remove `bridge` unless a newer bridge replaced it already.
    fn remove_bridge(&mut self, bridge: &BridgeSession) {
        let registered = self
            .bridges
            .get(bridge.bridge_id())
            .is_some_and(|current| current.same_as(bridge));
        if registered {
            self.bridges.remove(bridge.bridge_id());
        }
    }

    fn publish_gauges(&self) {
        metrics::set_sessions_active(self.sessions.len());
        metrics::set_bridges_active(self.bridges.len());
    }
}

/// Which handshake a newly registered call session runs.
#[derive(Debug, Clone, Copy)]
enum CallStart {
    Outgoing,
    Incoming,
}

/// Everything removed from the registry by one operation, to be stopped
/// outside the lock.
#[derive(Default)]
struct Evicted {
    sessions: Vec<CallSession>,
    bridges: Vec<BridgeSession>,
}

impl Evicted {
    fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.bridges.is_empty()
    }

    async fn stop_all(self) {
        for session in self.sessions {
            session.stop().await;
        }
        for bridge in self.bridges {
            bridge.stop().await;
        }
    }
}

/// Registry of live call sessions and bridges.
pub struct SessionRegistry {
    entries: Arc<Mutex<Entries>>,
    settings: SessionSettings,
    notifier: Notifier,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(settings: SessionSettings, notifier: Notifier) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries::default())),
            settings,
            notifier,
        }
    }

    /// The sink every session publishes to.
    #[must_use]
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Call `device_id`, replacing any session it already has.
    ///
    /// # Errors
    ///
    /// Whatever [`CallSession::start`] reports; the failed session is
    /// unregistered.
    #[instrument(skip_all, name = "intercom.registry.start", fields(device_id = %device_id))]
    pub async fn start(
        &self,
        device_id: &str,
        host: &str,
        port: Option<u16>,
    ) -> Result<CallState, IntercomError> {
        let session = self.register_session(device_id, host, port).await;
        self.run_call_start(session, CallStart::Outgoing).await
    }

    /// Accept a call `device_id` placed itself, replacing any session it
    /// already has.
    ///
    /// # Errors
    ///
    /// Whatever [`CallSession::answer_incoming`] reports.
    #[instrument(skip_all, name = "intercom.registry.answer_incoming", fields(device_id = %device_id))]
    pub async fn answer_incoming(
        &self,
        device_id: &str,
        host: &str,
        port: Option<u16>,
    ) -> Result<CallState, IntercomError> {
        let session = self.register_session(device_id, host, port).await;
        self.run_call_start(session, CallStart::Incoming).await
    }

    async fn register_session(&self, device_id: &str, host: &str, port: Option<u16>) -> CallSession {
        let session = CallSession::new(
            device_id,
            host,
            port.unwrap_or(self.settings.default_port),
            self.settings.clone(),
            self.notifier.clone(),
        );

        let previous = {
            let mut entries = self.entries.lock().await;
            entries.prune();
            let previous = entries
                .sessions
                .insert(device_id.to_string(), session.clone());
            entries.publish_gauges();
            previous
        };

        if let Some(previous) = previous {
            info!(target: "intercom.registry", device_id, "Replacing existing session");
            previous.stop().await;
        }
        session
    }

    async fn run_call_start(
        &self,
        session: CallSession,
        start: CallStart,
    ) -> Result<CallState, IntercomError> {
        let entries = Arc::clone(&self.entries);
        let handshake = async move {
            let result = match start {
                CallStart::Outgoing => session.start().await,
                CallStart::Incoming => session.answer_incoming().await,
            };
            if result.is_err() {
                let mut entries = entries.lock().await;
                entries.remove_session(&session);
                entries.publish_gauges();
            }
            result
        };
        tokio::spawn(handshake.in_current_span())
            .await
            .map_err(|e| IntercomError::Internal(format!("call start task failed: {e}")))?
    }

    /// Stop the call session of `device_id` and every bridge it is part of.
    /// Returns whether anything was stopped.
    #[instrument(skip_all, name = "intercom.registry.stop", fields(device_id = %device_id))]
    pub async fn stop(&self, device_id: &str) -> bool {
        let evicted = self.evict_device(device_id).await;
        let found = !evicted.is_empty();
        evicted.stop_all().await;
        found
    }

    /// Refuse an incoming call on `device_id`. Same effect as
    /// [`SessionRegistry::stop`].
    #[instrument(skip_all, name = "intercom.registry.decline", fields(device_id = %device_id))]
    pub async fn decline(&self, device_id: &str) -> bool {
        let evicted = self.evict_device(device_id).await;
        let found = !evicted.is_empty();
        info!(target: "intercom.registry", device_id, found, "Declining call");
        evicted.stop_all().await;
        found
    }

    async fn evict_device(&self, device_id: &str) -> Evicted {
        let mut entries = self.entries.lock().await;
        entries.prune();
        let evicted = Evicted {
            sessions: entries.sessions.remove(device_id).into_iter().collect(),
            bridges: entries.take_bridges_involving(device_id),
        };
        entries.publish_gauges();
        evicted
    }

    /// Answer for `device_id`: its ringing call session, or else a ringing
    /// bridge whose dest it is.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` if neither exists, `NotRinging` if nothing rings.
    pub async fn answer(&self, device_id: &str) -> Result<(), IntercomError> {
        let (session, bridge) = {
            let mut entries = self.entries.lock().await;
            entries.prune();
            let session = entries.sessions.get(device_id).cloned();
            let bridge = entries
                .bridges
                .values()
                .find(|bridge| bridge.dest().device_id == device_id)
                .cloned();
            (session, bridge)
        };

        match (session, bridge) {
            (Some(session), _) => session.answer().await,
            (None, Some(bridge)) => bridge.answer_dest().await,
            (None, None) => Err(IntercomError::SessionNotFound(device_id.to_string())),
        }
    }

    /// Hand audio to the streaming call session of `device_id`. Never
    /// waits; `Ok(false)` means the queue was full and the frame dropped.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` without a session, `NotStreaming` before it streams.
    pub async fn queue_audio(&self, device_id: &str, audio: Bytes) -> Result<bool, IntercomError> {
        let session = self
            .entries
            .lock()
            .await
            .sessions
            .get(device_id)
            .cloned()
            .ok_or_else(|| IntercomError::SessionNotFound(device_id.to_string()))?;
        if !session.is_active() {
            return Err(IntercomError::NotStreaming);
        }
        Ok(session.queue_audio(audio))
    }

    /// Bridge two endpoints, replacing an existing bridge with the same id
    /// and ending both devices' call sessions.
    ///
    /// # Errors
    ///
    /// Whatever [`BridgeSession::start`] reports; the failed bridge is
    /// unregistered.
    #[instrument(skip_all, name = "intercom.registry.bridge", fields(bridge_id = %request.bridge_id()))]
    pub async fn bridge(&self, request: &BridgeRequest) -> Result<CallState, IntercomError> {
        let bridge = self.new_bridge(request);

        let evicted = {
            let mut entries = self.entries.lock().await;
            entries.prune();
            let mut evicted = Evicted::default();
            if let Some(previous) = entries
                .bridges
                .insert(bridge.bridge_id().to_string(), bridge.clone())
            {
                info!(target: "intercom.registry", "Replacing existing bridge");
                evicted.bridges.push(previous);
            }
            for device_id in [&request.source_device_id, &request.dest_device_id] {
                evicted.sessions.extend(entries.sessions.remove(device_id.as_str()));
            }
            entries.publish_gauges();
            evicted
        };
        evicted.stop_all().await;

        self.start_bridge(&bridge).await
    }

    /// Bridge requested by an endpoint calling another endpoint on its own.
    /// Unlike [`SessionRegistry::bridge`], an existing bridge with the same
    /// id wins and the request is refused.
    ///
    /// # Errors
    ///
    /// `AlreadyBridging` if the id is taken, otherwise whatever
    /// [`BridgeSession::start`] reports.
    #[instrument(skip_all, name = "intercom.registry.auto_bridge", fields(bridge_id = %request.bridge_id()))]
    pub async fn auto_bridge(&self, request: &BridgeRequest) -> Result<CallState, IntercomError> {
        let bridge = self.new_bridge(request);

        let evicted = {
            let mut entries = self.entries.lock().await;
            entries.prune();
            if entries.bridges.contains_key(bridge.bridge_id()) {
                info!(target: "intercom.registry", "Bridge already in progress, ignoring");
                return Err(IntercomError::AlreadyBridging(bridge.bridge_id().to_string()));
            }
            let mut evicted = Evicted::default();
            for device_id in [&request.source_device_id, &request.dest_device_id] {
                evicted.sessions.extend(entries.sessions.remove(device_id.as_str()));
                evicted
                    .bridges
                    .extend(entries.take_bridges_involving(device_id));
            }
            entries
                .bridges
                .insert(bridge.bridge_id().to_string(), bridge.clone());
            entries.publish_gauges();
            evicted
        };
        evicted.stop_all().await;

        self.start_bridge(&bridge).await
    }

    fn new_bridge(&self, request: &BridgeRequest) -> BridgeSession {
        let (source, dest) = request.endpoints(self.settings.default_port);
        BridgeSession::new(source, dest, self.settings.clone(), self.notifier.clone())
    }

    async fn start_bridge(&self, bridge: &BridgeSession) -> Result<CallState, IntercomError> {
        let entries = Arc::clone(&self.entries);
        let bridge = bridge.clone();
        let handshake = async move {
            let result = bridge.start().await;
            if result.is_err() {
                let mut entries = entries.lock().await;
                entries.remove_bridge(&bridge);
                entries.publish_gauges();
            }
            result
        };
        tokio::spawn(handshake.in_current_span())
            .await
            .map_err(|e| IntercomError::Internal(format!("bridge start task failed: {e}")))?
    }

    /// Stop the bridge `bridge_id`. Returns whether it existed.
    #[instrument(skip_all, name = "intercom.registry.bridge_stop", fields(bridge_id = %bridge_id))]
    pub async fn bridge_stop(&self, bridge_id: &str) -> bool {
        let bridge = {
            let mut entries = self.entries.lock().await;
            let bridge = entries.bridges.remove(bridge_id);
            entries.publish_gauges();
            bridge
        };
        match bridge {
            Some(bridge) => {
                bridge.stop().await;
                true
            }
            None => false,
        }
    }

    /// Current sessions and bridges, sorted by identifier.
    pub async fn snapshot(&self) -> RegistrySnapshot {
        let mut entries = self.entries.lock().await;
        entries.prune();
        entries.publish_gauges();

        let mut sessions: Vec<SessionSummary> = entries
            .sessions
            .iter()
            .map(|(device_id, session)| SessionSummary {
                device_id: device_id.clone(),
                host: session.host().to_string(),
                port: session.port(),
                state: session.state(),
            })
            .collect();
        sessions.sort_by(|a, b| a.device_id.cmp(&b.device_id));

        let mut bridges: Vec<BridgeSummary> = entries
            .bridges
            .iter()
            .map(|(bridge_id, bridge)| BridgeSummary {
                bridge_id: bridge_id.clone(),
                source_device_id: bridge.source().device_id.clone(),
                dest_device_id: bridge.dest().device_id.clone(),
                state: bridge.state(),
            })
            .collect();
        bridges.sort_by(|a, b| a.bridge_id.cmp(&b.bridge_id));

        RegistrySnapshot { sessions, bridges }
    }

    /// Stop everything. Used on process shutdown.
    pub async fn shutdown(&self) {
        let evicted = {
            let mut entries = self.entries.lock().await;
            let evicted = Evicted {
                sessions: entries.sessions.drain().map(|(_, session)| session).collect(),
                bridges: entries.bridges.drain().map(|(_, bridge)| bridge).collect(),
            };
            entries.publish_gauges();
            evicted
        };
        info!(
            target: "intercom.registry",
            sessions = evicted.sessions.len(),
            bridges = evicted.bridges.len(),
            "Stopping all sessions"
        );
        evicted.stop_all().await;
    }
}
