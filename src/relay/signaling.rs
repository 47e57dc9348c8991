//! Signaling relay state machine
//!
//! Pairs one device with one viewer, owns the current session and the
//! pending-request table, and translates between the two control protocols.
//! Runs entirely on the relay loop; every handler completes synchronously.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::handle::{RelayEvent, RelayStatus};
use super::media::{MediaLauncher, MediaReporter, MediaSession};
use super::peers::PeerTable;
use super::pending::{DeviceMethod, PendingRequests};
use super::protocol::{
    value_to_message, CaptureParams, DeviceInbound, DeviceNotification, DeviceOutbound,
    ViewerAction, ViewerEvent,
};
use crate::config::RelayConfig;
use crate::error::MirrorError;
use crate::events::{EventBus, SystemEvent};
use crate::transport::{PeerChannel, PeerId, PeerRole};

/// ICE servers offered when neither the request nor the config names any
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

const DEVICE_NOT_CONNECTED: &str = "Device not connected";

/// The single active mirroring session
#[derive(Debug)]
struct Session {
    id: String,
    params: CaptureParams,
    started_at: DateTime<Utc>,
    /// Device reported `stream/ready`
    ready: bool,
    /// Cancels the local media pipeline, once launched
    media: Option<CancellationToken>,
}

pub struct SignalingRelay {
    config: RelayConfig,
    peers: PeerTable,
    pending: PendingRequests,
    session: Option<Session>,
    events: Arc<EventBus>,
    launcher: Option<Arc<dyn MediaLauncher>>,
    /// Loop queue, handed to media reporters
    queue: mpsc::UnboundedSender<RelayEvent>,
    status: watch::Sender<RelayStatus>,
}

impl SignalingRelay {
    pub fn new(
        config: RelayConfig,
        events: Arc<EventBus>,
        queue: mpsc::UnboundedSender<RelayEvent>,
        status: watch::Sender<RelayStatus>,
    ) -> Self {
        Self {
            config,
            peers: PeerTable::new(),
            pending: PendingRequests::new(),
            session: None,
            events,
            launcher: None,
            queue,
            status,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn MediaLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Id of the current session, if any
    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            device_connected: self.peers.is_connected(PeerRole::Device),
            viewer_connected: self.peers.is_connected(PeerRole::Viewer),
            session_id: self.session_id().map(str::to_string),
        }
    }

    /// Process one loop event to completion
    pub fn handle(&mut self, event: RelayEvent) {
        self.expire_pending();
        match event {
            RelayEvent::PeerConnected(channel) => self.adopt(channel),
            RelayEvent::PeerMessage {
                role,
                peer_id,
                text,
            } => self.on_peer_message(role, peer_id, &text),
            RelayEvent::PeerDisconnected { role, peer_id } => {
                self.on_peer_disconnected(role, peer_id)
            }
            RelayEvent::MediaFailed { session_id, error } => {
                self.on_media_failed(&session_id, error)
            }
            RelayEvent::Shutdown => self.shutdown(),
        }
        self.publish_status();
    }

    /// Install `channel` as the current peer for its role
    ///
    /// A preempted holder is closed first and goes through the regular
    /// disconnect path exactly once.
    pub fn adopt(&mut self, channel: PeerChannel) {
        let role = channel.role();
        let peer_id = channel.id();

        if let Some(prior) = self.peers.adopt(channel) {
            self.events.publish(SystemEvent::PeerDisconnected {
                role,
                peer_id: prior.id(),
            });
            self.after_disconnect(role);
        }

        info!("{} #{} connected", role, peer_id);
        self.events
            .publish(SystemEvent::PeerConnected { role, peer_id });

        match role {
            PeerRole::Device => self.notify_viewer(ViewerEvent::DeviceConnected),
            PeerRole::Viewer => {
                let status = ViewerEvent::ConnectionStatus {
                    device_connected: self.peers.is_connected(PeerRole::Device),
                    session_id: self.session_id().map(str::to_string),
                };
                self.notify_viewer(status);
            }
        }
    }

    /// Route a text frame from the current peer of `role`
    pub fn on_peer_message(&mut self, role: PeerRole, peer_id: PeerId, text: &str) {
        if !self.peers.is_current(role, peer_id) {
            debug!("Ignoring message from stale {} #{}", role, peer_id);
            return;
        }
        match role {
            PeerRole::Device => self.on_device_message(text),
            PeerRole::Viewer => self.on_viewer_message(text),
        }
    }

    pub fn on_peer_disconnected(&mut self, role: PeerRole, peer_id: PeerId) {
        if self.peers.release(role, peer_id).is_none() {
            debug!("{} #{} already replaced, ignoring disconnect", role, peer_id);
            return;
        }
        info!("{} #{} disconnected", role, peer_id);
        self.events
            .publish(SystemEvent::PeerDisconnected { role, peer_id });
        self.after_disconnect(role);
    }

    /// Send a message to the current peer of `target`
    ///
    /// An absent or closed target is logged and reported as `PeerAbsent`.
    pub fn forward<T: Serialize>(&self, target: PeerRole, msg: &T) -> Result<(), MirrorError> {
        let Some(peer) = self.peers.get(target) else {
            warn!("Cannot forward to {}: not connected", target);
            return Err(MirrorError::PeerAbsent(target));
        };
        peer.send_control(msg).map_err(|e| {
            warn!("Forward to {} #{} failed: {}", target, peer.id(), e);
            match e {
                MirrorError::ChannelClosed => MirrorError::PeerAbsent(target),
                other => other,
            }
        })
    }

    /// Create a session and ask the device to start streaming
    ///
    /// Any active session is stopped first. Returns the new session id.
    pub fn start_session(
        &mut self,
        params: CaptureParams,
        ice_servers: Option<Vec<String>>,
    ) -> Result<String, MirrorError> {
        if !self.peers.is_connected(PeerRole::Device) {
            return Err(MirrorError::PeerAbsent(PeerRole::Device));
        }

        if let Some(old) = self.stop_session("replaced by new start") {
            self.notify_viewer(ViewerEvent::StreamStopped { session_id: old });
        }

        let session_id = Uuid::new_v4().to_string();
        let ice_servers = self.resolve_ice_servers(ice_servers);
        let id = self
            .pending
            .register(DeviceMethod::StreamStart, Some(session_id.clone()));

        let request = DeviceOutbound::StartStream {
            id,
            session_id: session_id.clone(),
            params,
            ice_servers,
        };
        if let Err(e) = self.forward(PeerRole::Device, &request) {
            self.pending.cancel(id);
            return Err(e);
        }

        let started_at = Utc::now();
        info!(
            "Session {} starting ({}x{}@{})",
            session_id, params.width, params.height, params.fps
        );
        self.events.publish(SystemEvent::SessionStarted {
            session_id: session_id.clone(),
            width: params.width,
            height: params.height,
            fps: params.fps,
            started_at,
        });
        self.session = Some(Session {
            id: session_id.clone(),
            params,
            started_at,
            ready: false,
            media: None,
        });
        Ok(session_id)
    }

    /// Tell the device to stop and end the current session
    ///
    /// Returns the id of the session that was stopped.
    pub fn stop_session(&mut self, reason: &str) -> Option<String> {
        self.session.as_ref()?;
        self.request_device_stop();
        self.end_session(reason)
    }

    /// Close every peer and drop all state
    pub fn shutdown(&mut self) {
        self.end_session("shutdown");
        self.pending.clear();
        self.peers.close_all();
        self.publish_status();
    }

    // ------------------------------------------------------------------------
    // Device side
    // ------------------------------------------------------------------------

    fn on_device_message(&mut self, text: &str) {
        match DeviceInbound::parse(text) {
            Ok(DeviceInbound::Response { id, outcome }) => self.on_device_response(id, outcome),
            Ok(DeviceInbound::Notification(DeviceNotification::Unknown { method })) => {
                warn!("Unknown device method: {}", method);
            }
            Ok(DeviceInbound::Notification(notification)) => {
                self.on_device_notification(notification)
            }
            Err(e) => warn!("Dropping device message: {}", e),
        }
    }

    fn on_device_response(&mut self, id: u64, outcome: Result<Value, Value>) {
        let Some(request) = self.pending.take(id) else {
            debug!("Dropping response to unknown request {}", id);
            return;
        };

        match request.method {
            DeviceMethod::StreamStart => {
                let Some(session_id) = self
                    .session_id()
                    .filter(|current| request.session_id.as_deref() == Some(*current))
                    .map(str::to_string)
                else {
                    debug!("Start response {} belongs to an ended session", id);
                    return;
                };
                match outcome {
                    Ok(_) => {
                        info!("Device accepted session {}", session_id);
                        self.notify_viewer(ViewerEvent::StreamStarting {
                            session_id: session_id.clone(),
                        });
                        self.launch_media();
                    }
                    Err(err) => {
                        let error = value_to_message(&err);
                        warn!("Device rejected session {}: {}", session_id, error);
                        self.notify_viewer(ViewerEvent::StreamError {
                            session_id: Some(session_id),
                            error,
                        });
                        self.end_session("start rejected");
                    }
                }
            }
            DeviceMethod::StreamStop => match outcome {
                Ok(_) => debug!("Device acknowledged stop {}", id),
                Err(err) => warn!("Device stop {} failed: {}", id, value_to_message(&err)),
            },
            DeviceMethod::Command => {
                let (result, error) = match outcome {
                    Ok(v) => (Some(v), None),
                    Err(e) => (None, Some(e)),
                };
                self.notify_viewer(ViewerEvent::CommandResult { id, result, error });
            }
        }
    }

    fn on_device_notification(&mut self, notification: DeviceNotification) {
        let Some(session_id) = self.validate_session(notification.session_id()) else {
            return;
        };

        match notification {
            DeviceNotification::Offer { sdp, .. } => {
                self.notify_viewer(ViewerEvent::Offer { sdp, session_id })
            }
            DeviceNotification::Answer { sdp, .. } => {
                self.notify_viewer(ViewerEvent::Answer { sdp, session_id })
            }
            DeviceNotification::Ice { candidate, .. } => {
                self.notify_viewer(ViewerEvent::IceCandidate {
                    candidate,
                    session_id,
                })
            }
            DeviceNotification::StreamReady { .. } => {
                if let Some(session) = self.session.as_mut() {
                    session.ready = true;
                }
                info!("Session {} ready", session_id);
                self.notify_viewer(ViewerEvent::StreamReady { session_id });
            }
            DeviceNotification::StreamError { error, .. } => {
                warn!("Device stream error in {}: {}", session_id, error);
                self.notify_viewer(ViewerEvent::StreamError {
                    session_id: Some(session_id),
                    error,
                });
                self.end_session("device error");
            }
            DeviceNotification::StreamStopped { .. } => {
                self.notify_viewer(ViewerEvent::StreamStopped { session_id });
                self.end_session("device stopped");
            }
            DeviceNotification::Unknown { .. } => {}
        }
    }

    /// Accept a notification only when it names the current session
    fn validate_session(&self, received: Option<&str>) -> Option<String> {
        let current = self.session_id();
        match (current, received) {
            (Some(current), Some(received)) if current == received => Some(current.to_string()),
            (current, received) => {
                let err = MirrorError::SessionMismatch {
                    current: current.map(str::to_string),
                    received: received.map(str::to_string),
                };
                debug!("Dropping device notification: {}", err);
                None
            }
        }
    }

    fn request_device_stop(&mut self) {
        if !self.peers.is_connected(PeerRole::Device) {
            return;
        }
        let superseded = self.pending.supersede(DeviceMethod::StreamStop);
        if superseded > 0 {
            debug!("Dropped {} unanswered stop request(s)", superseded);
        }
        let id = self.pending.register(DeviceMethod::StreamStop, None);
        if self
            .forward(PeerRole::Device, &DeviceOutbound::StopStream { id })
            .is_err()
        {
            self.pending.cancel(id);
        }
    }

    // ------------------------------------------------------------------------
    // Viewer side
    // ------------------------------------------------------------------------

    fn on_viewer_message(&mut self, text: &str) {
        match ViewerAction::parse(text) {
            Ok(action) => self.on_viewer_action(action),
            Err(e) => {
                warn!("Dropping viewer message: {}", e);
                self.notify_viewer(ViewerEvent::Error {
                    error: "Invalid message".to_string(),
                });
            }
        }
    }

    fn on_viewer_action(&mut self, action: ViewerAction) {
        match action {
            ViewerAction::StartStream {
                width,
                height,
                fps,
                ice_servers,
            } => {
                let defaults = CaptureParams::default();
                let params = CaptureParams {
                    width: width.unwrap_or(defaults.width),
                    height: height.unwrap_or(defaults.height),
                    fps: fps.unwrap_or(defaults.fps),
                };
                match self.start_session(params, ice_servers) {
                    Ok(_) => {}
                    Err(MirrorError::PeerAbsent(_)) => self.notify_viewer(ViewerEvent::Error {
                        error: DEVICE_NOT_CONNECTED.to_string(),
                    }),
                    Err(e) => self.notify_viewer(ViewerEvent::Error {
                        error: e.to_string(),
                    }),
                }
            }
            ViewerAction::StopStream => match self.stop_session("viewer request") {
                Some(session_id) => self.notify_viewer(ViewerEvent::StreamStopped { session_id }),
                None => debug!("stop_stream with no active session"),
            },
            ViewerAction::Answer { sdp, session_id } => {
                if let Some(session_id) = self.viewer_session(session_id) {
                    let _ = self.forward(PeerRole::Device, &DeviceOutbound::Answer { sdp, session_id });
                }
            }
            ViewerAction::Offer { sdp, session_id } => {
                if let Some(session_id) = self.viewer_session(session_id) {
                    let _ = self.forward(PeerRole::Device, &DeviceOutbound::Offer { sdp, session_id });
                }
            }
            ViewerAction::IceCandidate {
                candidate,
                session_id,
            } => {
                if let Some(session_id) = self.viewer_session(session_id) {
                    let _ = self.forward(
                        PeerRole::Device,
                        &DeviceOutbound::Ice {
                            candidate,
                            session_id,
                        },
                    );
                }
            }
            ViewerAction::DeviceCommand { params } => {
                if !self.peers.is_connected(PeerRole::Device) {
                    self.notify_viewer(ViewerEvent::Error {
                        error: DEVICE_NOT_CONNECTED.to_string(),
                    });
                    return;
                }
                let session_id = self.session_id().map(str::to_string);
                let id = self.pending.register(DeviceMethod::Command, session_id);
                if self
                    .forward(PeerRole::Device, &DeviceOutbound::Command { id, params })
                    .is_err()
                {
                    self.pending.cancel(id);
                }
            }
            ViewerAction::Ping => self.notify_viewer(ViewerEvent::Pong),
            ViewerAction::Unknown => self.notify_viewer(ViewerEvent::Error {
                error: "Unknown action".to_string(),
            }),
        }
    }

    /// Resolve the session a viewer negotiation message refers to
    ///
    /// Requires an active session; an explicit id must match it.
    fn viewer_session(&self, received: Option<String>) -> Option<String> {
        let Some(current) = self.session_id() else {
            debug!("Viewer negotiation without an active session");
            self.notify_viewer(ViewerEvent::Error {
                error: "No active session".to_string(),
            });
            return None;
        };
        match received {
            Some(received) if received != current => {
                let err = MirrorError::SessionMismatch {
                    current: Some(current.to_string()),
                    received: Some(received),
                };
                debug!("Dropping viewer negotiation: {}", err);
                None
            }
            _ => Some(current.to_string()),
        }
    }

    fn notify_viewer(&self, event: ViewerEvent) {
        let _ = self.forward(PeerRole::Viewer, &event);
    }

    // ------------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------------

    fn after_disconnect(&mut self, role: PeerRole) {
        match role {
            PeerRole::Device => {
                let dropped = self.pending.clear();
                if dropped > 0 {
                    debug!("Discarded {} pending device requests", dropped);
                }
                self.end_session("device disconnected");
                self.notify_viewer(ViewerEvent::DeviceDisconnected);
            }
            PeerRole::Viewer => {
                self.stop_session("viewer disconnected");
            }
        }
    }

    fn launch_media(&mut self) {
        let Some(launcher) = self.launcher.clone() else {
            return;
        };
        let Some(viewer) = self.peers.get(PeerRole::Viewer).cloned() else {
            debug!("No viewer to receive media, not launching pipeline");
            return;
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(previous) = session.media.take() {
            previous.cancel();
        }

        let cancel = viewer.close_token().child_token();
        session.media = Some(cancel.clone());
        launcher.launch(MediaSession {
            session_id: session.id.clone(),
            params: session.params,
            viewer,
            cancel,
            reporter: MediaReporter::new(self.queue.clone(), session.id.clone()),
        });
    }

    fn on_media_failed(&mut self, session_id: &str, error: String) {
        if self.session_id() != Some(session_id) {
            debug!("Ignoring media failure for ended session {}", session_id);
            return;
        }
        warn!("Media pipeline failed for {}: {}", session_id, error);
        self.events.publish(SystemEvent::CaptureFailed {
            session_id: session_id.to_string(),
            error: error.clone(),
        });
        self.notify_viewer(ViewerEvent::StreamError {
            session_id: Some(session_id.to_string()),
            error,
        });
        self.stop_session("capture failed");
    }

    /// Drop the current session and cancel its pipeline; no device traffic
    fn end_session(&mut self, reason: &str) -> Option<String> {
        let session = self.session.take()?;
        if let Some(media) = session.media {
            media.cancel();
        }
        let dropped = self.pending.cancel_session(&session.id);
        if dropped > 0 {
            debug!("Dropped {} unanswered request(s) of session {}", dropped, session.id);
        }
        let elapsed = Utc::now() - session.started_at;
        info!(
            "Session {} ended after {}s: {} (ready: {})",
            session.id,
            elapsed.num_seconds(),
            reason,
            session.ready
        );
        self.events.publish(SystemEvent::SessionEnded {
            session_id: session.id.clone(),
            reason: reason.to_string(),
        });
        Some(session.id)
    }

    /// Forget requests the device never answered
    fn expire_pending(&mut self) {
        for req in self
            .pending
            .expire(self.config.request_timeout(), Instant::now())
        {
            warn!(
                "Device did not answer {} request {} within {:?}",
                req.method.as_str(),
                req.id,
                self.config.request_timeout()
            );
        }
    }

    fn resolve_ice_servers(&self, requested: Option<Vec<String>>) -> Vec<String> {
        match requested {
            Some(servers) if !servers.is_empty() => servers,
            _ if !self.config.ice_servers.is_empty() => self.config.ice_servers.clone(),
            _ => DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn publish_status(&self) {
        let next = self.status();
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelReceiver, Outbound};
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingLauncher {
        launched: Mutex<Vec<(String, CancellationToken)>>,
    }

    impl MediaLauncher for RecordingLauncher {
        fn launch(&self, session: MediaSession) {
            self.launched
                .lock()
                .push((session.session_id, session.cancel));
        }
    }

    struct Harness {
        relay: SignalingRelay,
        queue: mpsc::UnboundedReceiver<RelayEvent>,
        launcher: Arc<RecordingLauncher>,
        status: watch::Receiver<RelayStatus>,
    }

    fn harness() -> Harness {
        harness_with(RelayConfig::default())
    }

    fn harness_with(config: RelayConfig) -> Harness {
        let (tx, queue) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(RelayStatus::default());
        let launcher = Arc::new(RecordingLauncher::default());
        let relay = SignalingRelay::new(
            config,
            Arc::new(EventBus::new()),
            tx,
            status_tx,
        )
        .with_launcher(launcher.clone());
        Harness {
            relay,
            queue,
            launcher,
            status,
        }
    }

    fn connect(h: &mut Harness, role: PeerRole) -> (PeerChannel, ChannelReceiver) {
        let (channel, rx) = PeerChannel::open(role, 1 << 20);
        h.relay.handle(RelayEvent::PeerConnected(channel.clone()));
        (channel, rx)
    }

    fn send(h: &mut Harness, peer: &PeerChannel, msg: Value) {
        h.relay.handle(RelayEvent::PeerMessage {
            role: peer.role(),
            peer_id: peer.id(),
            text: msg.to_string(),
        });
    }

    /// Every queued text frame, parsed
    fn drain(rx: &mut ChannelReceiver) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(item) = rx.try_recv() {
            if let Outbound::Text(text) = item {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    fn types(msgs: &[Value]) -> Vec<&str> {
        msgs.iter().map(|m| m["type"].as_str().unwrap()).collect()
    }

    /// Device + viewer connected, stream started and accepted
    fn started(
        h: &mut Harness,
    ) -> (PeerChannel, ChannelReceiver, PeerChannel, ChannelReceiver, String) {
        let (device, mut device_rx) = connect(h, PeerRole::Device);
        let (viewer, mut viewer_rx) = connect(h, PeerRole::Viewer);
        send(h, &viewer, json!({"action": "start_stream"}));

        let start = drain(&mut device_rx).pop().unwrap();
        let session_id = start["params"]["sessionId"].as_str().unwrap().to_string();
        send(h, &device, json!({"id": start["id"], "result": {}}));
        drain(&mut viewer_rx);
        (device, device_rx, viewer, viewer_rx, session_id)
    }

    #[test]
    fn test_start_without_device_reports_error() {
        let mut h = harness();
        let (viewer, mut viewer_rx) = connect(&mut h, PeerRole::Viewer);
        drain(&mut viewer_rx);

        send(&mut h, &viewer, json!({"action": "start_stream"}));

        assert_eq!(
            drain(&mut viewer_rx),
            vec![json!({"type": "error", "error": "Device not connected"})]
        );
        assert!(h.relay.session_id().is_none());
        assert_eq!(h.relay.pending_len(), 0);
    }

    #[test]
    fn test_start_forwards_request_with_defaults() {
        let mut h = harness();
        let (_device, mut device_rx) = connect(&mut h, PeerRole::Device);
        let (viewer, _viewer_rx) = connect(&mut h, PeerRole::Viewer);

        send(
            &mut h,
            &viewer,
            json!({"action": "start_stream", "width": 540, "height": 960, "fps": 24}),
        );

        let msgs = drain(&mut device_rx);
        assert_eq!(msgs.len(), 1);
        let start = &msgs[0];
        assert_eq!(start["method"], "stream/start");
        assert_eq!(start["params"]["width"], 540);
        assert_eq!(start["params"]["fps"], 24);
        assert_eq!(
            start["params"]["iceServers"][0]["urls"],
            "stun:stun.l.google.com:19302"
        );
        assert_eq!(
            start["params"]["sessionId"].as_str(),
            h.relay.session_id()
        );
        assert_eq!(h.relay.pending_len(), 1);
    }

    #[test]
    fn test_start_response_consumed_once_and_launches_media() {
        let mut h = harness();
        let (device, mut device_rx) = connect(&mut h, PeerRole::Device);
        let (viewer, mut viewer_rx) = connect(&mut h, PeerRole::Viewer);
        drain(&mut viewer_rx);

        send(&mut h, &viewer, json!({"action": "start_stream"}));
        let start = drain(&mut device_rx).pop().unwrap();
        let response = json!({"id": start["id"], "result": {"ok": true}});

        send(&mut h, &device, response.clone());
        send(&mut h, &device, response);

        let msgs = drain(&mut viewer_rx);
        assert_eq!(types(&msgs), vec!["stream_starting"]);
        assert_eq!(msgs[0]["sessionId"], start["params"]["sessionId"]);
        assert_eq!(h.relay.pending_len(), 0);
        assert_eq!(h.launcher.launched.lock().len(), 1);
    }

    #[test]
    fn test_start_error_clears_session() {
        let mut h = harness();
        let (device, mut device_rx) = connect(&mut h, PeerRole::Device);
        let (viewer, mut viewer_rx) = connect(&mut h, PeerRole::Viewer);
        drain(&mut viewer_rx);

        send(&mut h, &viewer, json!({"action": "start_stream"}));
        let start = drain(&mut device_rx).pop().unwrap();
        send(
            &mut h,
            &device,
            json!({"id": start["id"], "error": {"message": "projection denied"}}),
        );

        let msgs = drain(&mut viewer_rx);
        assert_eq!(types(&msgs), vec!["stream_error"]);
        assert_eq!(msgs[0]["error"], "projection denied");
        assert!(h.relay.session_id().is_none());
        assert!(h.launcher.launched.lock().is_empty());
    }

    #[test]
    fn test_stream_ready_requires_matching_session() {
        let mut h = harness();
        let (device, _device_rx, _viewer, mut viewer_rx, session_id) = started(&mut h);

        send(
            &mut h,
            &device,
            json!({"method": "stream/ready", "params": {"sessionId": "someone-else"}}),
        );
        send(&mut h, &device, json!({"method": "stream/ready", "params": {}}));
        assert!(drain(&mut viewer_rx).is_empty());

        send(
            &mut h,
            &device,
            json!({"method": "stream/ready", "params": {"sessionId": session_id}}),
        );
        assert_eq!(
            drain(&mut viewer_rx),
            vec![json!({"type": "stream_ready", "sessionId": session_id})]
        );
    }

    #[test]
    fn test_device_disconnect_clears_state_and_notifies_once() {
        let mut h = harness();
        let (device, _device_rx, viewer, mut viewer_rx, _session_id) = started(&mut h);
        let media = h.launcher.launched.lock()[0].1.clone();

        // an outstanding command that will never be answered
        send(&mut h, &viewer, json!({"action": "device_command", "params": {"tap": [1, 2]}}));
        assert_eq!(h.relay.pending_len(), 1);

        h.relay.handle(RelayEvent::PeerDisconnected {
            role: PeerRole::Device,
            peer_id: device.id(),
        });
        h.relay.handle(RelayEvent::PeerDisconnected {
            role: PeerRole::Device,
            peer_id: device.id(),
        });

        assert_eq!(types(&drain(&mut viewer_rx)), vec!["device_disconnected"]);
        assert!(h.relay.session_id().is_none());
        assert_eq!(h.relay.pending_len(), 0);
        assert!(media.is_cancelled());
        assert!(!h.status.borrow().device_connected);
    }

    #[test]
    fn test_new_device_preempts_old() {
        let mut h = harness();
        let (_viewer, mut viewer_rx) = connect(&mut h, PeerRole::Viewer);
        let (first, _first_rx) = connect(&mut h, PeerRole::Device);
        drain(&mut viewer_rx);

        let (second, _second_rx) = connect(&mut h, PeerRole::Device);
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(
            types(&drain(&mut viewer_rx)),
            vec!["device_disconnected", "device_connected"]
        );

        // late disconnect from the preempted socket changes nothing
        h.relay.handle(RelayEvent::PeerDisconnected {
            role: PeerRole::Device,
            peer_id: first.id(),
        });
        assert!(drain(&mut viewer_rx).is_empty());
        assert!(h.relay.status().device_connected);

        // and neither do its messages
        send(&mut h, &first, json!({"method": "stream/stopped", "params": {}}));
        assert!(drain(&mut viewer_rx).is_empty());
    }

    #[test]
    fn test_viewer_disconnect_stops_stream() {
        let mut h = harness();
        let (_device, mut device_rx, viewer, _viewer_rx, _session_id) = started(&mut h);
        let media = h.launcher.launched.lock()[0].1.clone();
        drain(&mut device_rx);

        h.relay.handle(RelayEvent::PeerDisconnected {
            role: PeerRole::Viewer,
            peer_id: viewer.id(),
        });

        let msgs = drain(&mut device_rx);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["method"], "stream/stop");
        assert!(h.relay.session_id().is_none());
        assert!(media.is_cancelled());
    }

    #[test]
    fn test_viewer_connect_reports_status() {
        let mut h = harness();
        let (_device, _device_rx) = connect(&mut h, PeerRole::Device);
        let (_viewer, mut viewer_rx) = connect(&mut h, PeerRole::Viewer);

        assert_eq!(
            drain(&mut viewer_rx),
            vec![json!({"type": "connection_status", "deviceConnected": true, "sessionId": null})]
        );
    }

    #[test]
    fn test_ping_and_unknown_action() {
        let mut h = harness();
        let (viewer, mut viewer_rx) = connect(&mut h, PeerRole::Viewer);
        drain(&mut viewer_rx);

        send(&mut h, &viewer, json!({"action": "ping"}));
        send(&mut h, &viewer, json!({"action": "self_destruct"}));
        send(&mut h, &viewer, json!({"nothing": true}));

        assert_eq!(
            drain(&mut viewer_rx),
            vec![
                json!({"type": "pong"}),
                json!({"type": "error", "error": "Unknown action"}),
                json!({"type": "error", "error": "Invalid message"}),
            ]
        );
    }

    #[test]
    fn test_negotiation_is_relayed_both_ways() {
        let mut h = harness();
        let (device, mut device_rx, viewer, mut viewer_rx, session_id) = started(&mut h);
        drain(&mut device_rx);

        send(
            &mut h,
            &device,
            json!({"method": "webrtc/offer", "params": {"sdp": "v=0", "sessionId": session_id}}),
        );
        assert_eq!(
            drain(&mut viewer_rx),
            vec![json!({"type": "offer", "sdp": "v=0", "sessionId": session_id})]
        );

        send(&mut h, &viewer, json!({"action": "answer", "sdp": "v=1"}));
        send(
            &mut h,
            &viewer,
            json!({"action": "ice_candidate", "candidate": {"candidate": "c"}, "sessionId": session_id}),
        );
        send(
            &mut h,
            &viewer,
            json!({"action": "ice_candidate", "candidate": {"candidate": "x"}, "sessionId": "stale"}),
        );

        let msgs = drain(&mut device_rx);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["method"], "webrtc/answer");
        assert_eq!(msgs[0]["params"]["sessionId"], session_id.as_str());
        assert_eq!(msgs[1]["method"], "webrtc/ice");
        assert!(msgs.iter().all(|m| m.get("id").is_none()));
    }

    #[test]
    fn test_device_command_round_trip() {
        let mut h = harness();
        let (device, mut device_rx) = connect(&mut h, PeerRole::Device);
        let (viewer, mut viewer_rx) = connect(&mut h, PeerRole::Viewer);
        drain(&mut viewer_rx);

        send(&mut h, &viewer, json!({"action": "device_command", "params": {"key": "HOME"}}));
        let cmd = drain(&mut device_rx).pop().unwrap();
        assert_eq!(cmd["method"], "device/command");
        assert_eq!(cmd["params"]["key"], "HOME");

        send(&mut h, &device, json!({"id": cmd["id"], "result": "done"}));
        assert_eq!(
            drain(&mut viewer_rx),
            vec![json!({"type": "command_result", "id": cmd["id"], "result": "done"})]
        );
    }

    #[test]
    fn test_media_failure_ends_current_session_only() {
        let mut h = harness();
        let (_device, mut device_rx, _viewer, mut viewer_rx, session_id) = started(&mut h);
        drain(&mut device_rx);

        h.relay.handle(RelayEvent::MediaFailed {
            session_id: "old".into(),
            error: "ignored".into(),
        });
        assert!(drain(&mut viewer_rx).is_empty());

        h.relay.handle(RelayEvent::MediaFailed {
            session_id: session_id.clone(),
            error: "screencap keeps failing".into(),
        });
        let msgs = drain(&mut viewer_rx);
        assert_eq!(types(&msgs), vec!["stream_error"]);
        assert_eq!(msgs[0]["sessionId"], session_id.as_str());
        assert_eq!(drain(&mut device_rx)[0]["method"], "stream/stop");
        assert!(h.relay.session_id().is_none());
    }

    #[test]
    fn test_restart_stops_previous_session() {
        let mut h = harness();
        let (_device, mut device_rx, viewer, mut viewer_rx, first) = started(&mut h);
        drain(&mut device_rx);

        send(&mut h, &viewer, json!({"action": "start_stream"}));

        let device_msgs = drain(&mut device_rx);
        assert_eq!(device_msgs[0]["method"], "stream/stop");
        assert_eq!(device_msgs[1]["method"], "stream/start");
        assert_ne!(device_msgs[1]["params"]["sessionId"], first.as_str());
        assert_eq!(
            drain(&mut viewer_rx),
            vec![json!({"type": "stream_stopped", "sessionId": first})]
        );
        assert!(h.launcher.launched.lock()[0].1.is_cancelled());
    }

    #[test]
    fn test_unanswered_start_stop_rounds_stay_bounded() {
        let mut h = harness();
        let (_device, mut device_rx) = connect(&mut h, PeerRole::Device);
        let (viewer, _viewer_rx) = connect(&mut h, PeerRole::Viewer);

        for _ in 0..1000 {
            send(&mut h, &viewer, json!({"action": "start_stream"}));
            send(&mut h, &viewer, json!({"action": "stop_stream"}));
        }
        drain(&mut device_rx);

        // only the latest stop is still awaiting an answer
        assert_eq!(h.relay.pending_len(), 1);
    }

    #[test]
    fn test_late_start_reply_after_stop_is_ignored() {
        let mut h = harness();
        let (device, mut device_rx) = connect(&mut h, PeerRole::Device);
        let (viewer, mut viewer_rx) = connect(&mut h, PeerRole::Viewer);
        send(&mut h, &viewer, json!({"action": "start_stream"}));
        let start = drain(&mut device_rx).pop().unwrap();

        send(&mut h, &viewer, json!({"action": "stop_stream"}));
        drain(&mut viewer_rx);
        send(&mut h, &device, json!({"id": start["id"], "result": {}}));

        assert!(drain(&mut viewer_rx).is_empty());
        assert!(h.launcher.launched.lock().is_empty());
    }

    #[test]
    fn test_unanswered_commands_expire() {
        let mut h = harness_with(RelayConfig {
            request_timeout_ms: 0,
            ..Default::default()
        });
        let (_device, _device_rx) = connect(&mut h, PeerRole::Device);
        let (viewer, _viewer_rx) = connect(&mut h, PeerRole::Viewer);

        send(&mut h, &viewer, json!({"action": "device_command", "params": {"key": 4}}));
        assert_eq!(h.relay.pending_len(), 1);

        std::thread::sleep(std::time::Duration::from_millis(2));
        send(&mut h, &viewer, json!({"action": "ping"}));
        assert_eq!(h.relay.pending_len(), 0);
    }

    #[test]
    fn test_reporter_posts_to_queue() {
        let mut h = harness();
        let (_device, _device_rx, _viewer, _viewer_rx, session_id) = started(&mut h);
        let reporter = MediaReporter::new(h.relay.queue.clone(), session_id.clone());
        reporter.failed("boom");

        match h.queue.try_recv().unwrap() {
            RelayEvent::MediaFailed { session_id: id, error } => {
                assert_eq!(id, session_id);
                assert_eq!(error, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
