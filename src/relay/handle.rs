//! Relay event loop and the handle used to feed it

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::media::MediaLauncher;
use super::signaling::SignalingRelay;
use crate::config::RelayConfig;
use crate::events::EventBus;
use crate::transport::{PeerChannel, PeerId, PeerRole};

/// Input to the relay loop
#[derive(Debug)]
pub enum RelayEvent {
    /// A socket was accepted; adopt its channel for the channel's role
    PeerConnected(PeerChannel),
    /// Text frame read from a peer socket
    PeerMessage {
        role: PeerRole,
        peer_id: PeerId,
        text: String,
    },
    /// A peer socket ended
    PeerDisconnected { role: PeerRole, peer_id: PeerId },
    /// Media pipeline gave up on a session
    MediaFailed { session_id: String, error: String },
    /// Close every peer and stop the loop
    Shutdown,
}

/// Snapshot of relay state for the status endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub device_connected: bool,
    pub viewer_connected: bool,
    pub session_id: Option<String>,
}

/// Cloneable handle to a running relay
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<RelayEvent>,
    status: watch::Receiver<RelayStatus>,
}

impl RelayHandle {
    pub fn connect(&self, channel: PeerChannel) {
        self.post(RelayEvent::PeerConnected(channel));
    }

    pub fn message(&self, role: PeerRole, peer_id: PeerId, text: String) {
        self.post(RelayEvent::PeerMessage {
            role,
            peer_id,
            text,
        });
    }

    pub fn disconnected(&self, role: PeerRole, peer_id: PeerId) {
        self.post(RelayEvent::PeerDisconnected { role, peer_id });
    }

    pub fn shutdown(&self) {
        self.post(RelayEvent::Shutdown);
    }

    /// Current status snapshot
    pub fn status(&self) -> RelayStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change
    pub fn watch_status(&self) -> watch::Receiver<RelayStatus> {
        self.status.clone()
    }

    fn post(&self, event: RelayEvent) {
        if self.tx.send(event).is_err() {
            debug!("Relay loop has stopped, event dropped");
        }
    }
}

/// Start the relay loop on the current runtime
pub fn spawn(
    config: RelayConfig,
    events: Arc<EventBus>,
    launcher: Option<Arc<dyn MediaLauncher>>,
) -> RelayHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(RelayStatus::default());

    let mut relay = SignalingRelay::new(config, events, tx.clone(), status_tx);
    if let Some(launcher) = launcher {
        relay = relay.with_launcher(launcher);
    }

    tokio::spawn(async move {
        info!("Signaling relay started");
        while let Some(event) = rx.recv().await {
            if matches!(event, RelayEvent::Shutdown) {
                relay.shutdown();
                break;
            }
            relay.handle(event);
        }
        info!("Signaling relay stopped");
    });

    RelayHandle {
        tx,
        status: status_rx,
    }
}
