//! System event types
//!
//! Defines all event types that can be broadcast through the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::relay::PeerRole;

/// System event enumeration
///
/// Serialized as `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    /// A peer was adopted for a role
    #[serde(rename = "peer.connected")]
    PeerConnected { role: PeerRole, peer_id: u64 },

    /// The current peer for a role went away (disconnect or preemption)
    #[serde(rename = "peer.disconnected")]
    PeerDisconnected { role: PeerRole, peer_id: u64 },

    /// A new session was created and the start request sent to the device
    #[serde(rename = "session.started")]
    SessionStarted {
        session_id: String,
        width: u32,
        height: u32,
        fps: u32,
        started_at: DateTime<Utc>,
    },

    /// The current session ended
    #[serde(rename = "session.ended")]
    SessionEnded { session_id: String, reason: String },

    /// Capture pipeline state changed
    #[serde(rename = "capture.state_changed")]
    CaptureStateChanged { session_id: String, state: String },

    /// Capture failed past the retry budget
    #[serde(rename = "capture.failed")]
    CaptureFailed { session_id: String, error: String },

    /// Error notification (e.g. a lagged subscriber)
    #[serde(rename = "error")]
    Error { message: String },
}

impl SystemEvent {
    /// Event name as used on the wire
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::PeerConnected { .. } => "peer.connected",
            Self::PeerDisconnected { .. } => "peer.disconnected",
            Self::SessionStarted { .. } => "session.started",
            Self::SessionEnded { .. } => "session.ended",
            Self::CaptureStateChanged { .. } => "capture.state_changed",
            Self::CaptureFailed { .. } => "capture.failed",
            Self::Error { .. } => "error",
        }
    }

    /// Check whether the event matches a topic (`*`, `peer.*`, or an exact name)
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }
        let name = self.event_name();
        match topic.strip_suffix(".*") {
            Some(prefix) => name
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.')),
            None => name == topic,
        }
    }
}
