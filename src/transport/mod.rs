//! Transport channel manager
//!
//! Owns the per-peer outbound path: ordering, backpressure accounting and
//! close propagation. The socket itself is driven by `web::peer`.

mod channel;

pub use channel::{ChannelReceiver, Outbound, Payload, PeerChannel, PeerId};

use serde::{Deserialize, Serialize};

/// Which side of the mirroring pair a peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Phone (or phone bridge) producing the screen
    Device,
    /// Browser consuming the screen
    Viewer,
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device => write!(f, "device"),
            Self::Viewer => write!(f, "viewer"),
        }
    }
}
