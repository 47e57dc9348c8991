//! Signaling relay
//!
//! Brokers the single device/viewer pairing. Socket tasks post
//! [`RelayEvent`]s to one loop that owns every piece of signaling state.

mod handle;
mod media;
mod peers;
mod pending;
pub mod protocol;
mod signaling;

pub use handle::{spawn, RelayEvent, RelayHandle, RelayStatus};
pub use media::{MediaLauncher, MediaReporter, MediaSession};
pub use peers::PeerTable;
pub use pending::{DeviceMethod, PendingRequest, PendingRequests};
pub use protocol::{CaptureParams, ViewerEvent};
pub use signaling::{SignalingRelay, DEFAULT_ICE_SERVERS};

pub use crate::transport::PeerRole;
