//! Seam between the relay and the local media pipeline

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::handle::RelayEvent;
use super::protocol::CaptureParams;
use crate::transport::PeerChannel;

/// Everything a media pipeline needs for one session
///
/// The pipeline writes only into `viewer` and reports back only through
/// `reporter`; it never touches relay state.
#[derive(Debug)]
pub struct MediaSession {
    pub session_id: String,
    pub params: CaptureParams,
    pub viewer: PeerChannel,
    /// Cancelled when the session ends or the viewer channel closes
    pub cancel: CancellationToken,
    pub reporter: MediaReporter,
}

/// Posts pipeline outcomes back onto the relay queue
#[derive(Debug, Clone)]
pub struct MediaReporter {
    tx: mpsc::UnboundedSender<RelayEvent>,
    session_id: String,
}

impl MediaReporter {
    pub fn new(tx: mpsc::UnboundedSender<RelayEvent>, session_id: impl Into<String>) -> Self {
        Self {
            tx,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Report a sustained failure; the relay ends the session if it is still current
    pub fn failed(&self, error: impl Into<String>) {
        let _ = self.tx.send(RelayEvent::MediaFailed {
            session_id: self.session_id.clone(),
            error: error.into(),
        });
    }
}

/// Starts a media pipeline for an accepted session
///
/// Called on the relay loop, so implementations must only spawn and return.
pub trait MediaLauncher: Send + Sync {
    fn launch(&self, session: MediaSession);
}
