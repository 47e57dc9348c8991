//! Screen capture pipeline
//!
//! ```text
//! capture tool ──stdout──> converter ──stdout──> ChunkProducer ──> viewer channel
//!        └──── ProcessChain (supervisor) ────┘
//! ```

mod chunk;
pub mod fmp4;
pub mod producer;
pub mod supervisor;

pub use chunk::{Chunk, UnitKind};
pub use fmp4::{Fmp4Slicer, SlicedUnit};
pub use producer::{CaptureScheduler, ChunkProducer, CycleState, RetryPolicy, Verdict};
pub use supervisor::{CaptureError, CommandLine, ProcessChain};

use std::sync::Arc;

use tracing::debug;

use crate::config::ConfigStore;
use crate::events::EventBus;
use crate::relay::{MediaLauncher, MediaSession};

/// Launches a [`ChunkProducer`] for every accepted session
///
/// Reads the capture section afresh on each launch, so config edits apply to
/// the next session.
pub struct CaptureService {
    config: Arc<ConfigStore>,
    events: Arc<EventBus>,
}

impl CaptureService {
    pub fn new(config: Arc<ConfigStore>, events: Arc<EventBus>) -> Self {
        Self { config, events }
    }
}

impl MediaLauncher for CaptureService {
    fn launch(&self, session: MediaSession) {
        let capture = self.config.get().capture.clone();
        if !capture.enabled {
            debug!(
                "Local capture disabled, session {} uses device media only",
                session.session_id
            );
            return;
        }
        producer::spawn_producer(session, capture, self.events.clone());
    }
}
