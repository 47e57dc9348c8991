//! Receiving-side playout buffer
//!
//! Mirrors what a viewer does with the continuous fragment stream: queue the
//! units, append them to a media sink strictly one at a time, and keep the
//! play position near the live edge.

mod manager;
mod pacing;
mod queue;
mod sink;

pub use manager::{classify_unit, spawn, PlayoutBuffer, PlayoutHandle, PlayoutInput, PlayoutState};
pub use pacing::{pace, Pacing, NORMAL_RATE};
pub use queue::PlayoutQueue;
pub use sink::{BufferWindow, PlayoutSink, SinkError};
