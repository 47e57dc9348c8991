//! Play-out sink abstraction
//!
//! Modeled on a media-source buffer: appends and removals are started
//! synchronously, keep the sink busy while they run, and completion is
//! observed through [`PlayoutSink::wait_ready`].

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::error::MirrorError;

/// Playable range held by the sink, in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferWindow {
    pub start: f64,
    pub end: f64,
}

impl BufferWindow {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    /// Seconds buffered beyond `position`
    pub fn ahead_of(&self, position: f64) -> f64 {
        (self.end - position).max(0.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    /// Sink buffer is full
    #[error("sink quota exceeded")]
    QuotaExceeded,

    /// Sink was detached or closed
    #[error("sink closed")]
    Closed,

    /// The sink is mid-operation
    #[error("sink busy")]
    Busy,

    #[error("sink failure: {0}")]
    Failed(String),
}

impl From<SinkError> for MirrorError {
    fn from(e: SinkError) -> Self {
        match e {
            SinkError::QuotaExceeded => MirrorError::SinkQuotaExceeded,
            SinkError::Closed => MirrorError::ChannelClosed,
            other => MirrorError::ProtocolViolation(other.to_string()),
        }
    }
}

#[async_trait]
pub trait PlayoutSink: Send + Sync {
    /// Whether the sink accepts operations at all
    fn is_open(&self) -> bool;

    /// Whether an append or removal is still running
    fn is_busy(&self) -> bool;

    /// Resolves once the sink is not busy
    async fn wait_ready(&self);

    /// Start appending one unit
    fn begin_append(&self, data: Bytes) -> Result<(), SinkError>;

    /// Start removing `[start, end)` seconds
    fn begin_remove(&self, start: f64, end: f64) -> Result<(), SinkError>;

    /// Currently buffered range, `None` when nothing is buffered
    fn buffered(&self) -> Option<BufferWindow>;

    fn play_position(&self) -> f64;

    fn seek(&self, position: f64);

    fn playback_rate(&self) -> f64;

    fn set_playback_rate(&self, rate: f64);
}
