//! Receiving-side playout buffer
//!
//! Queues incoming units, feeds them to the sink one append at a time, trims
//! data that has already played, and keeps playback close to the live edge.
//!
//! State machine:
//!
//! ```text
//! Idle ──init──> Initialized ──first media appended──> Playing
//!  ^                  │                                   │
//!  └──── reset / disconnect ──────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::pacing::pace;
use super::queue::PlayoutQueue;
use super::sink::{PlayoutSink, SinkError};
use crate::capture::fmp4::{box_type, read_box_header};
use crate::capture::{Chunk, UnitKind};
use crate::config::PlayoutConfig;
use crate::error::MirrorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayoutState {
    /// Waiting for an init unit
    Idle,
    /// Init received, no media played yet
    Initialized,
    Playing,
}

/// Sink operation started by the drain loop and not yet observed complete
#[derive(Debug)]
enum InFlight {
    Append(Chunk),
    Remove,
}

/// Guess a unit's role from its first box
pub fn classify_unit(data: &[u8]) -> UnitKind {
    match read_box_header(data) {
        Ok(Some(header)) if header.kind == box_type::FTYP || header.kind == box_type::MOOV => {
            UnitKind::Init
        }
        _ => UnitKind::Media,
    }
}

pub struct PlayoutBuffer<S: PlayoutSink> {
    sink: Arc<S>,
    config: PlayoutConfig,
    state: PlayoutState,
    /// Init unit not yet appended; kept out of the queue so overflow never drops it
    pending_init: Option<Chunk>,
    queue: PlayoutQueue,
    in_flight: Option<InFlight>,
    /// Consecutive quota failures for the head chunk
    quota_strikes: u32,
    next_sequence: u64,
}

impl<S: PlayoutSink> PlayoutBuffer<S> {
    pub fn new(sink: Arc<S>, config: PlayoutConfig) -> Self {
        let queue = PlayoutQueue::new(config.max_queue_size);
        Self {
            sink,
            config,
            state: PlayoutState::Idle,
            pending_init: None,
            queue,
            in_flight: None,
            quota_strikes: 0,
            next_sequence: 0,
        }
    }

    pub fn state(&self) -> PlayoutState {
        self.state
    }

    pub fn queued(&self) -> usize {
        self.queue.len() + usize::from(self.pending_init.is_some())
    }

    /// Whether the drain loop has anything to do
    pub fn has_work(&self) -> bool {
        let queued = self.pending_init.is_some() || !self.queue.is_empty();
        self.in_flight.is_some() || (queued && self.sink.is_open())
    }

    /// Wrap raw bytes from the wire and dispatch by unit kind
    pub fn on_binary(&mut self, data: Bytes) -> Result<(), MirrorError> {
        self.next_sequence += 1;
        let chunk = Chunk {
            sequence: self.next_sequence,
            timestamp_ms: Utc::now().timestamp_millis(),
            key_unit: false,
            kind: classify_unit(&data),
            payload: data,
        };
        match chunk.kind {
            UnitKind::Init => {
                self.on_init(chunk);
                Ok(())
            }
            UnitKind::Media => self.on_chunk(chunk),
        }
    }

    /// Accept an initialization unit; drops anything queued for the old stream
    pub fn on_init(&mut self, unit: Chunk) {
        if !self.queue.is_empty() {
            debug!("Init unit discards {} queued chunks", self.queue.len());
        }
        self.queue.clear();
        self.quota_strikes = 0;
        self.pending_init = Some(unit);
        if self.state != PlayoutState::Initialized {
            info!("Playout initialized");
        }
        self.state = PlayoutState::Initialized;
    }

    /// Queue a media unit
    ///
    /// Rejected while idle: media before init cannot be decoded.
    pub fn on_chunk(&mut self, chunk: Chunk) -> Result<(), MirrorError> {
        if self.state == PlayoutState::Idle {
            return Err(MirrorError::ProtocolViolation(format!(
                "media unit {} before init",
                chunk.sequence
            )));
        }
        if let Err(e) = self.queue.push(chunk) {
            warn!("Playout queue overflow: {}", e);
        }
        Ok(())
    }

    /// Back to awaiting init (stream restarted upstream)
    pub fn reset(&mut self) {
        self.pending_init = None;
        self.queue.clear();
        self.quota_strikes = 0;
        if self.state != PlayoutState::Idle {
            info!("Playout reset");
        }
        self.state = PlayoutState::Idle;
    }

    pub fn on_disconnect(&mut self) {
        debug!("Playout source disconnected");
        self.reset();
    }

    /// One drain step: observe the running sink operation, then start the
    /// next append
    ///
    /// Only ever awaits the sink's ready signal, so dropping the future
    /// mid-way loses nothing.
    pub async fn drain_once(&mut self) {
        if self.sink.is_busy() {
            self.sink.wait_ready().await;
        }
        if let Some(done) = self.in_flight.take() {
            self.on_operation_complete(done);
            if self.in_flight.is_some() {
                return;
            }
        }
        self.start_append();
    }

    /// Drain until the queue is empty or the sink closes
    pub async fn drain(&mut self) {
        while self.has_work() {
            self.drain_once().await;
        }
    }

    fn start_append(&mut self) {
        if !self.sink.is_open() || self.sink.is_busy() || self.in_flight.is_some() {
            return;
        }
        let Some(chunk) = self.pending_init.take().or_else(|| self.queue.pop()) else {
            return;
        };

        match self.sink.begin_append(chunk.payload.clone()) {
            Ok(()) => {
                trace!("Appending chunk {} ({} bytes)", chunk.sequence, chunk.len());
                self.in_flight = Some(InFlight::Append(chunk));
            }
            Err(SinkError::QuotaExceeded) => self.on_quota_exceeded(chunk),
            Err(SinkError::Busy | SinkError::Closed) => self.put_back(chunk),
            Err(e) => warn!("Dropping chunk {}: {}", chunk.sequence, e),
        }
    }

    /// Return an unappended unit to the head of the line
    fn put_back(&mut self, chunk: Chunk) {
        match chunk.kind {
            UnitKind::Init => self.pending_init = Some(chunk),
            UnitKind::Media => self.queue.requeue(chunk),
        }
    }

    fn on_operation_complete(&mut self, done: InFlight) {
        match done {
            InFlight::Append(chunk) => {
                self.quota_strikes = 0;
                if chunk.kind == UnitKind::Media && self.state == PlayoutState::Initialized {
                    info!("Playout started");
                    self.state = PlayoutState::Playing;
                }
                self.trim_played();
            }
            InFlight::Remove => trace!("Removal complete"),
        }
    }

    /// Remove everything more than `safety_margin` behind the play position
    fn trim_played(&mut self) {
        let Some(window) = self.sink.buffered() else {
            return;
        };
        let cut = self.sink.play_position() - self.config.safety_margin;
        if cut <= window.start {
            return;
        }
        match self.sink.begin_remove(window.start, cut) {
            Ok(()) => {
                trace!("Trimming [{:.2}, {:.2})", window.start, cut);
                self.in_flight = Some(InFlight::Remove);
            }
            Err(e) => debug!("Trim skipped: {}", e),
        }
    }

    /// Free the oldest data and retry the chunk first
    fn on_quota_exceeded(&mut self, chunk: Chunk) {
        self.quota_strikes += 1;
        let window = self.sink.buffered();
        let removable = window.filter(|w| w.duration() > 0.0);

        let Some(window) = removable.filter(|_| self.quota_strikes <= 2) else {
            warn!(
                "Sink full and nothing left to evict, dropping chunk {}",
                chunk.sequence
            );
            self.quota_strikes = 0;
            return;
        };

        let end = (window.start + self.config.emergency_trim).min(window.end);
        warn!(
            "Sink quota exceeded, evicting [{:.2}, {:.2})",
            window.start, end
        );
        self.put_back(chunk);
        match self.sink.begin_remove(window.start, end) {
            Ok(()) => self.in_flight = Some(InFlight::Remove),
            Err(e) => debug!("Emergency trim failed: {}", e),
        }
    }

    /// Pacing tick; only acts while playing
    pub fn tick(&mut self) {
        if self.state != PlayoutState::Playing {
            return;
        }
        let Some(window) = self.sink.buffered() else {
            return;
        };
        let position = self.sink.play_position();
        let decision = pace(window, position, self.sink.playback_rate(), &self.config);

        if let Some(target) = decision.seek_to {
            info!(
                "Playback {:.2}s behind live edge, seeking to {:.2}",
                window.ahead_of(position),
                target
            );
            self.sink.seek(target);
        }
        if let Some(rate) = decision.rate {
            debug!("Playback rate -> {}", rate);
            self.sink.set_playback_rate(rate);
        }
    }
}

/// Input to a running playout task
#[derive(Debug)]
pub enum PlayoutInput {
    Binary(Bytes),
    Reset,
    Disconnected,
}

/// Handle to a spawned playout task
#[derive(Debug, Clone)]
pub struct PlayoutHandle {
    tx: mpsc::UnboundedSender<PlayoutInput>,
}

impl PlayoutHandle {
    pub fn push(&self, data: Bytes) {
        let _ = self.tx.send(PlayoutInput::Binary(data));
    }

    pub fn reset(&self) {
        let _ = self.tx.send(PlayoutInput::Reset);
    }

    pub fn disconnected(&self) {
        let _ = self.tx.send(PlayoutInput::Disconnected);
    }
}

/// Run a playout buffer on its own task
///
/// The task ends when every handle is dropped.
pub fn spawn<S: PlayoutSink + 'static>(sink: Arc<S>, config: PlayoutConfig) -> PlayoutHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let tick_every = Duration::from_millis(config.tick_interval_ms.max(10));
    let mut buffer = PlayoutBuffer::new(sink, config);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            let has_work = buffer.has_work();
            tokio::select! {
                input = rx.recv() => match input {
                    Some(PlayoutInput::Binary(data)) => {
                        if let Err(e) = buffer.on_binary(data) {
                            debug!("Dropping unit: {}", e);
                        }
                    }
                    Some(PlayoutInput::Reset) => buffer.reset(),
                    Some(PlayoutInput::Disconnected) => buffer.on_disconnect(),
                    None => break,
                },
                _ = buffer.drain_once(), if has_work => {}
                _ = ticker.tick() => buffer.tick(),
            }
        }
        debug!("Playout task finished");
    });

    PlayoutHandle { tx }
}
