//! Frame/chunk producer
//!
//! Drives the process supervisor for one session and writes the resulting
//! units into the viewer channel. Two modes:
//!
//! - **discrete**: one snapshot per cycle, sent as an `mjpeg_frame` control
//!   message immediately followed by the binary frame
//! - **continuous**: one long-lived recorder whose fMP4 output is sliced into
//!   an init unit and media units, sent as bare binary frames
//!
//! Failures feed a [`CaptureScheduler`] that decides between a short retry,
//! a long backoff, and giving up on the session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::chunk::{Chunk, UnitKind};
use super::fmp4::{Fmp4Slicer, SlicedUnit};
use super::supervisor::{CaptureError, ProcessChain};
use crate::config::{CaptureConfig, CaptureMode};
use crate::error::MirrorError;
use crate::events::{EventBus, SystemEvent};
use crate::relay::{CaptureParams, MediaReporter, MediaSession, ViewerEvent};
use crate::transport::PeerChannel;
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Capture cycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    /// Capture process running
    Capturing,
    /// Capture done, converter still running
    Converting,
    /// Output being written to the viewer
    Emit,
    /// Continuous recorder running
    Streaming,
    Error,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Capturing => "capturing",
            Self::Converting => "converting",
            Self::Emit => "emit",
            Self::Streaming => "streaming",
            Self::Error => "error",
        }
    }

    fn can_enter(self, next: CycleState) -> bool {
        use CycleState::*;
        matches!(
            (self, next),
            (Idle, Capturing)
                | (Idle, Streaming)
                | (Capturing, Converting)
                | (Capturing, Emit)
                | (Converting, Emit)
                | (Emit, Idle)
                | (Streaming, Idle)
                | (Capturing | Converting | Emit | Streaming, Error)
                | (Error, Idle)
        )
    }
}

impl std::fmt::Display for CycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry and backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub min_interval: Duration,
    pub retry_delay: Duration,
    pub backoff_delay: Duration,
    /// Consecutive errors that trigger a long backoff
    pub error_threshold: u32,
    /// Long backoffs without a success before giving up (0 = never)
    pub max_backoff_rounds: u32,
}

impl From<&CaptureConfig> for RetryPolicy {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            min_interval: config.min_interval(),
            retry_delay: config.retry_delay(),
            backoff_delay: config.backoff_delay(),
            error_threshold: config.error_threshold.max(1),
            max_backoff_rounds: config.max_backoff_rounds,
        }
    }
}

/// Whether a new cycle may start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Ready,
    /// A cycle is already running
    InFlight,
    /// Minimum interval not yet elapsed
    Wait(Duration),
}

/// What to do after a failed cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Retry(Duration),
    Backoff(Duration),
    GiveUp,
}

/// Cycle state machine plus retry accounting
#[derive(Debug)]
pub struct CaptureScheduler {
    policy: RetryPolicy,
    state: CycleState,
    last_started: Option<Instant>,
    consecutive_errors: u32,
    backoff_rounds: u32,
}

impl CaptureScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: CycleState::Idle,
            last_started: None,
            consecutive_errors: 0,
            backoff_rounds: 0,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn gate(&self, now: Instant) -> Gate {
        if self.state != CycleState::Idle {
            return Gate::InFlight;
        }
        match self.last_started {
            Some(last) => {
                let next = last + self.policy.min_interval;
                if next > now {
                    Gate::Wait(next - now)
                } else {
                    Gate::Ready
                }
            }
            None => Gate::Ready,
        }
    }

    /// Start a cycle in `state` if the gate allows it
    pub fn try_begin(&mut self, now: Instant, state: CycleState) -> Gate {
        let gate = self.gate(now);
        if gate == Gate::Ready {
            self.state = state;
            self.last_started = Some(now);
        }
        gate
    }

    /// Move to `next`, rejecting transitions the cycle does not allow
    pub fn transition(&mut self, next: CycleState) -> Result<(), MirrorError> {
        if !self.state.can_enter(next) {
            return Err(MirrorError::ProtocolViolation(format!(
                "capture cycle cannot go from {} to {}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    pub fn on_success(&mut self) {
        self.consecutive_errors = 0;
        self.backoff_rounds = 0;
    }

    pub fn on_error(&mut self) -> Verdict {
        self.consecutive_errors += 1;
        if self.consecutive_errors < self.policy.error_threshold {
            return Verdict::Retry(self.policy.retry_delay);
        }

        self.consecutive_errors = 0;
        if self.policy.max_backoff_rounds > 0
            && self.backoff_rounds >= self.policy.max_backoff_rounds
        {
            return Verdict::GiveUp;
        }
        self.backoff_rounds += 1;
        Verdict::Backoff(self.policy.backoff_delay)
    }
}

/// How a recorder run ended
enum StreamEnd {
    /// Process exited after producing media
    Exited,
    /// Viewer channel closed
    ViewerGone,
}

/// Per-session capture worker
pub struct ChunkProducer {
    session_id: String,
    params: CaptureParams,
    viewer: PeerChannel,
    cancel: CancellationToken,
    reporter: MediaReporter,
    config: CaptureConfig,
    events: Arc<EventBus>,
    scheduler: CaptureScheduler,
    throttler: LogThrottler,
    sequence: u64,
    degraded: bool,
}

impl ChunkProducer {
    pub fn new(session: MediaSession, config: CaptureConfig, events: Arc<EventBus>) -> Self {
        let scheduler = CaptureScheduler::new(RetryPolicy::from(&config));
        Self {
            session_id: session.session_id,
            params: session.params,
            viewer: session.viewer,
            cancel: session.cancel,
            reporter: session.reporter,
            config,
            events,
            scheduler,
            throttler: LogThrottler::default(),
            sequence: 0,
            degraded: false,
        }
    }

    /// Run until the session is cancelled, the viewer goes away, or capture
    /// gives up
    pub async fn run(mut self) {
        info!(
            "Capture for {} started ({:?}, {}x{}@{})",
            self.session_id, self.config.mode, self.params.width, self.params.height, self.params.fps
        );
        self.announce("started");
        match self.config.mode {
            CaptureMode::Discrete => self.run_discrete().await,
            CaptureMode::Continuous => self.run_continuous().await,
        }
        self.announce("stopped");
        info!(
            "Capture for {} stopped after {} units",
            self.session_id, self.sequence
        );
    }

    async fn run_discrete(&mut self) {
        let cancel = self.cancel.clone();
        let chain = match ProcessChain::from_templates(
            &self.config.snapshot_command,
            &self.config.snapshot_convert,
            &self.params,
        ) {
            Ok(chain) => chain,
            Err(e) => {
                self.reporter.failed(e.to_string());
                return;
            }
        };
        let has_convert = chain.has_convert();
        let timeout = self.config.cycle_timeout();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            // no snapshot is taken while the viewer is still behind
            if self.wait_writable().await.is_err() {
                break;
            }
            match self.scheduler.try_begin(Instant::now(), CycleState::Capturing) {
                Gate::Ready => {}
                Gate::Wait(delay) => {
                    if !self.pause(delay).await {
                        break;
                    }
                    continue;
                }
                Gate::InFlight => {
                    tokio::task::yield_now().await;
                    continue;
                }
            }

            let started = Instant::now();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                r = chain.run_once(timeout, || {
                    if has_convert {
                        self.enter(CycleState::Converting);
                    }
                }) => r,
            };
            if cancel.is_cancelled() {
                debug!("Discarding capture output for cancelled session {}", self.session_id);
                break;
            }

            match outcome {
                Ok(frame) => {
                    self.enter(CycleState::Emit);
                    match self.emit_frame(frame, started).await {
                        Ok(()) => self.on_success(),
                        Err(MirrorError::ChannelClosed) => break,
                        Err(e) => debug!("Frame dropped: {}", e),
                    }
                    self.enter(CycleState::Idle);
                }
                Err(e) => {
                    self.enter(CycleState::Error);
                    if !self.on_failure(e).await {
                        break;
                    }
                    self.enter(CycleState::Idle);
                }
            }
        }
    }

    async fn run_continuous(&mut self) {
        let cancel = self.cancel.clone();
        let chain = match ProcessChain::from_templates(
            &self.config.record_command,
            &self.config.record_convert,
            &self.params,
        ) {
            Ok(chain) => chain,
            Err(e) => {
                self.reporter.failed(e.to_string());
                return;
            }
        };
        let mut runs: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.scheduler.try_begin(Instant::now(), CycleState::Streaming) {
                Gate::Ready => {}
                Gate::Wait(delay) => {
                    if !self.pause(delay).await {
                        break;
                    }
                    continue;
                }
                Gate::InFlight => {
                    tokio::task::yield_now().await;
                    continue;
                }
            }

            let restart = runs > 0;
            runs += 1;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.stream_once(&chain, restart) => r,
            };
            if cancel.is_cancelled() {
                break;
            }

            match outcome {
                Ok(StreamEnd::ViewerGone) => break,
                Ok(StreamEnd::Exited) => {
                    info!("Recorder for {} exited, restarting", self.session_id);
                    self.enter(CycleState::Idle);
                }
                Err(e) => {
                    self.enter(CycleState::Error);
                    if !self.on_failure(e).await {
                        break;
                    }
                    self.enter(CycleState::Idle);
                }
            }
        }
    }

    /// One recorder lifetime: spawn, slice output until EOF, reap
    async fn stream_once(
        &mut self,
        chain: &ProcessChain,
        restart: bool,
    ) -> Result<StreamEnd, CaptureError> {
        let mut running = chain.spawn()?;

        if restart {
            let reset = ViewerEvent::StreamReset {
                session_id: self.session_id.clone(),
            };
            if self.viewer.send_control(&reset).is_err() {
                return Ok(StreamEnd::ViewerGone);
            }
        }

        let read_size = self.config.read_buffer_size.max(4096);
        let mut buf = BytesMut::with_capacity(read_size);
        let mut slicer = Fmp4Slicer::new();
        let mut produced = false;

        loop {
            buf.reserve(read_size);
            if running.read_chunk(&mut buf).await? == 0 {
                break;
            }
            slicer.push(&buf.split());

            while let Some(unit) = slicer
                .next_unit()
                .map_err(|e| CaptureError::Io(format!("malformed recorder output: {}", e)))?
            {
                if unit.kind == UnitKind::Media && !slicer.init_seen() {
                    debug!("Dropping media unit that precedes the init unit");
                    continue;
                }
                let is_media = unit.kind == UnitKind::Media;
                match self.emit_unit(unit).await {
                    Ok(()) => {}
                    Err(MirrorError::ChannelClosed) => return Ok(StreamEnd::ViewerGone),
                    Err(e) => debug!("Unit dropped: {}", e),
                }
                if is_media {
                    produced = true;
                    self.on_success();
                }
            }
        }

        running.wait().await?;
        if !produced {
            return Err(CaptureError::OutputEmpty);
        }
        Ok(StreamEnd::Exited)
    }

    async fn emit_frame(&mut self, frame: Bytes, started: Instant) -> Result<(), MirrorError> {
        let chunk = self.next_chunk(UnitKind::Media, false, frame);
        self.wait_writable().await?;

        let meta = ViewerEvent::MjpegFrame {
            timestamp: chunk.timestamp_ms,
            size: chunk.len(),
            processing_time: started.elapsed().as_millis() as u64,
            sequence: chunk.sequence,
        };
        self.viewer.send_control(&meta)?;
        self.viewer.send_data(chunk.payload)?;
        trace!("Sent frame {}", chunk.sequence);
        Ok(())
    }

    async fn emit_unit(&mut self, unit: SlicedUnit) -> Result<(), MirrorError> {
        let chunk = self.next_chunk(unit.kind, unit.key_unit, unit.data);
        self.wait_writable().await?;
        self.viewer.send_data(chunk.payload)?;
        trace!(
            "Sent {:?} unit {} (key: {})",
            chunk.kind,
            chunk.sequence,
            chunk.key_unit
        );
        Ok(())
    }

    fn next_chunk(&mut self, kind: UnitKind, key_unit: bool, payload: Bytes) -> Chunk {
        self.sequence += 1;
        Chunk {
            sequence: self.sequence,
            timestamp_ms: Utc::now().timestamp_millis(),
            key_unit,
            kind,
            payload,
        }
    }

    /// Wait for the viewer channel to drain below its ceiling
    async fn wait_writable(&self) -> Result<(), MirrorError> {
        tokio::select! {
            r = self.viewer.wait_drained() => r,
            _ = self.cancel.cancelled() => Err(MirrorError::ChannelClosed),
        }
    }

    /// Apply the retry policy to a failure; `false` stops the producer
    async fn on_failure(&mut self, err: CaptureError) -> bool {
        warn_throttled!(
            self.throttler,
            "capture_failure",
            "Capture failed for {}: {}",
            self.session_id,
            err
        );
        if self.throttler.should_log("capture_warning") {
            let advisory = ViewerEvent::CaptureWarning {
                session_id: self.session_id.clone(),
                error: err.to_string(),
            };
            let _ = self.viewer.send_control(&advisory);
        }
        if !self.degraded {
            self.degraded = true;
            self.announce("error");
        }

        match self.scheduler.on_error() {
            Verdict::Retry(delay) => self.pause(delay).await,
            Verdict::Backoff(delay) => {
                warn!(
                    "Capture for {} keeps failing, backing off {:?}",
                    self.session_id, delay
                );
                self.announce("backoff");
                self.pause(delay).await
            }
            Verdict::GiveUp => {
                error!("Capture for {} gave up: {}", self.session_id, err);
                self.reporter
                    .failed(format!("Screen capture failed repeatedly: {}", err));
                false
            }
        }
    }

    fn on_success(&mut self) {
        self.scheduler.on_success();
        if self.degraded {
            self.degraded = false;
            self.throttler.clear("capture_failure");
            self.announce("recovered");
        }
    }

    /// Sleep unless cancelled first; `false` if cancelled
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    fn enter(&mut self, state: CycleState) {
        if let Err(e) = self.scheduler.transition(state) {
            debug!("{}", e);
        }
    }

    fn announce(&self, state: &str) {
        self.events.publish(SystemEvent::CaptureStateChanged {
            session_id: self.session_id.clone(),
            state: state.to_string(),
        });
    }
}

/// Spawn a producer for `session` on the current runtime
pub fn spawn_producer(session: MediaSession, config: CaptureConfig, events: Arc<EventBus>) {
    let producer = ChunkProducer::new(session, config, events);
    tokio::spawn(producer.run());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayEvent;
    use crate::transport::{ChannelReceiver, Outbound, PeerRole};
    use std::io::Write;
    use tokio::sync::mpsc;

    fn policy(threshold: u32, rounds: u32) -> RetryPolicy {
        RetryPolicy {
            min_interval: Duration::from_millis(100),
            retry_delay: Duration::from_millis(500),
            backoff_delay: Duration::from_secs(5),
            error_threshold: threshold,
            max_backoff_rounds: rounds,
        }
    }

    #[test]
    fn test_long_backoff_exactly_after_threshold() {
        let mut s = CaptureScheduler::new(policy(5, 0));
        for _ in 0..4 {
            assert_eq!(s.on_error(), Verdict::Retry(Duration::from_millis(500)));
        }
        assert_eq!(s.on_error(), Verdict::Backoff(Duration::from_secs(5)));
        assert_eq!(s.consecutive_errors(), 0);

        // counter restarted: four more short retries before the next backoff
        for _ in 0..4 {
            assert!(matches!(s.on_error(), Verdict::Retry(_)));
        }
        assert!(matches!(s.on_error(), Verdict::Backoff(_)));
    }

    #[test]
    fn test_success_resets_error_count() {
        let mut s = CaptureScheduler::new(policy(3, 0));
        s.on_error();
        s.on_error();
        s.on_success();
        assert_eq!(s.consecutive_errors(), 0);
        assert!(matches!(s.on_error(), Verdict::Retry(_)));
        assert!(matches!(s.on_error(), Verdict::Retry(_)));
        assert!(matches!(s.on_error(), Verdict::Backoff(_)));
    }

    #[test]
    fn test_gives_up_after_max_backoff_rounds() {
        let mut s = CaptureScheduler::new(policy(2, 2));
        let verdicts: Vec<Verdict> = (0..6).map(|_| s.on_error()).collect();
        assert!(matches!(verdicts[1], Verdict::Backoff(_)));
        assert!(matches!(verdicts[3], Verdict::Backoff(_)));
        assert_eq!(verdicts[5], Verdict::GiveUp);

        // a success in between starts the rounds over
        let mut s = CaptureScheduler::new(policy(1, 1));
        assert!(matches!(s.on_error(), Verdict::Backoff(_)));
        s.on_success();
        assert!(matches!(s.on_error(), Verdict::Backoff(_)));
        assert_eq!(s.on_error(), Verdict::GiveUp);
    }

    #[test]
    fn test_gate_guards_reentry_and_interval() {
        let mut s = CaptureScheduler::new(policy(5, 0));
        let t0 = Instant::now();

        assert_eq!(s.try_begin(t0, CycleState::Capturing), Gate::Ready);
        assert_eq!(s.try_begin(t0, CycleState::Capturing), Gate::InFlight);

        s.transition(CycleState::Emit).unwrap();
        s.transition(CycleState::Idle).unwrap();
        assert_eq!(
            s.gate(t0 + Duration::from_millis(40)),
            Gate::Wait(Duration::from_millis(60))
        );
        assert_eq!(s.gate(t0 + Duration::from_millis(100)), Gate::Ready);
    }

    #[test]
    fn test_cycle_transitions() {
        let mut s = CaptureScheduler::new(policy(5, 0));
        assert!(s.transition(CycleState::Emit).is_err());
        s.transition(CycleState::Capturing).unwrap();
        s.transition(CycleState::Converting).unwrap();
        assert!(s.transition(CycleState::Capturing).is_err());
        s.transition(CycleState::Error).unwrap();
        s.transition(CycleState::Idle).unwrap();
        assert_eq!(s.state(), CycleState::Idle);
    }

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn test_config(mode: CaptureMode, command: Vec<String>) -> CaptureConfig {
        CaptureConfig {
            enabled: true,
            mode,
            snapshot_command: command.clone(),
            snapshot_convert: Vec::new(),
            record_command: command,
            record_convert: Vec::new(),
            cycle_timeout_ms: 2000,
            min_interval_ms: 1,
            retry_delay_ms: 1,
            backoff_delay_ms: 5,
            error_threshold: 2,
            max_backoff_rounds: 1,
            ..CaptureConfig::default()
        }
    }

    struct Fixture {
        viewer_rx: ChannelReceiver,
        queue: mpsc::UnboundedReceiver<RelayEvent>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(config: CaptureConfig) -> Fixture {
        start_with_ceiling(config, 1 << 20)
    }

    fn start_with_ceiling(config: CaptureConfig, ceiling: u64) -> Fixture {
        let (viewer, viewer_rx) = PeerChannel::open(PeerRole::Viewer, ceiling);
        let (tx, queue) = mpsc::unbounded_channel();
        let cancel = viewer.close_token().child_token();
        let session = MediaSession {
            session_id: "s1".into(),
            params: CaptureParams::default(),
            viewer,
            cancel: cancel.clone(),
            reporter: MediaReporter::new(tx, "s1"),
        };
        let producer = ChunkProducer::new(session, config, Arc::new(EventBus::new()));
        let handle = tokio::spawn(producer.run());
        Fixture {
            viewer_rx,
            queue,
            cancel,
            handle,
        }
    }

    async fn next(rx: &mut ChannelReceiver) -> Outbound {
        let item = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        if let Outbound::Data(ref bytes) = item {
            rx.written(bytes.len());
        }
        item
    }

    /// Like `next` but leaves data unacknowledged
    async fn recv_unacked(rx: &mut ChannelReceiver) -> Outbound {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn text_json(item: &Outbound) -> serde_json::Value {
        match item {
            Outbound::Text(text) => serde_json::from_str(text).unwrap(),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_discrete_emits_metadata_then_frame() {
        let mut f = start(test_config(
            CaptureMode::Discrete,
            argv(&["printf", "jpegdata"]),
        ));

        for expected_seq in 1..=2u64 {
            let meta = text_json(&next(&mut f.viewer_rx).await);
            assert_eq!(meta["type"], "mjpeg_frame");
            assert_eq!(meta["sequence"], expected_seq);
            assert_eq!(meta["size"], 8);
            assert_eq!(
                next(&mut f.viewer_rx).await,
                Outbound::Data(Bytes::from_static(b"jpegdata"))
            );
        }

        f.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), f.handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_discrete_pauses_while_viewer_is_saturated() {
        let mut f = start_with_ceiling(
            test_config(CaptureMode::Discrete, argv(&["printf", "frame-data"])),
            4,
        );

        let meta = text_json(&recv_unacked(&mut f.viewer_rx).await);
        assert_eq!(meta["type"], "mjpeg_frame");
        assert_eq!(meta["sequence"], 1);
        let first = recv_unacked(&mut f.viewer_rx).await;
        assert_eq!(first, Outbound::Data(Bytes::from_static(b"frame-data")));

        // ten bytes outstanding against a four byte ceiling, nothing written yet
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(f.viewer_rx.try_recv().is_none());

        f.viewer_rx.written(10);
        let meta = text_json(&recv_unacked(&mut f.viewer_rx).await);
        assert_eq!(meta["type"], "mjpeg_frame");
        assert_eq!(meta["sequence"], 2);

        f.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), f.handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_discrete_gives_up_and_reports() {
        let mut f = start(test_config(CaptureMode::Discrete, argv(&["false"])));

        let warning = text_json(&next(&mut f.viewer_rx).await);
        assert_eq!(warning["type"], "capture_warning");
        assert_eq!(warning["sessionId"], "s1");

        let event = tokio::time::timeout(Duration::from_secs(5), f.queue.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            RelayEvent::MediaFailed { session_id, .. } => assert_eq!(session_id, "s1"),
            other => panic!("unexpected {:?}", other),
        }
        tokio::time::timeout(Duration::from_secs(5), f.handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_discards_in_flight_output() {
        let mut f = start(test_config(
            CaptureMode::Discrete,
            argv(&["sh", "-c", "sleep 1; printf late"]),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        f.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), f.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(f.viewer_rx.try_recv().is_none());
    }

    fn mk_box(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(kind);
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn test_continuous_restart_sends_reset_before_init() {
        let init = [mk_box(b"ftyp", b"iso5"), mk_box(b"moov", &[0u8; 16])].concat();
        let media = [mk_box(b"moof", &[0u8; 8]), mk_box(b"mdat", &[1u8; 32])].concat();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&init).unwrap();
        file.write_all(&media).unwrap();
        file.flush().unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let mut f = start(test_config(CaptureMode::Continuous, argv(&["cat", &path])));

        assert_eq!(next(&mut f.viewer_rx).await, Outbound::Data(Bytes::from(init.clone())));
        assert_eq!(next(&mut f.viewer_rx).await, Outbound::Data(Bytes::from(media.clone())));

        // recorder exited; the restart announces itself before the new init
        let reset = text_json(&next(&mut f.viewer_rx).await);
        assert_eq!(reset["type"], "stream_reset");
        assert_eq!(next(&mut f.viewer_rx).await, Outbound::Data(Bytes::from(init)));

        f.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), f.handle)
            .await
            .unwrap()
            .unwrap();
    }
}
