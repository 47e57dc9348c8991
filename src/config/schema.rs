use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub web: WebConfig,
    /// Signaling relay settings
    pub relay: RelayConfig,
    /// Screen capture pipeline settings
    pub capture: CaptureConfig,
    /// Per-peer transport settings
    pub transport: TransportConfig,
    /// Receiving-side playout settings
    pub playout: PlayoutConfig,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebConfig {
    /// Bind address
    pub bind_address: String,
    /// HTTP port
    pub http_port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8000,
        }
    }
}

/// Signaling relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// ICE server URLs sent to the device with every start request.
    /// Empty means the built-in public STUN list.
    pub ice_servers: Vec<String>,
    /// How long an unanswered device request is kept (ms)
    pub request_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            request_timeout_ms: 10_000,
        }
    }
}

impl RelayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Capture mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// One snapshot per cycle, sent as an MJPEG frame
    #[default]
    Discrete,
    /// One long-lived recorder process producing fragmented MP4
    Continuous,
}

/// Screen capture configuration
///
/// Command lines support `{width}`, `{height}` and `{fps}` placeholders,
/// substituted from the session's capture parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Run a local capture pipeline once the device accepts a start request
    pub enabled: bool,
    /// Capture mode
    pub mode: CaptureMode,
    /// Snapshot command (discrete mode)
    pub snapshot_command: Vec<String>,
    /// Snapshot convert command, fed the snapshot on stdin (optional)
    pub snapshot_convert: Vec<String>,
    /// Recorder command (continuous mode)
    pub record_command: Vec<String>,
    /// Recorder convert command, fed the recording on stdin (optional)
    pub record_convert: Vec<String>,
    /// Hard timeout for one discrete cycle (ms)
    pub cycle_timeout_ms: u64,
    /// Minimum interval between the start of two cycles (ms)
    pub min_interval_ms: u64,
    /// Retry delay after a failure below the threshold (ms)
    pub retry_delay_ms: u64,
    /// Delay once the consecutive error threshold is reached (ms)
    pub backoff_delay_ms: u64,
    /// Consecutive errors that trigger the long backoff
    pub error_threshold: u32,
    /// Long backoffs without a success before giving up (0 = never)
    pub max_backoff_rounds: u32,
    /// Read buffer size for continuous output (bytes)
    pub read_buffer_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: CaptureMode::Discrete,
            snapshot_command: strings(&["adb", "exec-out", "screencap", "-p"]),
            snapshot_convert: strings(&[
                "ffmpeg",
                "-loglevel",
                "error",
                "-f",
                "png_pipe",
                "-i",
                "pipe:0",
                "-vf",
                "scale={width}:{height}",
                "-q:v",
                "5",
                "-f",
                "mjpeg",
                "pipe:1",
            ]),
            record_command: strings(&[
                "adb",
                "exec-out",
                "screenrecord",
                "--output-format=h264",
                "--size",
                "{width}x{height}",
                "-",
            ]),
            record_convert: strings(&[
                "ffmpeg",
                "-loglevel",
                "error",
                "-f",
                "h264",
                "-r",
                "{fps}",
                "-i",
                "pipe:0",
                "-c:v",
                "copy",
                "-f",
                "mp4",
                "-movflags",
                "frag_keyframe+empty_moov+default_base_moof",
                "pipe:1",
            ]),
            cycle_timeout_ms: 5000,
            min_interval_ms: 100,
            retry_delay_ms: 500,
            backoff_delay_ms: 5000,
            error_threshold: 5,
            max_backoff_rounds: 3,
            read_buffer_size: 64 * 1024,
        }
    }
}

impl CaptureConfig {
    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_millis(self.cycle_timeout_ms)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn backoff_delay(&self) -> Duration {
        Duration::from_millis(self.backoff_delay_ms)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> std::result::Result<(), String> {
        let command = match self.mode {
            CaptureMode::Discrete => &self.snapshot_command,
            CaptureMode::Continuous => &self.record_command,
        };
        if self.enabled && command.is_empty() {
            return Err(format!("{:?} mode needs a capture command", self.mode));
        }
        if self.cycle_timeout_ms == 0 {
            return Err("cycle_timeout_ms must be positive".to_string());
        }
        if self.error_threshold == 0 {
            return Err("error_threshold must be positive".to_string());
        }
        if self.read_buffer_size == 0 {
            return Err("read_buffer_size must be positive".to_string());
        }
        Ok(())
    }
}

/// Per-peer transport configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Ceiling on queued-but-unwritten data bytes per peer
    pub max_outstanding_bytes: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_outstanding_bytes: 1024 * 1024,
        }
    }
}

/// Playout buffer configuration (seconds unless noted)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlayoutConfig {
    /// Maximum queued chunks before the oldest half is dropped
    pub max_queue_size: usize,
    /// Data kept behind the play position when trimming
    pub safety_margin: f64,
    /// Buffered-ahead amount that forces a seek to the live edge
    pub hard_ceiling: f64,
    /// Buffered-ahead amount that enables catch-up playback
    pub soft_threshold: f64,
    /// Playback rate while catching up
    pub catchup_rate: f64,
    /// Distance behind the buffer end to seek to
    pub live_edge_offset: f64,
    /// Amount removed from the buffer start when the sink is full
    pub emergency_trim: f64,
    /// Pacing tick interval (ms)
    pub tick_interval_ms: u64,
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 60,
            safety_margin: 2.0,
            hard_ceiling: 1.0,
            soft_threshold: 0.5,
            catchup_rate: 1.05,
            live_edge_offset: 0.1,
            emergency_trim: 1.0,
            tick_interval_ms: 250,
        }
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
