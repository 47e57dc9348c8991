//! Control-channel message types
//!
//! Four directions, four types:
//!
//! | direction        | type             | framing                                  |
//! |------------------|------------------|------------------------------------------|
//! | device → relay   | [`DeviceInbound`]  | `{id, result\|error}` or `{method, params}` |
//! | relay → device   | [`DeviceOutbound`] | `{id?, method, params}`                  |
//! | viewer → relay   | [`ViewerAction`]   | `{action, ...}`                          |
//! | relay → viewer   | [`ViewerEvent`]    | `{type, ...}`                            |

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::MirrorError;

/// Device-side method names
pub mod method {
    pub const STREAM_START: &str = "stream/start";
    pub const STREAM_STOP: &str = "stream/stop";
    pub const STREAM_READY: &str = "stream/ready";
    pub const STREAM_ERROR: &str = "stream/error";
    pub const STREAM_STOPPED: &str = "stream/stopped";
    pub const WEBRTC_OFFER: &str = "webrtc/offer";
    pub const WEBRTC_ANSWER: &str = "webrtc/answer";
    pub const WEBRTC_ICE: &str = "webrtc/ice";
    pub const DEVICE_COMMAND: &str = "device/command";
}

/// Capture parameters negotiated for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CaptureParams {
    fn default() -> Self {
        Self {
            width: 720,
            height: 1280,
            fps: 30,
        }
    }
}

// ============================================================================
// Device → relay
// ============================================================================

/// Message received from the device
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceInbound {
    /// Reply to a request the relay sent earlier
    Response {
        id: u64,
        outcome: Result<Value, Value>,
    },
    /// Id-less notification
    Notification(DeviceNotification),
}

/// Notification sent by the device
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceNotification {
    Offer {
        sdp: String,
        session_id: Option<String>,
    },
    Answer {
        sdp: String,
        session_id: Option<String>,
    },
    Ice {
        candidate: Value,
        session_id: Option<String>,
    },
    StreamReady {
        session_id: Option<String>,
    },
    StreamError {
        session_id: Option<String>,
        error: String,
    },
    StreamStopped {
        session_id: Option<String>,
    },
    /// Method this relay does not understand
    Unknown { method: String },
}

impl DeviceNotification {
    /// Session id the notification refers to (`None` for unknown methods)
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Offer { session_id, .. }
            | Self::Answer { session_id, .. }
            | Self::Ice { session_id, .. }
            | Self::StreamReady { session_id }
            | Self::StreamError { session_id, .. }
            | Self::StreamStopped { session_id } => session_id.as_deref(),
            Self::Unknown { .. } => None,
        }
    }
}

#[derive(Deserialize)]
struct SdpParams {
    sdp: String,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct IceParams {
    candidate: Value,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct SessionParams {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

impl DeviceInbound {
    /// Parse one text frame from the device
    pub fn parse(text: &str) -> Result<Self, MirrorError> {
        let obj: Map<String, Value> = serde_json::from_str(text)
            .map_err(|e| MirrorError::ProtocolViolation(format!("invalid JSON: {}", e)))?;

        if obj.contains_key("result") || obj.contains_key("error") {
            let id = obj
                .get("id")
                .and_then(Value::as_u64)
                .ok_or_else(|| MirrorError::ProtocolViolation("response without id".into()))?;
            let outcome = match obj.get("error") {
                Some(err) if !err.is_null() => Err(err.clone()),
                _ => Ok(obj.get("result").cloned().unwrap_or(Value::Null)),
            };
            return Ok(Self::Response { id, outcome });
        }

        let method = obj
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| MirrorError::ProtocolViolation("message without method".into()))?;
        if obj.contains_key("id") {
            return Err(MirrorError::ProtocolViolation(format!(
                "device-originated request {} is not supported",
                method
            )));
        }
        let params = obj
            .get("params")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));

        let invalid =
            |e: serde_json::Error| MirrorError::ProtocolViolation(format!("{}: {}", method, e));

        let notification = match method {
            method::WEBRTC_OFFER => {
                let p: SdpParams = serde_json::from_value(params).map_err(invalid)?;
                DeviceNotification::Offer {
                    sdp: p.sdp,
                    session_id: p.session_id,
                }
            }
            method::WEBRTC_ANSWER => {
                let p: SdpParams = serde_json::from_value(params).map_err(invalid)?;
                DeviceNotification::Answer {
                    sdp: p.sdp,
                    session_id: p.session_id,
                }
            }
            method::WEBRTC_ICE => {
                let p: IceParams = serde_json::from_value(params).map_err(invalid)?;
                DeviceNotification::Ice {
                    candidate: p.candidate,
                    session_id: p.session_id,
                }
            }
            method::STREAM_READY => {
                let p: SessionParams = serde_json::from_value(params).map_err(invalid)?;
                DeviceNotification::StreamReady {
                    session_id: p.session_id,
                }
            }
            method::STREAM_ERROR => {
                let p: SessionParams = serde_json::from_value(params).map_err(invalid)?;
                let error = p
                    .message
                    .or_else(|| p.error.map(|e| value_to_message(&e)))
                    .unwrap_or_else(|| "Unknown device error".to_string());
                DeviceNotification::StreamError {
                    session_id: p.session_id,
                    error,
                }
            }
            method::STREAM_STOPPED => {
                let p: SessionParams = serde_json::from_value(params).map_err(invalid)?;
                DeviceNotification::StreamStopped {
                    session_id: p.session_id,
                }
            }
            other => DeviceNotification::Unknown {
                method: other.to_string(),
            },
        };

        Ok(Self::Notification(notification))
    }
}

/// Render a JSON-RPC style error value as a human-readable message
pub fn value_to_message(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

// ============================================================================
// Relay → device
// ============================================================================

/// Message sent to the device
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOutbound {
    StartStream {
        id: u64,
        session_id: String,
        params: CaptureParams,
        ice_servers: Vec<String>,
    },
    StopStream {
        id: u64,
    },
    Command {
        id: u64,
        params: Value,
    },
    Offer {
        sdp: String,
        session_id: String,
    },
    Answer {
        sdp: String,
        session_id: String,
    },
    Ice {
        candidate: Value,
        session_id: String,
    },
}

impl Serialize for DeviceOutbound {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl DeviceOutbound {
    fn to_value(&self) -> Value {
        match self {
            Self::StartStream {
                id,
                session_id,
                params,
                ice_servers,
            } => json!({
                "id": id,
                "method": method::STREAM_START,
                "params": {
                    "width": params.width,
                    "height": params.height,
                    "fps": params.fps,
                    "sessionId": session_id,
                    "iceServers": ice_servers
                        .iter()
                        .map(|url| json!({ "urls": url }))
                        .collect::<Vec<_>>(),
                },
            }),
            Self::StopStream { id } => json!({
                "id": id,
                "method": method::STREAM_STOP,
                "params": {},
            }),
            Self::Command { id, params } => json!({
                "id": id,
                "method": method::DEVICE_COMMAND,
                "params": params,
            }),
            Self::Offer { sdp, session_id } => json!({
                "method": method::WEBRTC_OFFER,
                "params": { "sdp": sdp, "sessionId": session_id },
            }),
            Self::Answer { sdp, session_id } => json!({
                "method": method::WEBRTC_ANSWER,
                "params": { "sdp": sdp, "sessionId": session_id },
            }),
            Self::Ice {
                candidate,
                session_id,
            } => json!({
                "method": method::WEBRTC_ICE,
                "params": { "candidate": candidate, "sessionId": session_id },
            }),
        }
    }
}

// ============================================================================
// Viewer → relay
// ============================================================================

/// Action requested by the viewer
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ViewerAction {
    StartStream {
        #[serde(default)]
        width: Option<u32>,
        #[serde(default)]
        height: Option<u32>,
        #[serde(default)]
        fps: Option<u32>,
        #[serde(default, rename = "iceServers")]
        ice_servers: Option<Vec<String>>,
    },
    StopStream,
    Answer {
        sdp: String,
        #[serde(default, rename = "sessionId")]
        session_id: Option<String>,
    },
    Offer {
        sdp: String,
        #[serde(default, rename = "sessionId")]
        session_id: Option<String>,
    },
    IceCandidate {
        candidate: Value,
        #[serde(default, rename = "sessionId")]
        session_id: Option<String>,
    },
    DeviceCommand {
        #[serde(default)]
        params: Value,
    },
    Ping,
    /// Action this relay does not understand
    #[serde(other)]
    Unknown,
}

impl ViewerAction {
    /// Parse one text frame from the viewer
    pub fn parse(text: &str) -> Result<Self, MirrorError> {
        serde_json::from_str(text)
            .map_err(|e| MirrorError::ProtocolViolation(format!("invalid viewer message: {}", e)))
    }
}

// ============================================================================
// Relay → viewer
// ============================================================================

/// Message sent to the viewer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerEvent {
    Offer {
        sdp: String,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Answer {
        sdp: String,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    IceCandidate {
        candidate: Value,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// The device accepted the start request
    StreamStarting {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    StreamReady {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    StreamError {
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        error: String,
    },
    StreamStopped {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Continuous pipeline restarted; a new init unit follows
    StreamReset {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    DeviceConnected,
    DeviceDisconnected,
    ConnectionStatus {
        #[serde(rename = "deviceConnected")]
        device_connected: bool,
        #[serde(rename = "sessionId")]
        session_id: Option<String>,
    },
    CommandResult {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
    /// Non-fatal capture failure
    CaptureWarning {
        #[serde(rename = "sessionId")]
        session_id: String,
        error: String,
    },
    /// Metadata for the binary snapshot frame that immediately follows
    MjpegFrame {
        timestamp: i64,
        size: usize,
        #[serde(rename = "processingTime")]
        processing_time: u64,
        sequence: u64,
    },
    Pong,
    Error {
        error: String,
    },
}
