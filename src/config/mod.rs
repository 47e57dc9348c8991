//! Configuration schema and file-backed store

mod schema;
mod store;

pub use schema::{
    AppConfig, CaptureConfig, CaptureMode, PlayoutConfig, RelayConfig, TransportConfig, WebConfig,
};
pub use store::{ConfigChange, ConfigStore};
