use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Role of a transport unit in the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    /// Decoder configuration; must precede any media unit
    Init,
    Media,
}

/// One sequenced transport unit
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Per-session counter starting at 1
    pub sequence: u64,
    /// Producer wall clock, ms since the Unix epoch
    pub timestamp_ms: i64,
    /// Starts at a sync sample (continuous mode only)
    pub key_unit: bool,
    pub kind: UnitKind,
    pub payload: Bytes,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
