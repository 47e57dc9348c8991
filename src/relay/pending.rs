//! Correlation table for requests forwarded to the device

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::protocol::method;

/// Request kinds the relay sends to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMethod {
    StreamStart,
    StreamStop,
    Command,
}

impl DeviceMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StreamStart => method::STREAM_START,
            Self::StreamStop => method::STREAM_STOP,
            Self::Command => method::DEVICE_COMMAND,
        }
    }
}

/// An outstanding request
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: u64,
    pub method: DeviceMethod,
    /// Session current when the request was sent
    pub session_id: Option<String>,
    pub sent_at: Instant,
}

/// Outstanding requests keyed by id
///
/// Ids are locally monotonic and never reused within one relay instance.
#[derive(Debug)]
pub struct PendingRequests {
    next_id: u64,
    entries: HashMap<u64, PendingRequest>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    /// Allocate an id and record the request
    pub fn register(&mut self, method: DeviceMethod, session_id: Option<String>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            PendingRequest {
                id,
                method,
                session_id,
                sent_at: Instant::now(),
            },
        );
        id
    }

    /// Remove and return the request for `id`; `None` if unknown or consumed
    pub fn take(&mut self, id: u64) -> Option<PendingRequest> {
        self.entries.remove(&id)
    }

    /// Forget one request without resolving it (send failed)
    pub fn cancel(&mut self, id: u64) {
        self.entries.remove(&id);
    }

    /// Drop requests sent on behalf of `session_id`
    pub fn cancel_session(&mut self, session_id: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, req| req.session_id.as_deref() != Some(session_id));
        before - self.entries.len()
    }

    /// Drop every outstanding request of `method`; a newer one replaces them
    pub fn supersede(&mut self, method: DeviceMethod) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, req| req.method != method);
        before - self.entries.len()
    }

    /// Remove and return requests sent more than `timeout` before `now`
    pub fn expire(&mut self, timeout: Duration, now: Instant) -> Vec<PendingRequest> {
        let stale: Vec<u64> = self
            .entries
            .values()
            .filter(|req| now.saturating_duration_since(req.sent_at) > timeout)
            .map(|req| req.id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    /// Drop every outstanding request; returns how many were discarded
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
