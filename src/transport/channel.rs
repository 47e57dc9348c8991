//! Per-peer duplex channel with byte-based backpressure
//!
//! Every connected peer owns exactly one [`PeerChannel`]. All outbound traffic
//! for the peer, control and media alike, goes through a single FIFO that one
//! writer task drains into the socket, so production order is delivery order.
//!
//! ```text
//! producer ──send_data──┐
//!                       ├──> FIFO ──> ChannelReceiver (writer task) ──> socket
//! relay ──send_control──┘        written(len) decrements outstanding bytes
//! ```

use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::PeerRole;
use crate::error::MirrorError;

/// Process-unique peer identity
pub type PeerId = u64;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Payload handed to [`PeerChannel::send`]
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Small structured message, exempt from backpressure
    Control(String),
    /// Media bytes, counted against the outstanding ceiling
    Data(Bytes),
}

/// Item pulled off the FIFO by the writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Data(Bytes),
    /// Channel closed locally; the writer should send a close frame and stop
    Close,
}

struct Shared {
    id: PeerId,
    role: PeerRole,
    ceiling: u64,
    outstanding: AtomicU64,
    drained: Notify,
    closed: CancellationToken,
    tx: mpsc::UnboundedSender<Outbound>,
}

/// Sending half of a peer's channel. Cheap to clone; all clones share the
/// same FIFO, counter and close state.
#[derive(Clone)]
pub struct PeerChannel {
    shared: Arc<Shared>,
}

/// Receiving half, owned by the writer task
pub struct ChannelReceiver {
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<Outbound>,
}

impl PeerChannel {
    /// Open a channel for a newly connected peer
    pub fn open(role: PeerRole, max_outstanding_bytes: u64) -> (Self, ChannelReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
            role,
            ceiling: max_outstanding_bytes,
            outstanding: AtomicU64::new(0),
            drained: Notify::new(),
            closed: CancellationToken::new(),
            tx,
        });
        debug!("Opened {} channel #{}", role, shared.id);
        (
            Self {
                shared: shared.clone(),
            },
            ChannelReceiver { shared, rx },
        )
    }

    pub fn id(&self) -> PeerId {
        self.shared.id
    }

    pub fn role(&self) -> PeerRole {
        self.shared.role
    }

    /// Data bytes queued but not yet written to the socket
    pub fn bytes_outstanding(&self) -> u64 {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Whether data sends are currently refused
    pub fn is_saturated(&self) -> bool {
        self.bytes_outstanding() > self.shared.ceiling
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Send a payload, applying backpressure to data only
    pub fn send(&self, payload: Payload) -> Result<(), MirrorError> {
        match payload {
            Payload::Control(text) => self.send_text(text),
            Payload::Data(bytes) => self.send_data(bytes),
        }
    }

    /// Serialize and send a control message
    pub fn send_control<T: Serialize>(&self, msg: &T) -> Result<(), MirrorError> {
        let text = serde_json::to_string(msg)
            .map_err(|e| MirrorError::ProtocolViolation(format!("unserializable message: {}", e)))?;
        self.send_text(text)
    }

    /// Queue a text frame; bypasses the backpressure check
    pub fn send_text(&self, text: String) -> Result<(), MirrorError> {
        if self.is_closed() {
            return Err(MirrorError::ChannelClosed);
        }
        self.shared
            .tx
            .send(Outbound::Text(text))
            .map_err(|_| MirrorError::ChannelClosed)
    }

    /// Queue a binary media unit
    ///
    /// Refused with `ChannelSaturated` while more than the ceiling is
    /// outstanding; callers wait on [`wait_drained`](Self::wait_drained).
    pub fn send_data(&self, bytes: Bytes) -> Result<(), MirrorError> {
        if self.is_closed() {
            return Err(MirrorError::ChannelClosed);
        }
        let outstanding = self.bytes_outstanding();
        if outstanding > self.shared.ceiling {
            return Err(MirrorError::ChannelSaturated {
                outstanding,
                ceiling: self.shared.ceiling,
            });
        }

        let len = bytes.len() as u64;
        self.shared.outstanding.fetch_add(len, Ordering::AcqRel);
        if self.shared.tx.send(Outbound::Data(bytes)).is_err() {
            self.shared.outstanding.fetch_sub(len, Ordering::AcqRel);
            return Err(MirrorError::ChannelClosed);
        }
        trace!(
            "Channel #{} queued {} bytes ({} outstanding)",
            self.shared.id,
            len,
            outstanding + len
        );
        Ok(())
    }

    /// Wait until outstanding bytes are at or below the ceiling
    ///
    /// Returns `ChannelClosed` if the channel closes while waiting.
    pub async fn wait_drained(&self) -> Result<(), MirrorError> {
        loop {
            let notified = self.shared.drained.notified();
            if self.is_closed() {
                return Err(MirrorError::ChannelClosed);
            }
            if !self.is_saturated() {
                return Ok(());
            }
            tokio::select! {
                _ = notified => {}
                _ = self.shared.closed.cancelled() => return Err(MirrorError::ChannelClosed),
            }
        }
    }

    /// Close the channel
    ///
    /// Takes effect synchronously: every later send fails and anything waiting
    /// on [`closed`](Self::closed) wakes immediately.
    pub fn close(&self) {
        if self.shared.closed.is_cancelled() {
            return;
        }
        self.shared.closed.cancel();
        let _ = self.shared.tx.send(Outbound::Close);
        debug!("Closed {} channel #{}", self.shared.role, self.shared.id);
    }

    /// Resolves once the channel is closed
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Token cancelled when this channel closes; children are handed to
    /// producers writing into the channel
    pub fn close_token(&self) -> CancellationToken {
        self.shared.closed.clone()
    }
}

impl std::fmt::Debug for PeerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerChannel")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("outstanding", &self.bytes_outstanding())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ChannelReceiver {
    pub fn id(&self) -> PeerId {
        self.shared.id
    }

    /// Next item in production order
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    /// Next queued item without waiting
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }

    /// Report that a data item of `len` bytes reached the socket
    pub fn written(&self, len: usize) {
        let len = len as u64;
        let prev = self
            .shared
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(len))
            })
            .unwrap_or(0);
        if prev.saturating_sub(len) <= self.shared.ceiling {
            self.shared.drained.notify_waiters();
        }
    }

    /// Mark the channel closed from the writer side (socket error or EOF)
    pub fn close(&self) {
        if !self.shared.closed.is_cancelled() {
            self.shared.closed.cancel();
        }
    }
}
