//! Device and viewer WebSocket endpoints
//!
//! Each accepted socket becomes one [`PeerChannel`] handed to the relay.
//! The socket is split: the reader posts text frames to the relay loop, the
//! writer drains the channel FIFO and reports written media bytes back for
//! backpressure.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::relay::RelayHandle;
use crate::state::AppState;
use crate::transport::{ChannelReceiver, Outbound, PeerChannel, PeerRole};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// `/ws/device`
pub async fn device_ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_peer_socket(socket, PeerRole::Device, state))
}

/// `/ws/viewer`
pub async fn viewer_ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_peer_socket(socket, PeerRole::Viewer, state))
}

async fn handle_peer_socket(socket: WebSocket, role: PeerRole, state: Arc<AppState>) {
    let (channel, outbound) = PeerChannel::open(role, state.channel_ceiling());
    let (sender, receiver) = socket.split();

    info!("{} #{} connected", role, channel.id());
    state.relay.connect(channel.clone());

    let writer = tokio::spawn(write_pump(sender, outbound));
    read_pump(receiver, &channel, &state.relay).await;

    state.relay.disconnected(role, channel.id());
    channel.close();
    if let Err(e) = writer.await {
        warn!("{} #{} writer task failed: {}", role, channel.id(), e);
    }
    info!("{} #{} disconnected", role, channel.id());
}

/// Forward text frames to the relay until the socket ends or the channel is
/// closed from our side (preemption, shutdown, writer failure)
async fn read_pump<R, E>(mut receiver: R, channel: &PeerChannel, relay: &RelayHandle)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let role = channel.role();
    let peer_id = channel.id();
    loop {
        tokio::select! {
            _ = channel.closed() => {
                debug!("{} #{} channel closed, stopping reader", role, peer_id);
                break;
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => relay.message(role, peer_id, text),
                Some(Ok(Message::Binary(data))) => {
                    debug!("Ignoring {} byte binary frame from {} #{}", data.len(), role, peer_id);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!("{} #{} receive error: {}", role, peer_id, e);
                    break;
                }
                _ => {}
            },
        }
    }
}

/// Drain the channel FIFO into the socket in production order
async fn write_pump<S>(mut sender: S, mut outbound: ChannelReceiver)
where
    S: Sink<Message> + Unpin,
{
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            item = outbound.recv() => match item {
                Some(Outbound::Text(text)) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Data(data)) => {
                    let len = data.len();
                    if sender.send(Message::Binary(data.to_vec())).await.is_err() {
                        break;
                    }
                    outbound.written(len);
                }
                Some(Outbound::Close) | None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    debug!("Writer for peer #{} exiting", outbound.id());
    outbound.close();
}
