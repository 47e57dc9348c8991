//! Observer WebSocket at `/api/events`
//!
//! Streams [`SystemEvent`]s as JSON. Clients pick topics with
//! `{"type":"subscribe","payload":{"topics":["session.*"]}}`; nothing is sent
//! until the first subscription.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::SystemEvent;
use crate::state::AppState;

/// Client-to-server message
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload")]
enum ClientMessage {
    #[serde(rename = "subscribe")]
    Subscribe { topics: Vec<String> },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { topics: Vec<String> },

    #[serde(rename = "ping")]
    Ping,
}

pub async fn events_ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut event_rx = state.events.subscribe();
    let mut topics: Vec<String> = vec![];

    info!("Event observer connected");

    let mut heartbeat = tokio::time::interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = apply_client_message(&text, &mut topics) {
                        warn!("Bad observer message: {}", e);
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!("Observer receive error: {}", e);
                    break;
                }
                _ => {}
            },

            event = event_rx.recv() => match event {
                Ok(event) => {
                    if !should_send_event(&event, &topics) {
                        continue;
                    }
                    match serde_json::to_string(&event) {
                        Ok(json) => {
                            if sender.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to serialize event: {}", e),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event observer lagged by {} events", n);
                    let lagged = SystemEvent::Error {
                        message: format!("Lagged by {} events", n),
                    };
                    if let Ok(json) = serde_json::to_string(&lagged) {
                        let _ = sender.send(Message::Text(json)).await;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    warn!("Event bus closed");
                    break;
                }
            },

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
            }
        }
    }

    info!("Event observer disconnected");
}

fn apply_client_message(text: &str, topics: &mut Vec<String>) -> Result<(), serde_json::Error> {
    match serde_json::from_str(text)? {
        ClientMessage::Subscribe { topics: new_topics } => {
            debug!("Observer subscribed to {:?}", new_topics);
            *topics = new_topics;
        }
        ClientMessage::Unsubscribe { topics: removed } => {
            topics.retain(|t| !removed.contains(t));
        }
        ClientMessage::Ping => {}
    }
    Ok(())
}

fn should_send_event(event: &SystemEvent, topics: &[String]) -> bool {
    topics.iter().any(|topic| event.matches_topic(topic))
}
