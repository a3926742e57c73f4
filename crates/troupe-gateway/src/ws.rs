//! WebSocket stream endpoint.
//!
//! Each accepted socket gets a freshly minted client id, a welcome
//! frame, and a writer task that owns the outbound half. All writes --
//! acks, forwarded bus envelopes, heartbeats -- go through the writer's
//! queue, so a client always observes its `ack` before any later
//! broadcast. Leaving the OPEN state tears down the writer task, which
//! clears the keep-alive timer and removes the socket from the
//! broadcast set.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use troupe_store::spawn_record_message;
use troupe_types::activity::ActivityRecord;
use troupe_types::envelope::{channels, Envelope, MessageType};
use troupe_types::payload::HumanInput;

use crate::frames::{ClientMessage, SystemFrame};
use crate::GatewayState;

/// Keep-alive cadence per socket.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// The set of sockets currently in the OPEN state.
///
/// Values are the senders feeding each socket's writer task; a closed
/// receiver marks a dead client, pruned on the next broadcast.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<Uuid, mpsc::UnboundedSender<String>>,
}

impl ClientRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, id: Uuid, tx: mpsc::UnboundedSender<String>) {
        self.clients.insert(id, tx);
    }

    fn unregister(&self, id: Uuid) {
        self.clients.remove(&id);
    }

    /// Send a frame to every open socket, pruning dead ones.
    ///
    /// Returns how many clients the frame was queued for.
    pub fn broadcast(&self, text: &str) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for entry in self.clients.iter() {
            if entry.value().send(text.to_string()).is_ok() {
                delivered += 1;
            } else {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.clients.remove(&id);
        }
        delivered
    }

    /// Number of open sockets.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no sockets are open.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// `GET /stream` upgrade handler.
pub async fn stream_handler(
    State(state): State<Arc<GatewayState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>) {
    let client_id = Uuid::new_v4();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel::<String>();
    state.clients.register(client_id, frame_tx.clone());
    debug!(%client_id, connections = state.clients.len(), "websocket open");

    let (sender, mut receiver) = socket.split();
    let writer = tokio::spawn(write_loop(sender, frame_rx, state.heartbeat_interval));

    let _ = frame_tx.send(SystemFrame::Welcome { client_id }.to_text());

    while let Some(result) = receiver.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                warn!(%client_id, error = %e, "websocket receive error");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                let reply = process_client_message(&state, client_id, &text).await;
                if frame_tx.send(reply.to_text()).is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            // Pings are answered by axum; binary frames are ignored.
            _ => {}
        }
    }

    state.clients.unregister(client_id);
    writer.abort();
    debug!(%client_id, connections = state.clients.len(), "websocket closed");
}

/// Owns the outbound half of one socket plus its keep-alive timer.
async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut frames: mpsc::UnboundedReceiver<String>,
    heartbeat_interval: Duration,
) {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    // The first tick fires immediately; skip it so the first heartbeat
    // happens one full interval after connect.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = heartbeat.tick() => {
                if sender
                    .send(Message::Text(SystemFrame::Heartbeat.to_text().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

/// Validate, stamp, publish, and log one inbound client message.
///
/// Failures produce an `error` frame; the connection stays open either
/// way.
async fn process_client_message(
    state: &Arc<GatewayState>,
    client_id: Uuid,
    text: &str,
) -> SystemFrame {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return SystemFrame::Error {
                message: format!("invalid message: {e}"),
            };
        }
    };

    if msg.content.trim().is_empty() {
        return SystemFrame::Error {
            message: "content must be a non-empty string".into(),
        };
    }

    let input = HumanInput {
        user_id: msg.user_id.unwrap_or_else(|| client_id.to_string()),
        content: msg.content,
        timestamp: Utc::now(),
        source: "websocket".into(),
    };
    let payload = match serde_json::to_value(&input) {
        Ok(payload) => payload,
        Err(e) => {
            error!(%client_id, error = %e, "failed to encode human input");
            return SystemFrame::Error {
                message: "internal encoding error".into(),
            };
        }
    };

    let envelope = Envelope::new(
        &state.agent_name,
        &state.orchestrator_name,
        MessageType::Question,
        payload,
    );
    if let Err(e) = state.bus.publish(channels::HUMAN_INPUT, &envelope).await {
        error!(%client_id, error = %e, "failed to publish human input");
        return SystemFrame::Error {
            message: "message could not be delivered".into(),
        };
    }

    // Best-effort activity row; a store outage never blocks the ack.
    spawn_record_message(
        state.store.clone(),
        ActivityRecord::from_envelope(&envelope),
    );

    SystemFrame::Ack
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_counts_and_prunes() {
        let registry = ClientRegistry::new();
        assert!(registry.is_empty());

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        registry.register(Uuid::new_v4(), tx_a);
        let id_b = Uuid::new_v4();
        registry.register(id_b, tx_b);
        assert_eq!(registry.len(), 2);

        // A dropped receiver is pruned on the next broadcast.
        drop(rx_b);
        let delivered = registry.broadcast("frame");
        assert_eq!(delivered, 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(rx_a.try_recv().unwrap(), "frame");
    }

    #[test]
    fn unregister_removes_socket() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        registry.register(id, tx);
        registry.unregister(id);
        assert!(registry.is_empty());
        assert_eq!(registry.broadcast("x"), 0);
    }
}
