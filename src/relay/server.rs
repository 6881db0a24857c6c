//! Signaling relay - accepts participant connections and forwards
//! connection-negotiation events between room members.
//!
//! The relay is content-agnostic: SDP and candidate bodies are forwarded
//! verbatim, delivery is best-effort, and no transfer data ever passes
//! through it.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::any,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace};

use super::rooms::RoomTable;
use crate::wire::{ClientEvent, ServerEvent};

/// Shared relay state. Rooms are the only state mutated by multiple
/// independent connections; everything session-side lives with the peers.
#[derive(Clone, Default)]
pub struct RelayState {
    rooms: Arc<Mutex<RoomTable>>,
    participants: Arc<Mutex<HashMap<String, mpsc::Sender<String>>>>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn router(self) -> Router {
        Router::new().route("/", any(ws_handler)).with_state(self)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.room_count()
    }
}

/// Generate a participant identifier, unique per active connection.
/// Unrelated to any network address.
fn new_participant_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| char::from_digit(rng.gen_range(0..36), 36).unwrap())
        .collect()
}

fn encode(ev: &ServerEvent) -> String {
    serde_json::to_string(ev).unwrap()
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle one participant connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, state: RelayState) {
    let participant_id = new_participant_id();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(100);

    state
        .participants
        .lock()
        .await
        .insert(participant_id.clone(), tx.clone());

    // Forward queued outbound messages to the client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    info!("New relay connection: {}", participant_id);

    // The participant learns its own id from the first event
    let _ = tx
        .send(encode(&ServerEvent::Welcome {
            participant_id: participant_id.clone(),
        }))
        .await;

    while let Some(result) = receiver.next().await {
        let msg = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error from {}: {}", participant_id, e);
                break;
            }
        };

        trace!("Received from {}: {}", participant_id, msg);

        let event: ClientEvent = match serde_json::from_str(&msg) {
            Ok(ev) => ev,
            Err(e) => {
                debug!("Ignoring malformed event from {}: {}", participant_id, e);
                continue;
            }
        };

        match event {
            ClientEvent::JoinRoom { room_key } => {
                handle_join(&state, &participant_id, &room_key).await;
            }
            ClientEvent::Offer(mut payload) => {
                if payload.sender_id.is_none() {
                    payload.sender_id = Some(participant_id.clone());
                }
                forward_signal(&state, ServerEvent::Offer(payload)).await;
            }
            ClientEvent::Answer(mut payload) => {
                if payload.sender_id.is_none() {
                    payload.sender_id = Some(participant_id.clone());
                }
                forward_signal(&state, ServerEvent::Answer(payload)).await;
            }
            ClientEvent::IceCandidate(mut payload) => {
                if payload.sender_id.is_none() {
                    payload.sender_id = Some(participant_id.clone());
                }
                forward_signal(&state, ServerEvent::IceCandidate(payload)).await;
            }
        }
    }

    // Disconnect: leave every joined room and notify remaining members
    let departed = state.rooms.lock().await.leave_all(&participant_id);
    for (room, remaining) in departed {
        debug!("{} left room {}", participant_id, room);
        let ev = ServerEvent::UserDisconnected {
            participant_id: participant_id.clone(),
        };
        for member in remaining {
            deliver(&state, &member, &ev).await;
        }
    }

    state.participants.lock().await.remove(&participant_id);
    info!("Relay connection closed: {}", participant_id);
    send_task.abort();
}

async fn handle_join(state: &RelayState, participant_id: &str, room_key: &str) {
    let existing = state.rooms.lock().await.join(room_key, participant_id);
    info!(
        "{} joined room {} ({} existing member(s))",
        participant_id,
        room_key,
        existing.len()
    );

    // Tell the new joiner about one representative existing member: the
    // earliest joined. The protocol is two-party; extra members are tolerated
    // but never announced to the newcomer.
    if let Some(first) = existing.first() {
        deliver(
            state,
            participant_id,
            &ServerEvent::UserConnected {
                participant_id: first.clone(),
            },
        )
        .await;
    }

    // Tell every previous member about the new joiner
    for member in &existing {
        deliver(
            state,
            member,
            &ServerEvent::UserConnected {
                participant_id: participant_id.to_string(),
            },
        )
        .await;
    }
}

/// Forward a negotiation event to its target. Delivery is best-effort: an
/// unknown or gone target drops the message, the initiator's own retry loop
/// is the recovery mechanism.
async fn forward_signal(state: &RelayState, ev: ServerEvent) {
    let target = match &ev {
        ServerEvent::Offer(p) | ServerEvent::Answer(p) | ServerEvent::IceCandidate(p) => {
            p.target_id.clone()
        }
        _ => return,
    };

    if !deliver(state, &target, &ev).await {
        debug!("Dropping {} for unknown target {}", ev.event_type(), target);
    }
}

async fn deliver(state: &RelayState, participant_id: &str, ev: &ServerEvent) -> bool {
    let tx = {
        let participants = state.participants.lock().await;
        participants.get(participant_id).cloned()
    };

    match tx {
        Some(tx) => tx.send(encode(ev)).await.is_ok(),
        None => false,
    }
}
