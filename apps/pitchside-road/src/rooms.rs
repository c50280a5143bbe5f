//! Two-peer relay rooms on `/rooms/:session_id`.
//!
//! The server forwards signal payloads verbatim to the other peer in the
//! room; it never inspects them.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::AppState;
use crate::protocol::{RelayEvent, RelayRequest};

pub const ROOM_CAPACITY: usize = 2;

struct RoomPeer {
    id: Uuid,
    tx: mpsc::UnboundedSender<RelayEvent>,
}

#[derive(Default)]
pub struct Rooms {
    rooms: DashMap<String, Vec<RoomPeer>>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn occupancy(&self, room: &str) -> usize {
        self.rooms.get(room).map(|peers| peers.len()).unwrap_or(0)
    }

    /// Add a peer, telling it how many were already present and telling
    /// them it arrived. `false` when the room is full.
    fn enter(&self, room: &str, id: Uuid, tx: mpsc::UnboundedSender<RelayEvent>) -> bool {
        let mut peers = self.rooms.entry(room.to_string()).or_default();
        if peers.len() >= ROOM_CAPACITY {
            return false;
        }
        let _ = tx.send(RelayEvent::Joined { peers: peers.len() });
        for peer in peers.iter() {
            let _ = peer.tx.send(RelayEvent::PeerJoined);
        }
        peers.push(RoomPeer { id, tx });
        true
    }

    fn forward(&self, room: &str, from: Uuid, event: RelayEvent) {
        if let Some(peers) = self.rooms.get(room) {
            for peer in peers.iter().filter(|peer| peer.id != from) {
                let _ = peer.tx.send(event.clone());
            }
        }
    }

    fn leave(&self, room: &str, id: Uuid) {
        let empty = match self.rooms.get_mut(room) {
            Some(mut peers) => {
                peers.retain(|peer| peer.id != id);
                for peer in peers.iter() {
                    let _ = peer.tx.send(RelayEvent::PeerLeft);
                }
                peers.is_empty()
            }
            None => false,
        };
        if empty {
            self.rooms.remove_if(room, |_, peers| peers.is_empty());
        }
    }
}

pub async fn room_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    // Rooms are named by the hyphenated session uuid.
    let Ok(session) = Uuid::parse_str(&session_id) else {
        return (StatusCode::BAD_REQUEST, "session id must be a uuid").into_response();
    };
    let room = session.hyphenated().to_string();
    ws.on_upgrade(move |socket| handle_socket(socket, room, state))
}

async fn handle_socket(socket: WebSocket, room: String, state: AppState) {
    let peer_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RelayEvent>();

    if !state.rooms.enter(&room, peer_id, tx.clone()) {
        info!("room {} is full; rejecting peer {}", room, peer_id);
        if let Ok(json) = serde_json::to_string(&RelayEvent::RoomFull) {
            let _ = sender.send(Message::Text(json)).await;
        }
        let _ = sender.close().await;
        return;
    }
    debug!("peer {} entered room {}", peer_id, room);

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&event) else {
                continue;
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!("room socket error from peer {}: {}", peer_id, err);
                break;
            }
        };
        match serde_json::from_str::<RelayRequest>(&text) {
            Ok(RelayRequest::Signal { payload }) => {
                state
                    .rooms
                    .forward(&room, peer_id, RelayEvent::Signal { payload });
            }
            Ok(RelayRequest::Ping) => {
                let _ = tx.send(RelayEvent::Pong);
            }
            Ok(RelayRequest::Unknown) => {}
            Err(err) => {
                debug!("ignoring malformed relay frame from {}: {}", peer_id, err);
            }
        }
    }

    state.rooms.leave(&room, peer_id);
    drop(tx);
    let _ = writer.await;
    debug!("peer {} left room {}", peer_id, room);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn third_peer_is_turned_away() {
        let rooms = Rooms::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (c_tx, _c_rx) = mpsc::unbounded_channel();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(rooms.enter("r", a, a_tx));
        assert_eq!(a_rx.try_recv().unwrap(), RelayEvent::Joined { peers: 0 });
        assert!(rooms.enter("r", b, b_tx));
        assert_eq!(b_rx.try_recv().unwrap(), RelayEvent::Joined { peers: 1 });
        assert_eq!(a_rx.try_recv().unwrap(), RelayEvent::PeerJoined);

        assert!(!rooms.enter("r", Uuid::new_v4(), c_tx));
        assert_eq!(rooms.occupancy("r"), 2);
    }

    #[test]
    fn forward_skips_sender_and_leave_cleans_up() {
        let rooms = Rooms::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        rooms.enter("r", a, a_tx);
        rooms.enter("r", b, b_tx);
        while a_rx.try_recv().is_ok() {}
        while b_rx.try_recv().is_ok() {}

        let payload = serde_json::json!({"kind": "offer", "sdp": "v=0"});
        rooms.forward("r", a, RelayEvent::Signal { payload: payload.clone() });
        assert_eq!(b_rx.try_recv().unwrap(), RelayEvent::Signal { payload });
        assert!(a_rx.try_recv().is_err());

        rooms.leave("r", a);
        assert_eq!(b_rx.try_recv().unwrap(), RelayEvent::PeerLeft);
        rooms.leave("r", b);
        assert_eq!(rooms.room_count(), 0);
    }
}
