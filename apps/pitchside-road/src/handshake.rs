//! Pairing-code rendezvous on `/handshake`.
//!
//! A host socket sends `handshake-begin`, receives a code and stays open
//! until a joiner presents that code. Codes are single use.

use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::protocol::{HandshakeReply, HandshakeRequest};

pub const CODE_MIN: u16 = 1000;
pub const CODE_MAX: u16 = 9999;
const CODE_ATTEMPTS: usize = 64;

struct PendingHost {
    host_id: Uuid,
    joined: oneshot::Sender<Uuid>,
    created: Instant,
}

/// Issued codes waiting for a joiner.
pub struct PendingPairings {
    entries: DashMap<u16, PendingHost>,
    ttl: Duration,
}

impl PendingPairings {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reserve a fresh code for `host_id`. `None` when no free code was found.
    fn register(&self, host_id: Uuid, joined: oneshot::Sender<Uuid>) -> Option<u16> {
        let mut rng = rand::thread_rng();
        for _ in 0..CODE_ATTEMPTS {
            let code = rng.gen_range(CODE_MIN..=CODE_MAX);
            if let Entry::Vacant(slot) = self.entries.entry(code) {
                slot.insert(PendingHost {
                    host_id,
                    joined,
                    created: Instant::now(),
                });
                return Some(code);
            }
        }
        None
    }

    /// Consume a code. Expired entries are discarded rather than returned.
    fn claim(&self, code: u16) -> Option<PendingHost> {
        let (_, pending) = self.entries.remove(&code)?;
        (pending.created.elapsed() <= self.ttl).then_some(pending)
    }

    fn release(&self, code: u16, host_id: Uuid) {
        self.entries
            .remove_if(&code, |_, pending| pending.host_id == host_id);
    }

    /// Drop codes older than the TTL; their hosts are told the code expired.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, pending| pending.created.elapsed() <= self.ttl);
        before.saturating_sub(self.entries.len())
    }
}

pub async fn handshake_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let reply = loop {
        let Some(text) = next_text(&mut receiver).await else {
            debug!("handshake socket closed before a request");
            return;
        };
        match serde_json::from_str::<HandshakeRequest>(&text) {
            Ok(HandshakeRequest::HandshakeBegin) => {
                host(&mut sender, &mut receiver, &state).await;
                let _ = sender.close().await;
                return;
            }
            Ok(HandshakeRequest::HandshakeJoin { code, your_id }) => {
                break join(&state, code, your_id);
            }
            Ok(HandshakeRequest::Unknown) => continue,
            Err(err) => {
                debug!("ignoring malformed handshake frame: {}", err);
                continue;
            }
        }
    };
    let _ = send(&mut sender, &reply).await;
    let _ = sender.close().await;
}

type Sender = futures_util::stream::SplitSink<WebSocket, Message>;

async fn host(sender: &mut Sender, receiver: &mut SplitStream<WebSocket>, state: &AppState) {
    let host_id = Uuid::new_v4();
    let (joined_tx, joined_rx) = oneshot::channel();
    let Some(code) = state.pairings.register(host_id, joined_tx) else {
        warn!("no free pairing code for host {}", host_id);
        let _ = send(
            sender,
            &HandshakeReply::HandshakeError {
                reason: "no pairing codes available".into(),
            },
        )
        .await;
        return;
    };
    info!("issued pairing code {} to host {}", code, host_id);

    if send(sender, &HandshakeReply::HandshakeResponse { your_id: host_id, code })
        .await
        .is_err()
    {
        state.pairings.release(code, host_id);
        return;
    }

    tokio::select! {
        joined = joined_rx => {
            let reply = match joined {
                Ok(other_id) => {
                    info!("pairing {} complete: host {} joiner {}", code, host_id, other_id);
                    HandshakeReply::HandshakeComplete { your_id: host_id, other_id }
                }
                Err(_) => HandshakeReply::HandshakeError {
                    reason: "pairing code expired".into(),
                },
            };
            let _ = send(sender, &reply).await;
        }
        _ = drain(receiver) => {
            debug!("host {} left before a joiner arrived", host_id);
        }
    }
    state.pairings.release(code, host_id);
}

fn join(state: &AppState, code: u32, your_id: Option<String>) -> HandshakeReply {
    let joiner_id = match your_id.as_deref().map(Uuid::parse_str) {
        Some(Ok(id)) => id,
        Some(Err(_)) => {
            return HandshakeReply::HandshakeError {
                reason: "yourId is not a valid uuid".into(),
            };
        }
        None => Uuid::new_v4(),
    };
    let Some(pending) = u16::try_from(code).ok().and_then(|code| state.pairings.claim(code)) else {
        debug!("join with unknown pairing code {}", code);
        return HandshakeReply::HandshakeError {
            reason: "unknown or expired pairing code".into(),
        };
    };
    if pending.joined.send(joiner_id).is_err() {
        return HandshakeReply::HandshakeError {
            reason: "host disconnected".into(),
        };
    }
    HandshakeReply::HandshakeComplete {
        your_id: joiner_id,
        other_id: pending.host_id,
    }
}

async fn next_text(receiver: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Binary(data)) => {
                if let Ok(text) = String::from_utf8(data) {
                    return Some(text);
                }
            }
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(err) => {
                debug!("handshake socket error: {}", err);
                return None;
            }
        }
    }
    None
}

/// Resolves once the peer has gone away; anything it sends is ignored.
async fn drain(receiver: &mut SplitStream<WebSocket>) {
    while next_text(receiver).await.is_some() {}
}

async fn send(sender: &mut Sender, reply: &HandshakeReply) -> Result<(), axum::Error> {
    let Ok(json) = serde_json::to_string(reply) else {
        return Ok(());
    };
    sender.send(Message::Text(json)).await
}
