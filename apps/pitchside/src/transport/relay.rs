//! Client for the signaling server's per-session relay room.
//!
//! The relay forwards opaque signal payloads between the two peers of one
//! session id. It never sees match data.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use super::TransportError;
use crate::identity::SessionId;

const TARGET: &str = "pitchside::relay";
const HEARTBEAT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayClientMessage {
    Signal { payload: Value },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayServerMessage {
    /// Sent once on entry with the number of peers already in the room.
    Joined { peers: usize },
    PeerJoined,
    PeerLeft,
    Signal { payload: Value },
    RoomFull,
    Pong,
    #[serde(other)]
    Unknown,
}

/// Offer/answer/candidate exchange carried inside relay `signal` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerSignal {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },
}

/// Relay endpoint for `session` under the signaling base URL.
pub fn room_url(signaling_url: &Url, session: &SessionId) -> Result<Url, TransportError> {
    let mut url = websocket_base(signaling_url)?;
    url.path_segments_mut()
        .map_err(|_| TransportError::Setup("signaling url cannot be a base".into()))?
        .pop_if_empty()
        .push("rooms")
        .push(&session.to_string());
    Ok(url)
}

/// `http(s)` bases are mapped to `ws(s)`; query and fragment are dropped.
pub fn websocket_base(signaling_url: &Url) -> Result<Url, TransportError> {
    let mut url = signaling_url.clone();
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(TransportError::Setup(format!(
                "unsupported signaling scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::Setup("invalid websocket scheme".into()))?;
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

pub struct RelayClient {
    send_tx: mpsc::UnboundedSender<RelayClientMessage>,
    signal_rx: AsyncMutex<mpsc::UnboundedReceiver<PeerSignal>>,
    peer_present: watch::Receiver<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl RelayClient {
    /// Connect and wait for the room's `joined` acknowledgement.
    pub async fn connect(url: &Url) -> Result<Arc<Self>, TransportError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Signaling(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target: TARGET, url = %url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<RelayClientMessage>();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel::<PeerSignal>();
        let (presence_tx, peer_present) = watch::channel(false);
        let (joined_tx, joined_rx) = oneshot::channel::<Result<(), TransportError>>();

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                let Ok(text) = serde_json::to_string(&message) else {
                    continue;
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            let mut joined_tx = Some(joined_tx);
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        log_socket_error(&err);
                        break;
                    }
                };
                let Ok(message) = serde_json::from_str::<RelayServerMessage>(&text) else {
                    tracing::trace!(target: TARGET, len = text.len(), "ignoring relay frame");
                    continue;
                };
                match message {
                    RelayServerMessage::Joined { peers } => {
                        tracing::debug!(target: TARGET, peers, "joined relay room");
                        let _ = presence_tx.send(peers > 0);
                        if let Some(tx) = joined_tx.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    RelayServerMessage::RoomFull => {
                        if let Some(tx) = joined_tx.take() {
                            let _ = tx.send(Err(TransportError::Signaling("relay room is full".into())));
                        }
                        break;
                    }
                    RelayServerMessage::PeerJoined => {
                        tracing::debug!(target: TARGET, "peer entered relay room");
                        let _ = presence_tx.send(true);
                    }
                    RelayServerMessage::PeerLeft => {
                        tracing::debug!(target: TARGET, "peer left relay room");
                        let _ = presence_tx.send(false);
                    }
                    RelayServerMessage::Signal { payload } => {
                        match serde_json::from_value::<PeerSignal>(payload) {
                            Ok(signal) => {
                                let _ = signal_tx.send(signal);
                            }
                            Err(err) => {
                                tracing::debug!(target: TARGET, error = %err, "dropping malformed peer signal");
                            }
                        }
                    }
                    RelayServerMessage::Pong | RelayServerMessage::Unknown => {}
                }
            }
            if let Some(tx) = joined_tx.take() {
                let _ = tx.send(Err(TransportError::Closed("relay closed before join")));
            }
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(RelayClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        let client = Arc::new(Self {
            send_tx,
            signal_rx: AsyncMutex::new(signal_rx),
            peer_present,
            tasks: vec![writer, reader, heartbeat],
        });

        match joined_rx.await {
            Ok(Ok(())) => Ok(client),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TransportError::Closed("relay reader stopped")),
        }
    }

    pub fn send_signal(&self, signal: &PeerSignal) -> Result<(), TransportError> {
        let payload = serde_json::to_value(signal)
            .map_err(|err| TransportError::Signaling(err.to_string()))?;
        self.send_tx
            .send(RelayClientMessage::Signal { payload })
            .map_err(|_| TransportError::Closed("relay writer"))
    }

    /// `None` once the relay connection has ended.
    pub async fn recv_signal(&self) -> Option<PeerSignal> {
        self.signal_rx.lock().await.recv().await
    }

    pub async fn wait_for_peer(&self) -> Result<(), TransportError> {
        let mut presence = self.peer_present.clone();
        presence
            .wait_for(|present| *present)
            .await
            .map(|_| ())
            .map_err(|_| TransportError::Closed("relay closed while waiting for peer"))
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

fn log_socket_error(err: &WsError) {
    match err {
        WsError::ConnectionClosed
        | WsError::AlreadyClosed
        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            tracing::debug!(target: TARGET, "relay websocket closed: {err}");
        }
        _ => {
            tracing::warn!(target: TARGET, "relay websocket error: {err}");
        }
    }
}
