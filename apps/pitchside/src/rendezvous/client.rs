use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::protocol::{ClientMessage, ServerMessage};
use super::{Handshake, HandshakeFactory, RendezvousError};
use crate::identity::{Pairing, PairingCode, ParticipantId};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TARGET: &str = "pitchside::rendezvous";

#[derive(Debug, Clone, Copy)]
pub struct RendezvousTimeouts {
    /// Bounds connect plus the begin/join response.
    pub response: Duration,
    /// Bounds the host's wait for a joiner.
    pub peer_wait: Duration,
}

impl Default for RendezvousTimeouts {
    fn default() -> Self {
        Self {
            response: Duration::from_secs(10),
            peer_wait: Duration::from_secs(300),
        }
    }
}

/// Builds [`RendezvousClient`]s against one handshake endpoint.
#[derive(Debug, Clone)]
pub struct RendezvousConnector {
    url: Url,
    timeouts: RendezvousTimeouts,
}

impl RendezvousConnector {
    pub fn new(url: Url, timeouts: RendezvousTimeouts) -> Self {
        Self { url, timeouts }
    }
}

impl HandshakeFactory for RendezvousConnector {
    fn handshake(&self) -> Box<dyn Handshake> {
        Box::new(RendezvousClient::new(self.url.clone(), self.timeouts))
    }
}

/// WebSocket implementation of [`Handshake`].
///
/// Every wait reads the socket directly and returns on the first matching
/// frame, so nothing keeps listening once a call resolves.
pub struct RendezvousClient {
    url: Url,
    timeouts: RendezvousTimeouts,
    socket: Option<Socket>,
}

impl RendezvousClient {
    pub fn new(url: Url, timeouts: RendezvousTimeouts) -> Self {
        Self {
            url,
            timeouts,
            socket: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    async fn open(&mut self) -> Result<(), RendezvousError> {
        self.cleanup().await;
        let connect = connect_async(self.url.as_str());
        let (socket, _) = tokio::time::timeout(self.timeouts.response, connect)
            .await
            .map_err(|_| RendezvousError::Timeout("signaling connection"))?
            .map_err(|err| RendezvousError::Connect(err.to_string()))?;
        tracing::debug!(target: TARGET, url = %self.url, "signaling websocket connected");
        self.socket = Some(socket);
        Ok(())
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<(), RendezvousError> {
        let socket = self.socket.as_mut().ok_or(RendezvousError::NotConnected)?;
        let text = serde_json::to_string(message)
            .map_err(|err| RendezvousError::Protocol(err.to_string()))?;
        socket
            .send(Message::Text(text))
            .await
            .map_err(map_socket_error)
    }

    /// Next recognised frame, in arrival order. Unknown message types and
    /// non-JSON frames are skipped.
    async fn next_message(&mut self) -> Result<ServerMessage, RendezvousError> {
        let socket = self.socket.as_mut().ok_or(RendezvousError::NotConnected)?;
        loop {
            let frame = match socket.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => return Err(map_socket_error(err)),
                None => return Err(RendezvousError::Closed),
            };
            let text = match frame {
                Message::Text(text) => text,
                Message::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Message::Close(_) => return Err(RendezvousError::Closed),
                _ => continue,
            };
            match ServerMessage::parse(&text) {
                Some(ServerMessage::Unknown) | None => {
                    tracing::trace!(target: TARGET, len = text.len(), "ignoring signaling frame");
                }
                Some(message) => return Ok(message),
            }
        }
    }

    async fn wait_for<T>(
        &mut self,
        what: &'static str,
        limit: Duration,
        mut pick: impl FnMut(ServerMessage) -> Option<Result<T, RendezvousError>> + Send,
    ) -> Result<T, RendezvousError> {
        let waited = tokio::time::timeout(limit, async {
            loop {
                let message = self.next_message().await?;
                if let ServerMessage::HandshakeError { reason } = message {
                    return Err(RendezvousError::Rejected(reason));
                }
                if let Some(result) = pick(message) {
                    return result;
                }
            }
        })
        .await;
        waited.map_err(|_| RendezvousError::Timeout(what))?
    }
}

#[async_trait]
impl Handshake for RendezvousClient {
    async fn begin_host(&mut self) -> Result<PairingCode, RendezvousError> {
        self.open().await?;
        self.send(&ClientMessage::HandshakeBegin).await?;
        let limit = self.timeouts.response;
        let code = self
            .wait_for("handshake-response", limit, |message| match message {
                ServerMessage::HandshakeResponse { your_id, code } => Some(
                    parse_participant("yourId", &your_id).and_then(|_| {
                        PairingCode::new(code).ok_or(RendezvousError::InvalidCode(code))
                    }),
                ),
                _ => None,
            })
            .await?;
        tracing::info!(target: TARGET, %code, "pairing code issued");
        Ok(code)
    }

    async fn await_peer(&mut self) -> Result<Pairing, RendezvousError> {
        if self.socket.is_none() {
            return Err(RendezvousError::NotConnected);
        }
        let limit = self.timeouts.peer_wait;
        let pairing = self
            .wait_for("handshake-complete", limit, complete_pairing)
            .await?;
        tracing::info!(
            target: TARGET,
            self_id = %pairing.self_id,
            other_id = %pairing.other_id,
            "peer joined pairing"
        );
        Ok(pairing)
    }

    async fn join_with_code(&mut self, code: u32) -> Result<Pairing, RendezvousError> {
        if code == 0 {
            return Err(RendezvousError::InvalidCode(code));
        }
        let own_id = ParticipantId::new_random();
        self.open().await?;
        self.send(&ClientMessage::HandshakeJoin {
            code,
            your_id: Some(own_id.to_string()),
        })
        .await?;
        let limit = self.timeouts.response;
        let pairing = self
            .wait_for("handshake-complete", limit, complete_pairing)
            .await?;
        if pairing.self_id != own_id {
            tracing::debug!(
                target: TARGET,
                requested = %own_id,
                assigned = %pairing.self_id,
                "signaling server assigned a different joiner id"
            );
        }
        tracing::info!(target: TARGET, code, other_id = %pairing.other_id, "joined pairing");
        Ok(pairing)
    }

    async fn cleanup(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(err) = socket.close(None).await {
                tracing::trace!(target: TARGET, error = %err, "signaling close failed");
            }
            tracing::debug!(target: TARGET, "signaling websocket closed");
        }
    }
}

fn complete_pairing(message: ServerMessage) -> Option<Result<Pairing, RendezvousError>> {
    match message {
        ServerMessage::HandshakeComplete { your_id, other_id } => Some(
            parse_participant("yourId", &your_id).and_then(|self_id| {
                parse_participant("otherId", &other_id).map(|other_id| Pairing { self_id, other_id })
            }),
        ),
        _ => None,
    }
}

fn parse_participant(field: &'static str, value: &str) -> Result<ParticipantId, RendezvousError> {
    value
        .parse()
        .map_err(|_| RendezvousError::InvalidIdentifier {
            field,
            value: value.to_string(),
        })
}

fn map_socket_error(err: WsError) -> RendezvousError {
    match err {
        WsError::ConnectionClosed
        | WsError::AlreadyClosed
        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => RendezvousError::Closed,
        other => RendezvousError::Socket(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> RendezvousClient {
        let url = Url::parse("ws://127.0.0.1:9/handshake").unwrap();
        RendezvousClient::new(url, RendezvousTimeouts::default())
    }

    #[tokio::test]
    async fn join_with_zero_code_fails_without_connecting() {
        let mut client = client();
        let err = client.join_with_code(0).await.unwrap_err();
        assert!(matches!(err, RendezvousError::InvalidCode(0)));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn await_peer_requires_open_connection() {
        let mut client = client();
        let err = client.await_peer().await.unwrap_err();
        assert!(matches!(err, RendezvousError::NotConnected));
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_without_socket() {
        let mut client = client();
        client.cleanup().await;
        client.cleanup().await;
        assert!(!client.is_connected());
    }

    #[test]
    fn complete_pairing_names_invalid_field() {
        let good = ParticipantId::new_random().to_string();
        let result = complete_pairing(ServerMessage::HandshakeComplete {
            your_id: good,
            other_id: "not-a-uuid".into(),
        });
        match result {
            Some(Err(RendezvousError::InvalidIdentifier { field, value })) => {
                assert_eq!(field, "otherId");
                assert_eq!(value, "not-a-uuid");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn complete_pairing_ignores_other_messages() {
        assert!(complete_pairing(ServerMessage::Unknown).is_none());
    }
}
