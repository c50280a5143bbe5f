use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Frames a client sends on `/handshake`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HandshakeRequest {
    HandshakeBegin,
    #[serde(rename_all = "camelCase")]
    HandshakeJoin {
        code: u32,
        /// Joiner-generated id; the server picks one when absent.
        #[serde(default)]
        your_id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Frames the server sends on `/handshake`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HandshakeReply {
    #[serde(rename_all = "camelCase")]
    HandshakeResponse { your_id: Uuid, code: u16 },
    #[serde(rename_all = "camelCase")]
    HandshakeComplete { your_id: Uuid, other_id: Uuid },
    HandshakeError { reason: String },
}

/// Frames a client sends on `/rooms/:session_id`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayRequest {
    Signal { payload: Value },
    Ping,
    #[serde(other)]
    Unknown,
}

/// Frames the server sends on `/rooms/:session_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    Joined { peers: usize },
    PeerJoined,
    PeerLeft,
    Signal { payload: Value },
    RoomFull,
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_accepts_optional_id() {
        let join: HandshakeRequest =
            serde_json::from_str(r#"{"type":"handshake-join","code":4821}"#).unwrap();
        assert_eq!(join, HandshakeRequest::HandshakeJoin { code: 4821, your_id: None });

        let join: HandshakeRequest = serde_json::from_str(
            r#"{"type":"handshake-join","code":4821,"yourId":"f2a5c1d0-0000-4000-8000-000000000001"}"#,
        )
        .unwrap();
        assert!(matches!(join, HandshakeRequest::HandshakeJoin { your_id: Some(_), .. }));

        let other: HandshakeRequest = serde_json::from_str(r#"{"type":"hello"}"#).unwrap();
        assert_eq!(other, HandshakeRequest::Unknown);
    }

    #[test]
    fn replies_use_camel_case_ids() {
        let host = Uuid::nil();
        let value = serde_json::to_value(HandshakeReply::HandshakeResponse {
            your_id: host,
            code: 4821,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "handshake-response", "yourId": host.to_string(), "code": 4821})
        );
    }

    #[test]
    fn relay_events_are_snake_case() {
        let value = serde_json::to_value(RelayEvent::PeerJoined).unwrap();
        assert_eq!(value, json!({"type": "peer_joined"}));
        let value = serde_json::to_value(RelayEvent::Joined { peers: 1 }).unwrap();
        assert_eq!(value, json!({"type": "joined", "peers": 1}));
    }
}
