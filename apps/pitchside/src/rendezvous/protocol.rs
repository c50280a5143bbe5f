use serde::{Deserialize, Serialize};

/// Frames sent from a client to the signaling server's handshake endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    HandshakeBegin,
    #[serde(rename_all = "camelCase")]
    HandshakeJoin {
        code: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        your_id: Option<String>,
    },
}

/// Frames received from the handshake endpoint.
///
/// Identifiers stay as raw strings here so the client can name the exact
/// value that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    HandshakeResponse { your_id: String, code: u32 },
    #[serde(rename_all = "camelCase")]
    HandshakeComplete { your_id: String, other_id: String },
    HandshakeError { reason: String },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_serializes_as_bare_type() {
        let text = serde_json::to_string(&ClientMessage::HandshakeBegin).unwrap();
        assert_eq!(text, r#"{"type":"handshake-begin"}"#);
    }

    #[test]
    fn join_uses_camel_case_fields() {
        let text = serde_json::to_string(&ClientMessage::HandshakeJoin {
            code: 4821,
            your_id: Some("abc".into()),
        })
        .unwrap();
        assert_eq!(text, r#"{"type":"handshake-join","code":4821,"yourId":"abc"}"#);
    }

    #[test]
    fn parses_complete_message() {
        let msg = ServerMessage::parse(
            r#"{"type":"handshake-complete","yourId":"a","otherId":"b"}"#,
        );
        assert_eq!(
            msg,
            Some(ServerMessage::HandshakeComplete {
                your_id: "a".into(),
                other_id: "b".into()
            })
        );
    }

    #[test]
    fn unknown_types_parse_as_unknown() {
        let msg = ServerMessage::parse(r#"{"type":"server-news","body":"hi"}"#);
        assert_eq!(msg, Some(ServerMessage::Unknown));
    }

    #[test]
    fn non_json_is_not_a_message() {
        assert_eq!(ServerMessage::parse("hello"), None);
    }
}
