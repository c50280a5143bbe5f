use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use pitchside_core::identity::ParticipantId;
use pitchside_core::rendezvous::{
    Handshake, RendezvousClient, RendezvousError, RendezvousTimeouts,
};

const HOST_ID: &str = "6f1c2a40-5d0e-4b7c-9a11-2b3c4d5e6f70";
const GUEST_ID: &str = "0a9b8c7d-6e5f-4a3b-8c2d-1e0f9a8b7c6d";

fn timeouts() -> RendezvousTimeouts {
    RendezvousTimeouts {
        response: Duration::from_secs(2),
        peer_wait: Duration::from_secs(2),
    }
}

/// Accept one connection, expect `expect_type` first, then send `replies`.
/// The socket stays open until the client goes away.
async fn scripted_server(expect_type: &'static str, replies: Vec<Value>) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = accept_async(stream).await.unwrap();
        let first = loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => break text,
                Some(Ok(_)) => continue,
                _ => return,
            }
        };
        let request: Value = serde_json::from_str(&first).unwrap();
        assert_eq!(request["type"], expect_type);
        for reply in replies {
            if socket.send(Message::Text(reply.to_string())).await.is_err() {
                return;
            }
        }
        while let Some(Ok(_)) = socket.next().await {}
    });
    Url::parse(&format!("ws://{addr}/handshake")).unwrap()
}

#[test_timeout::tokio_timeout_test(10)]
async fn host_receives_code_then_pairing_skipping_unknown_frames() {
    let url = scripted_server(
        "handshake-begin",
        vec![
            json!({"type": "server-news", "body": "welcome"}),
            json!({"type": "handshake-response", "yourId": HOST_ID, "code": 4821}),
            json!({"type": "handshake-complete", "yourId": HOST_ID, "otherId": GUEST_ID}),
        ],
    )
    .await;

    let mut client = RendezvousClient::new(url, timeouts());
    let code = client.begin_host().await.unwrap();
    assert_eq!(code.value(), 4821);

    let pairing = client.await_peer().await.unwrap();
    assert_eq!(pairing.self_id, HOST_ID.parse::<ParticipantId>().unwrap());
    assert_eq!(pairing.other_id, GUEST_ID.parse::<ParticipantId>().unwrap());

    client.cleanup().await;
    assert!(!client.is_connected());
}

#[test_timeout::tokio_timeout_test(10)]
async fn join_reports_malformed_other_id() {
    let url = scripted_server(
        "handshake-join",
        vec![json!({"type": "handshake-complete", "yourId": GUEST_ID, "otherId": "bogus"})],
    )
    .await;

    let mut client = RendezvousClient::new(url, timeouts());
    let err = client.join_with_code(4821).await.unwrap_err();
    match err {
        RendezvousError::InvalidIdentifier { field, value } => {
            assert_eq!(field, "otherId");
            assert_eq!(value, "bogus");
        }
        other => panic!("unexpected error {other:?}"),
    }
    client.cleanup().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn handshake_error_is_a_rejection() {
    let url = scripted_server(
        "handshake-join",
        vec![json!({"type": "handshake-error", "reason": "unknown or expired pairing code"})],
    )
    .await;

    let mut client = RendezvousClient::new(url, timeouts());
    let err = client.join_with_code(1234).await.unwrap_err();
    assert!(matches!(err, RendezvousError::Rejected(reason) if reason.contains("expired")));
}

#[test_timeout::tokio_timeout_test(10)]
async fn host_wait_is_bounded() {
    let url = scripted_server(
        "handshake-begin",
        vec![json!({"type": "handshake-response", "yourId": HOST_ID, "code": 4821})],
    )
    .await;

    let mut client = RendezvousClient::new(
        url,
        RendezvousTimeouts {
            response: Duration::from_secs(2),
            peer_wait: Duration::from_millis(200),
        },
    );
    client.begin_host().await.unwrap();
    let err = client.await_peer().await.unwrap_err();
    assert!(matches!(err, RendezvousError::Timeout("handshake-complete")));
    client.cleanup().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn out_of_range_code_is_invalid() {
    let url = scripted_server(
        "handshake-begin",
        vec![json!({"type": "handshake-response", "yourId": HOST_ID, "code": 12})],
    )
    .await;

    let mut client = RendezvousClient::new(url, timeouts());
    let err = client.begin_host().await.unwrap_err();
    assert!(matches!(err, RendezvousError::InvalidCode(12)));
    client.cleanup().await;
}

#[test_timeout::tokio_timeout_test(10)]
async fn unreachable_server_is_a_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let url = Url::parse(&format!("ws://{addr}/handshake")).unwrap();

    let mut client = RendezvousClient::new(url, timeouts());
    let err = client.begin_host().await.unwrap_err();
    assert!(matches!(err, RendezvousError::Connect(_)));
    assert!(!client.is_connected());
}
