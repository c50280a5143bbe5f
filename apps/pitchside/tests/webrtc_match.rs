//! Two peers negotiating a real WebRTC data channel over loopback, signaled
//! through the road's relay room.

use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use url::Url;

use pitchside_core::identity::{NetworkLocalState, Pairing, ParticipantId};
use pitchside_core::store::{ChangeOrigin, Collection, Store};
use pitchside_core::transport::{Establisher, WebRtcConfig, WebRtcEstablisher};

async fn start_road() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = pitchside_road::AppState::new(Duration::from_secs(60));
    tokio::spawn(async move {
        pitchside_road::serve(listener, state).await.unwrap();
    });
    Url::parse(&format!("ws://{addr}")).unwrap()
}

async fn match_collection() -> Collection {
    Store::in_memory()
        .collection(pitchside_core::match_state::schema())
        .await
        .unwrap()
}

fn keys_for(self_id: ParticipantId, other_id: ParticipantId) -> NetworkLocalState {
    NetworkLocalState::from_pairing(&Pairing { self_id, other_id })
}

#[test_timeout::tokio_timeout_test(30)]
async fn webrtc_peers_sync_snapshots_live_writes_and_close() {
    let road = start_road().await;
    let (a_id, b_id) = (ParticipantId::new_random(), ParticipantId::new_random());
    let a_keys = keys_for(a_id, b_id);
    let b_keys = keys_for(b_id, a_id);
    assert_eq!(a_keys.gid, b_keys.gid);

    let a_docs = match_collection().await;
    let b_docs = match_collection().await;
    a_docs
        .upsert(&a_id.to_string(), json!({"player": a_id.to_string(), "score": 2}))
        .await
        .unwrap();

    let a_side = WebRtcEstablisher::new(road.clone(), WebRtcConfig::localhost());
    let b_side = WebRtcEstablisher::new(road, WebRtcConfig::localhost());
    let (a, b) = tokio::join!(
        a_side.establish(&a_keys, a_docs.clone()),
        b_side.establish(&b_keys, b_docs.clone()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.is_active() && b.is_active());
    assert_eq!(a.session_id(), b.session_id());

    // The opening snapshot carried A's side across.
    let mirrored = b_docs.find_one(&a_id.to_string()).await.unwrap().unwrap();
    assert_eq!(mirrored.field("score"), Some(&json!(2)));

    let mut a_events = a_docs.subscribe().await.unwrap();
    b_docs
        .upsert(&b_id.to_string(), json!({"player": b_id.to_string(), "score": 5}))
        .await
        .unwrap();
    loop {
        let event = a_events.recv().await.unwrap();
        if event.origin == ChangeOrigin::Remote && event.change.id() == b_id.to_string() {
            break;
        }
    }
    let live = a_docs.find_one(&b_id.to_string()).await.unwrap().unwrap();
    assert_eq!(live.field("score"), Some(&json!(5)));

    b.cancel().await;
    assert!(!b.is_active());
    a.closed().await;
    assert!(!a.is_active());
}

#[test_timeout::tokio_timeout_test(10)]
async fn self_pairing_is_refused_before_signaling() {
    let id = ParticipantId::new_random();
    let keys = keys_for(id, id);
    // Nothing listens here; refusal must come before any connection attempt.
    let establisher = WebRtcEstablisher::new(
        Url::parse("ws://127.0.0.1:9").unwrap(),
        WebRtcConfig::localhost(),
    );
    let err = establisher
        .establish(&keys, match_collection().await)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        pitchside_core::transport::TransportError::Setup(_)
    ));
}
