//! WebRTC data channel link negotiated over a [`RelayClient`].

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::config::WebRtcConfig;
use super::relay::{PeerSignal, RelayClient};
use super::{PeerLink, Role, TransportError};

const TARGET: &str = "pitchside::webrtc";

/// Largest frame sent as a single SCTP message (64KB minus overhead).
pub const MAX_FRAME_SIZE: usize = 60_000;

type InboundSender = Arc<Mutex<Option<mpsc::UnboundedSender<Bytes>>>>;

pub struct WebRtcLink {
    peer_connection: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
    inbound_tx: InboundSender,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
}

/// Negotiate a data channel with the peer on the other end of `relay`.
///
/// Resolves once the channel is open. The relay is no longer needed after
/// that and may be dropped by the caller.
pub async fn connect(
    config: &WebRtcConfig,
    relay: Arc<RelayClient>,
    role: Role,
) -> Result<WebRtcLink, TransportError> {
    let api = APIBuilder::new().build();
    let rtc_config = RTCConfiguration {
        ice_servers: config.ice_servers.clone(),
        ..Default::default()
    };
    let peer_connection = Arc::new(
        api.new_peer_connection(rtc_config)
            .await
            .map_err(|err| TransportError::Setup(err.to_string()))?,
    );

    let (inbound, inbound_rx) = mpsc::unbounded_channel::<Bytes>();
    let inbound_tx: InboundSender = Arc::new(Mutex::new(Some(inbound)));
    let (open_tx, mut open_rx) = mpsc::unbounded_channel::<Arc<RTCDataChannel>>();
    let (failure_tx, mut failure_rx) = mpsc::unbounded_channel::<TransportError>();

    let failure_for_state = failure_tx.clone();
    let inbound_for_state = inbound_tx.clone();
    peer_connection.on_peer_connection_state_change(Box::new(
        move |state: RTCPeerConnectionState| {
            let failure = failure_for_state.clone();
            let inbound = inbound_for_state.clone();
            Box::pin(async move {
                tracing::debug!(target: TARGET, ?state, "peer connection state changed");
                match state {
                    RTCPeerConnectionState::Failed => {
                        let _ = failure.send(TransportError::Negotiation(
                            "ice negotiation failed".into(),
                        ));
                        inbound.lock().take();
                    }
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                        let _ = failure.send(TransportError::Closed("peer connection"));
                        inbound.lock().take();
                    }
                    _ => {}
                }
            })
        },
    ));

    let relay_for_ice: Weak<RelayClient> = Arc::downgrade(&relay);
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let relay = relay_for_ice.clone();
        Box::pin(async move {
            let (Some(candidate), Some(relay)) = (candidate, relay.upgrade()) else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let signal = PeerSignal::IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    };
                    if let Err(err) = relay.send_signal(&signal) {
                        tracing::debug!(target: TARGET, error = %err, "failed to relay ice candidate");
                    }
                }
                Err(err) => {
                    tracing::debug!(target: TARGET, error = %err, "failed to encode ice candidate");
                }
            }
        })
    }));

    match role {
        Role::Offerer => {
            let init = RTCDataChannelInit {
                ordered: Some(config.ordered),
                ..Default::default()
            };
            let channel = peer_connection
                .create_data_channel(&config.data_channel_label, Some(init))
                .await
                .map_err(|err| TransportError::Setup(err.to_string()))?;
            setup_data_channel(channel, inbound_tx.clone(), open_tx);
        }
        Role::Answerer => {
            let expected = config.data_channel_label.clone();
            let inbound = inbound_tx.clone();
            peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let inbound = inbound.clone();
                let open_tx = open_tx.clone();
                let expected = expected.clone();
                Box::pin(async move {
                    if channel.label() != expected {
                        tracing::debug!(target: TARGET, label = channel.label(), "ignoring unexpected data channel");
                        return;
                    }
                    setup_data_channel(channel, inbound, open_tx);
                })
            }));
        }
    }

    let pump = tokio::spawn(pump_signals(
        peer_connection.clone(),
        relay.clone(),
        role,
        failure_tx.clone(),
    ));

    if role == Role::Offerer {
        tracing::debug!(target: TARGET, "waiting for peer before offering");
        if let Err(err) = relay.wait_for_peer().await {
            pump.abort();
            let _ = peer_connection.close().await;
            return Err(err);
        }
        if let Err(err) = send_offer(&peer_connection, &relay).await {
            pump.abort();
            let _ = peer_connection.close().await;
            return Err(err);
        }
    }

    let outcome = tokio::select! {
        channel = open_rx.recv() => {
            channel.ok_or(TransportError::Closed("data channel setup"))
        }
        failure = failure_rx.recv() => {
            Err(failure.unwrap_or(TransportError::Closed("negotiation")))
        }
    };
    pump.abort();

    match outcome {
        Ok(channel) => {
            tracing::info!(target: TARGET, label = channel.label(), ?role, "data channel open");
            Ok(WebRtcLink {
                peer_connection,
                channel,
                inbound_tx,
                inbound_rx: AsyncMutex::new(inbound_rx),
            })
        }
        Err(err) => {
            let _ = peer_connection.close().await;
            Err(err)
        }
    }
}

async fn send_offer(
    peer_connection: &RTCPeerConnection,
    relay: &RelayClient,
) -> Result<(), TransportError> {
    let offer = peer_connection
        .create_offer(None)
        .await
        .map_err(|err| TransportError::Negotiation(err.to_string()))?;
    peer_connection
        .set_local_description(offer.clone())
        .await
        .map_err(|err| TransportError::Negotiation(err.to_string()))?;
    relay.send_signal(&PeerSignal::Offer { sdp: offer.sdp })?;
    tracing::debug!(target: TARGET, "offer sent");
    Ok(())
}

/// Applies relayed signals until the data channel opens and the task is
/// aborted. Candidates arriving before the remote description are held.
async fn pump_signals(
    peer_connection: Arc<RTCPeerConnection>,
    relay: Arc<RelayClient>,
    role: Role,
    failure: mpsc::UnboundedSender<TransportError>,
) {
    let mut pending: Vec<RTCIceCandidateInit> = Vec::new();
    let mut remote_set = false;
    while let Some(signal) = relay.recv_signal().await {
        let step = match signal {
            PeerSignal::Offer { sdp } if role == Role::Answerer && !remote_set => {
                answer_offer(&peer_connection, &relay, sdp).await
            }
            PeerSignal::Answer { sdp } if role == Role::Offerer && !remote_set => {
                apply_answer(&peer_connection, sdp).await
            }
            PeerSignal::Offer { .. } | PeerSignal::Answer { .. } => {
                tracing::debug!(target: TARGET, ?role, "ignoring unexpected description");
                continue;
            }
            PeerSignal::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                let init = RTCIceCandidateInit {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                    username_fragment: None,
                };
                if remote_set {
                    add_candidate(&peer_connection, init).await;
                } else {
                    pending.push(init);
                }
                continue;
            }
        };
        if let Err(err) = step {
            let _ = failure.send(err);
            return;
        }
        remote_set = true;
        for init in pending.drain(..) {
            add_candidate(&peer_connection, init).await;
        }
    }
    // Once descriptions are exchanged the relay is no longer needed.
    if !remote_set {
        let _ = failure.send(TransportError::Signaling(
            "relay closed during negotiation".into(),
        ));
    }
}

async fn answer_offer(
    peer_connection: &RTCPeerConnection,
    relay: &RelayClient,
    sdp: String,
) -> Result<(), TransportError> {
    let offer = RTCSessionDescription::offer(sdp)
        .map_err(|err| TransportError::Negotiation(err.to_string()))?;
    peer_connection
        .set_remote_description(offer)
        .await
        .map_err(|err| TransportError::Negotiation(err.to_string()))?;
    let answer = peer_connection
        .create_answer(None)
        .await
        .map_err(|err| TransportError::Negotiation(err.to_string()))?;
    peer_connection
        .set_local_description(answer.clone())
        .await
        .map_err(|err| TransportError::Negotiation(err.to_string()))?;
    relay.send_signal(&PeerSignal::Answer { sdp: answer.sdp })?;
    tracing::debug!(target: TARGET, "answer sent");
    Ok(())
}

async fn apply_answer(peer_connection: &RTCPeerConnection, sdp: String) -> Result<(), TransportError> {
    let answer = RTCSessionDescription::answer(sdp)
        .map_err(|err| TransportError::Negotiation(err.to_string()))?;
    peer_connection
        .set_remote_description(answer)
        .await
        .map_err(|err| TransportError::Negotiation(err.to_string()))?;
    tracing::debug!(target: TARGET, "answer applied");
    Ok(())
}

async fn add_candidate(peer_connection: &RTCPeerConnection, init: RTCIceCandidateInit) {
    if let Err(err) = peer_connection.add_ice_candidate(init).await {
        tracing::debug!(target: TARGET, error = %err, "failed to add remote ice candidate");
    }
}

fn setup_data_channel(
    channel: Arc<RTCDataChannel>,
    inbound: InboundSender,
    open_tx: mpsc::UnboundedSender<Arc<RTCDataChannel>>,
) {
    let opened = channel.clone();
    channel.on_open(Box::new(move || {
        let _ = open_tx.send(opened.clone());
        Box::pin(async {})
    }));

    let inbound_for_close = inbound.clone();
    channel.on_close(Box::new(move || {
        let inbound = inbound_for_close.clone();
        Box::pin(async move {
            tracing::debug!(target: TARGET, "data channel closed");
            inbound.lock().take();
        })
    }));

    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let inbound = inbound.clone();
        Box::pin(async move {
            if let Some(tx) = inbound.lock().as_ref() {
                let _ = tx.send(message.data);
            }
        })
    }));
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransportError::Replication(format!(
                "frame of {} bytes exceeds the {MAX_FRAME_SIZE} byte limit",
                frame.len()
            )));
        }
        if self.inbound_tx.lock().is_none() {
            return Err(TransportError::Closed("data channel"));
        }
        self.channel.send(&frame).await.map(|_| ()).map_err(|err| {
            tracing::debug!(target: TARGET, error = %err, "data channel send failed");
            TransportError::Closed("data channel")
        })
    }

    async fn recv(&self) -> Option<Bytes> {
        self.inbound_rx.lock().await.recv().await
    }

    async fn close(&self) {
        self.inbound_tx.lock().take();
        if let Err(err) = self.channel.close().await {
            tracing::debug!(target: TARGET, error = %err, "data channel close failed");
        }
        if let Err(err) = self.peer_connection.close().await {
            tracing::debug!(target: TARGET, error = %err, "peer connection close failed");
        }
    }
}
