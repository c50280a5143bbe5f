//! Peer transport: the relay side channel, the WebRTC data channel and the
//! [`Establisher`] seam that turns a session id into a live replication.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::identity::{NetworkLocalState, ParticipantId};
use crate::replication::ReplicationHandle;
use crate::store::{Collection, StoreError};

pub mod config;
mod establish;
pub mod memory;
pub mod relay;
pub mod webrtc;

pub use config::WebRtcConfig;
pub use establish::WebRtcEstablisher;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("signaling relay error: {0}")]
    Signaling(String),
    #[error("webrtc negotiation failed: {0}")]
    Negotiation(String),
    #[error("transport closed: {0}")]
    Closed(&'static str),
    #[error("timed out {0}")]
    Timeout(&'static str),
    #[error("replication error: {0}")]
    Replication(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Which side drives offer/answer. Both peers compute the same split
/// without talking to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

impl Role {
    /// The lexicographically smaller participant id offers. A pairing with
    /// itself has no answerer and is refused.
    pub fn for_pair(self_id: &ParticipantId, other_id: &ParticipantId) -> Result<Self, TransportError> {
        match self_id.as_bytes().cmp(other_id.as_bytes()) {
            std::cmp::Ordering::Less => Ok(Role::Offerer),
            std::cmp::Ordering::Greater => Ok(Role::Answerer),
            std::cmp::Ordering::Equal => Err(TransportError::Setup(format!(
                "participant {self_id} is paired with itself"
            ))),
        }
    }
}

/// Ordered, reliable, message-oriented link to the one remote peer.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// `None` once the link has closed.
    async fn recv(&self) -> Option<Bytes>;

    async fn close(&self);
}

/// Builds a running replication of `collection` for a pairing.
#[async_trait]
pub trait Establisher: Send + Sync {
    async fn establish(
        &self,
        keys: &NetworkLocalState,
        collection: Collection,
    ) -> Result<ReplicationHandle, TransportError>;
}
