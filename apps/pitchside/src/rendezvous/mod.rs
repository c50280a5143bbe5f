//! Pairing two clients through the signaling server's handshake endpoint.
//!
//! A host asks for a [`PairingCode`], shows it to the user and waits for the
//! server to report a joiner. A joiner presents the code. Either way the
//! attempt ends with a [`Pairing`] holding both participant ids, or an error,
//! after which the caller must run [`Handshake::cleanup`].

use async_trait::async_trait;
use thiserror::Error;

use crate::identity::{Pairing, PairingCode};

mod client;
pub mod protocol;

pub use client::{RendezvousClient, RendezvousConnector, RendezvousTimeouts};

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("signaling connect failed: {0}")]
    Connect(String),
    #[error("signaling connection closed before a response arrived")]
    Closed,
    #[error("signaling socket error: {0}")]
    Socket(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("invalid pairing code {0}")]
    InvalidCode(u32),
    #[error("invalid {field} received from signaling server: {value:?}")]
    InvalidIdentifier { field: &'static str, value: String },
    #[error("signaling server rejected the handshake: {0}")]
    Rejected(String),
    #[error("no open signaling connection")]
    NotConnected,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// One rendezvous attempt. Implementations hold at most one signaling
/// connection; `&mut self` keeps a second wait from racing the first.
#[async_trait]
pub trait Handshake: Send {
    /// Open a connection, send `handshake-begin`, resolve with the code.
    async fn begin_host(&mut self) -> Result<PairingCode, RendezvousError>;

    /// Wait on the open host connection for `handshake-complete`.
    async fn await_peer(&mut self) -> Result<Pairing, RendezvousError>;

    /// Open a connection and present `code`. Zero fails before connecting.
    async fn join_with_code(&mut self, code: u32) -> Result<Pairing, RendezvousError>;

    /// Close and forget any open connection. Safe to call repeatedly.
    async fn cleanup(&mut self);
}

/// Hands out a fresh [`Handshake`] per attempt.
pub trait HandshakeFactory: Send + Sync {
    fn handshake(&self) -> Box<dyn Handshake>;
}
