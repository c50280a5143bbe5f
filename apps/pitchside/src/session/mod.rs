//! Owner of the single active network session.
//!
//! Every lifecycle operation takes an exclusive guard for its whole run; a
//! second operation started meanwhile fails with [`SessionError::Busy`]
//! instead of queueing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, watch};

use crate::identity::{NetworkLocalState, Pairing, PairingCode, SessionId};
use crate::match_state::MatchState;
use crate::rendezvous::{Handshake, HandshakeFactory, RendezvousError};
use crate::replication::ReplicationHandle;
use crate::store::{Store, StoreError};
use crate::transport::{Establisher, TransportError};

const TARGET: &str = "pitchside::session";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("another session operation is already running")]
    Busy,
    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Hosting { code: PairingCode },
    Joining,
    Connecting,
    Connected { session_id: SessionId },
}

/// Released on drop so an error or a cancelled future never leaves the
/// controller stuck busy.
struct LifecycleGuard<'a> {
    busy: &'a AtomicBool,
}

impl Drop for LifecycleGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

pub struct SessionController {
    store: Store,
    match_state: MatchState,
    handshakes: Arc<dyn HandshakeFactory>,
    establisher: Arc<dyn Establisher>,
    busy: AtomicBool,
    handle: AsyncMutex<Option<ReplicationHandle>>,
    status: Arc<watch::Sender<SessionStatus>>,
}

impl SessionController {
    pub async fn new(
        store: Store,
        handshakes: Arc<dyn HandshakeFactory>,
        establisher: Arc<dyn Establisher>,
    ) -> Result<Self, StoreError> {
        let match_state = MatchState::open(&store).await?;
        let (status, _) = watch::channel(SessionStatus::Disconnected);
        Ok(Self {
            store,
            match_state,
            handshakes,
            establisher,
            busy: AtomicBool::new(false),
            handle: AsyncMutex::new(None),
            status: Arc::new(status),
        })
    }

    pub fn match_state(&self) -> &MatchState {
        &self.match_state
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// The persisted pairing of the current or most recent session.
    pub async fn saved_session(&self) -> Result<Option<NetworkLocalState>, StoreError> {
        self.store.get_local(NetworkLocalState::DOCUMENT_ID).await
    }

    pub async fn is_connected(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(ReplicationHandle::is_active)
    }

    /// Host a new session: obtain a code, wait for a joiner, then connect.
    ///
    /// The code is published through [`SessionController::status`] as
    /// [`SessionStatus::Hosting`] while waiting.
    pub async fn start_host(&self) -> Result<SessionId, SessionError> {
        let _guard = self.begin()?;
        let mut handshake = self.handshakes.handshake();
        let pairing = host_pairing(handshake.as_mut(), &self.status).await;
        handshake.cleanup().await;
        let result = match pairing {
            Ok(pairing) => self.connect_fresh(&pairing).await,
            Err(err) => Err(err.into()),
        };
        self.settle(result)
    }

    pub async fn join_session(&self, code: u32) -> Result<SessionId, SessionError> {
        let _guard = self.begin()?;
        self.status.send_replace(SessionStatus::Joining);
        let mut handshake = self.handshakes.handshake();
        let pairing = handshake.join_with_code(code).await;
        handshake.cleanup().await;
        let result = match pairing {
            Ok(pairing) => self.connect_fresh(&pairing).await,
            Err(err) => Err(err.into()),
        };
        self.settle(result)
    }

    /// Re-establish the saved session if nothing is running.
    ///
    /// Returns whether a transport was established. A handle whose link
    /// has dropped does not count as running.
    pub async fn reconnect(&self) -> Result<bool, SessionError> {
        let _guard = self.begin()?;
        let mut slot = self.handle.lock().await;
        if slot.as_ref().is_some_and(ReplicationHandle::is_active) {
            tracing::debug!(target: TARGET, "session already active; reconnect skipped");
            return Ok(false);
        }
        let Some(keys) = self.saved_session().await? else {
            tracing::debug!(target: TARGET, "no saved session; reconnect skipped");
            return Ok(false);
        };
        if let Some(stale) = slot.take() {
            stale.cancel().await;
        }

        self.status.send_replace(SessionStatus::Connecting);
        tracing::info!(target: TARGET, session = %keys.gid, "reconnecting saved session");
        match self.establish_saved(&keys).await {
            Ok(handle) => {
                self.watch_handle(&handle);
                *slot = Some(handle);
                self.status
                    .send_replace(SessionStatus::Connected { session_id: keys.gid });
                Ok(true)
            }
            Err(err) => {
                self.status.send_replace(SessionStatus::Disconnected);
                Err(err)
            }
        }
    }

    /// Tear everything down. Each step runs even if an earlier one failed;
    /// failures are logged, not returned.
    pub async fn leave(&self) -> Result<(), SessionError> {
        let _guard = self.begin()?;
        // Cancel first so clearing the collection is not mirrored.
        if let Some(handle) = self.handle.lock().await.take() {
            handle.cancel().await;
        }
        if let Err(err) = self.match_state.collection().clear().await {
            tracing::warn!(target: TARGET, error = %err, "failed to clear match state");
        }
        match self.store.remove_local(NetworkLocalState::DOCUMENT_ID).await {
            Ok(removed) => {
                tracing::debug!(target: TARGET, removed, "network state cleared");
            }
            Err(err) => {
                tracing::warn!(target: TARGET, error = %err, "failed to remove network state");
            }
        }
        self.status.send_replace(SessionStatus::Disconnected);
        tracing::info!(target: TARGET, "left network session");
        Ok(())
    }

    async fn establish_saved(&self, keys: &NetworkLocalState) -> Result<ReplicationHandle, SessionError> {
        let handle = self
            .establisher
            .establish(keys, self.match_state.collection().clone())
            .await?;
        if let Err(err) = self.match_state.claim_side(keys.uid).await {
            handle.cancel().await;
            return Err(err.into());
        }
        Ok(handle)
    }

    fn begin(&self) -> Result<LifecycleGuard<'_>, SessionError> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SessionError::Busy)?;
        Ok(LifecycleGuard { busy: &self.busy })
    }

    fn settle(&self, result: Result<SessionId, SessionError>) -> Result<SessionId, SessionError> {
        if let Err(err) = &result {
            tracing::warn!(target: TARGET, error = %err, "session start failed");
            self.status.send_replace(SessionStatus::Disconnected);
        }
        result
    }

    /// Clear, establish, then persist. Nothing is persisted unless the
    /// transport came up.
    async fn connect_fresh(&self, pairing: &Pairing) -> Result<SessionId, SessionError> {
        let keys = NetworkLocalState::from_pairing(pairing);
        self.status.send_replace(SessionStatus::Connecting);
        tracing::info!(
            target: TARGET,
            uid = %keys.uid,
            oid = %keys.oid,
            session = %keys.gid,
            "paired; connecting"
        );

        let mut slot = self.handle.lock().await;
        if let Some(previous) = slot.take() {
            previous.cancel().await;
        }
        self.match_state.collection().clear().await?;

        let handle = self
            .establisher
            .establish(&keys, self.match_state.collection().clone())
            .await?;
        let finish = async {
            self.match_state.claim_side(keys.uid).await?;
            self.store
                .upsert_local(NetworkLocalState::DOCUMENT_ID, &keys)
                .await
        };
        if let Err(err) = finish.await {
            handle.cancel().await;
            return Err(err.into());
        }

        self.watch_handle(&handle);
        *slot = Some(handle);
        self.status
            .send_replace(SessionStatus::Connected { session_id: keys.gid });
        Ok(keys.gid)
    }

    /// Drop back to `Disconnected` when the link goes away on its own.
    fn watch_handle(&self, handle: &ReplicationHandle) {
        let session_id = handle.session_id();
        let mut active = handle.active_watch();
        let status = self.status.clone();
        tokio::spawn(async move {
            let _ = active.wait_for(|active| !*active).await;
            status.send_if_modified(|current| {
                if *current == (SessionStatus::Connected { session_id }) {
                    tracing::info!(target: TARGET, session = %session_id, "peer link lost");
                    *current = SessionStatus::Disconnected;
                    true
                } else {
                    false
                }
            });
        });
    }
}

async fn host_pairing(
    handshake: &mut dyn Handshake,
    status: &watch::Sender<SessionStatus>,
) -> Result<Pairing, RendezvousError> {
    let code = handshake.begin_host().await?;
    tracing::info!(target: TARGET, %code, "hosting; waiting for peer");
    status.send_replace(SessionStatus::Hosting { code });
    handshake.await_peer().await
}
