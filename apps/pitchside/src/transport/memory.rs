//! In-process links for tests and single-machine demos.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use super::{Establisher, PeerLink, TransportError};
use crate::identity::{NetworkLocalState, SessionId};
use crate::replication::ReplicationHandle;
use crate::store::Collection;

pub struct MemoryLink {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl MemoryLink {
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Mutex::new(Some(a_tx)),
                rx: AsyncMutex::new(b_rx),
            },
            Self {
                tx: Mutex::new(Some(b_tx)),
                rx: AsyncMutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(TransportError::Closed("memory link"))?;
        tx.send(frame).map_err(|_| TransportError::Closed("memory link"))
    }

    async fn recv(&self) -> Option<Bytes> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) {
        // Dropping our sender ends the peer's receive loop.
        self.tx.lock().take();
        self.rx.lock().await.close();
    }
}

/// Pairs whichever two callers establish the same session id.
pub struct MemoryEstablisher {
    waiting: Mutex<HashMap<SessionId, MemoryLink>>,
    sync_timeout: Duration,
}

impl MemoryEstablisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            waiting: Mutex::new(HashMap::new()),
            sync_timeout: Duration::from_secs(5),
        })
    }

    pub fn with_sync_timeout(sync_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            waiting: Mutex::new(HashMap::new()),
            sync_timeout,
        })
    }

    fn link_for(&self, session: SessionId) -> MemoryLink {
        let mut waiting = self.waiting.lock();
        if let Some(link) = waiting.remove(&session) {
            return link;
        }
        let (ours, theirs) = MemoryLink::pair();
        waiting.insert(session, theirs);
        ours
    }
}

#[async_trait]
impl Establisher for MemoryEstablisher {
    async fn establish(
        &self,
        keys: &NetworkLocalState,
        collection: Collection,
    ) -> Result<ReplicationHandle, TransportError> {
        let link = Arc::new(self.link_for(keys.gid));
        ReplicationHandle::start(keys.gid, collection, link, self.sync_timeout).await
    }
}
