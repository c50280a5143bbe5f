//! Mirrors one collection to the remote peer over a [`PeerLink`].
//!
//! Both sides open with a full snapshot. After that every local change is
//! pushed as a single-document frame and every remote frame is applied as a
//! whole-document overwrite. There is no field-level merge. A side whose
//! change feed lagged resends everything as a stamped resync, and the peer
//! drops documents the resync no longer lists.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::identity::SessionId;
use crate::store::{Change, ChangeEvent, ChangeOrigin, Collection, Document, StoreError, now_millis};
use crate::transport::{PeerLink, TransportError};

const TARGET: &str = "pitchside::replication";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplicationFrame {
    Snapshot { documents: Vec<Document> },
    /// Full state after lost changes; `taken_at` is epoch millis.
    Resync { documents: Vec<Document>, taken_at: i64 },
    Upsert { document: Document },
    Remove { id: String },
}

impl ReplicationFrame {
    fn encode(&self) -> Result<Bytes, TransportError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|err| TransportError::Replication(err.to_string()))
    }

    fn decode(raw: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(raw).map_err(|err| TransportError::Replication(err.to_string()))
    }

    fn from_change(change: Change) -> Self {
        match change {
            Change::Upsert(document) => ReplicationFrame::Upsert { document },
            Change::Remove { id } => ReplicationFrame::Remove { id },
        }
    }
}

/// A running mirror. Dropping the handle stops it without closing the link
/// gracefully; prefer [`ReplicationHandle::cancel`].
pub struct ReplicationHandle {
    session_id: SessionId,
    link: Arc<dyn PeerLink>,
    active_tx: Arc<watch::Sender<bool>>,
    active_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ReplicationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationHandle")
            .field("session_id", &self.session_id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl ReplicationHandle {
    /// Exchange snapshots with the peer and start mirroring.
    ///
    /// Resolves once the peer's snapshot has been merged. Fails, and closes
    /// the link, if it ends or `sync_timeout` passes first.
    pub async fn start(
        session_id: SessionId,
        collection: Collection,
        link: Arc<dyn PeerLink>,
        sync_timeout: Duration,
    ) -> Result<Self, TransportError> {
        // Subscribe before reading the snapshot so no write falls in between.
        let events = collection.subscribe().await?;
        match tokio::time::timeout(sync_timeout, initial_sync(&collection, link.as_ref())).await {
            Ok(Ok(merged)) => {
                tracing::info!(target: TARGET, session = %session_id, merged, "initial sync complete");
            }
            Ok(Err(err)) => {
                link.close().await;
                return Err(err);
            }
            Err(_) => {
                link.close().await;
                return Err(TransportError::Timeout("waiting for initial sync"));
            }
        }

        let (active_tx, active_rx) = watch::channel(true);
        let active_tx = Arc::new(active_tx);

        let inbound = tokio::spawn(run_inbound(
            collection.clone(),
            link.clone(),
            active_tx.clone(),
        ));
        let outbound = tokio::spawn(run_outbound(
            collection,
            events,
            link.clone(),
            active_tx.clone(),
            active_rx.clone(),
        ));

        Ok(Self {
            session_id,
            link,
            active_tx,
            active_rx,
            tasks: Mutex::new(vec![inbound, outbound]),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// False once cancelled or once the link has closed.
    pub fn is_active(&self) -> bool {
        *self.active_rx.borrow()
    }

    /// Flips to `false` when the mirror stops.
    pub fn active_watch(&self) -> watch::Receiver<bool> {
        self.active_rx.clone()
    }

    /// Stop mirroring and close the link. Safe to call repeatedly.
    pub async fn cancel(&self) {
        let was_active = self.active_tx.send_replace(false);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        if was_active {
            tracing::info!(target: TARGET, session = %self.session_id, "replication cancelled");
        }
        self.link.close().await;
    }

    /// Resolves when the mirror stops for any reason.
    pub async fn closed(&self) {
        let mut active = self.active_rx.clone();
        let _ = active.wait_for(|active| !*active).await;
    }
}

impl Drop for ReplicationHandle {
    fn drop(&mut self) {
        self.active_tx.send_replace(false);
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn initial_sync(collection: &Collection, link: &dyn PeerLink) -> Result<usize, TransportError> {
    let documents = collection.all().await?;
    let count = documents.len();
    link.send(ReplicationFrame::Snapshot { documents }.encode()?)
        .await?;
    tracing::debug!(target: TARGET, collection = collection.name(), count, "snapshot sent");

    loop {
        let raw = link
            .recv()
            .await
            .ok_or(TransportError::Closed("link closed before initial sync"))?;
        match ReplicationFrame::decode(&raw)? {
            ReplicationFrame::Snapshot { documents } => {
                return Ok(collection.merge_snapshot(documents).await?);
            }
            other => {
                // Live frames can only precede the snapshot if the peer is
                // misbehaving; apply them anyway.
                apply_frame(collection, other).await?;
            }
        }
    }
}

async fn apply_frame(collection: &Collection, frame: ReplicationFrame) -> Result<(), StoreError> {
    match frame {
        ReplicationFrame::Snapshot { documents } => {
            collection.merge_snapshot(documents).await.map(|_| ())
        }
        ReplicationFrame::Resync { documents, taken_at } => collection
            .reconcile_snapshot(documents, taken_at)
            .await
            .map(|_| ()),
        ReplicationFrame::Upsert { document } => collection.apply_remote(document).await,
        ReplicationFrame::Remove { id } => collection.apply_remote_remove(&id).await,
    }
}

async fn run_inbound(
    collection: Collection,
    link: Arc<dyn PeerLink>,
    active: Arc<watch::Sender<bool>>,
) {
    while let Some(raw) = link.recv().await {
        let frame = match ReplicationFrame::decode(&raw) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(target: TARGET, error = %err, len = raw.len(), "dropping undecodable frame");
                continue;
            }
        };
        if let Err(err) = apply_frame(&collection, frame).await {
            tracing::warn!(target: TARGET, error = %err, "failed to apply remote change");
        }
    }
    tracing::info!(target: TARGET, collection = collection.name(), "peer link closed");
    active.send_replace(false);
}

async fn run_outbound(
    collection: Collection,
    mut events: broadcast::Receiver<ChangeEvent>,
    link: Arc<dyn PeerLink>,
    active_tx: Arc<watch::Sender<bool>>,
    mut active_rx: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = async {
                let _ = active_rx.wait_for(|active| !*active).await;
            } => break,
            event = events.recv() => match event {
                Ok(ChangeEvent { origin: ChangeOrigin::Remote, .. }) => continue,
                Ok(event) => ReplicationFrame::from_change(event.change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(target: TARGET, skipped, "change feed lagged; resending snapshot");
                    match collection.all().await {
                        Ok(documents) => ReplicationFrame::Resync {
                            documents,
                            taken_at: now_millis(),
                        },
                        Err(err) => {
                            tracing::warn!(target: TARGET, error = %err, "failed to read snapshot");
                            continue;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        let encoded = match frame.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::warn!(target: TARGET, error = %err, "failed to encode change");
                continue;
            }
        };
        match link.send(encoded).await {
            Ok(()) => {}
            Err(TransportError::Replication(reason)) => {
                tracing::warn!(target: TARGET, %reason, "change not mirrored");
            }
            Err(err) => {
                tracing::info!(target: TARGET, error = %err, "peer link unavailable");
                break;
            }
        }
    }
    active_tx.send_replace(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CollectionSchema, Store};
    use crate::transport::memory::MemoryLink;
    use serde_json::json;

    fn session() -> SessionId {
        "0b7e6f34-5a1c-4d2e-8f90-1a2b3c4d5e6f".parse().unwrap()
    }

    async fn collection() -> Collection {
        Store::in_memory()
            .collection(CollectionSchema::new("match_state").with_index("guild"))
            .await
            .unwrap()
    }

    async fn linked(left: &Collection, right: &Collection) -> (ReplicationHandle, ReplicationHandle) {
        let (a, b) = MemoryLink::pair();
        let timeout = Duration::from_secs(2);
        let (left, right) = tokio::join!(
            ReplicationHandle::start(session(), left.clone(), Arc::new(a), timeout),
            ReplicationHandle::start(session(), right.clone(), Arc::new(b), timeout),
        );
        (left.unwrap(), right.unwrap())
    }

    async fn next_remote(events: &mut broadcast::Receiver<ChangeEvent>) -> Change {
        loop {
            let event = events.recv().await.unwrap();
            if event.origin == ChangeOrigin::Remote {
                return event.change;
            }
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn initial_snapshots_are_exchanged() {
        let left = collection().await;
        let right = collection().await;
        left.upsert("p1", json!({"guild": "brewers"})).await.unwrap();
        right.upsert("p2", json!({"guild": "masons"})).await.unwrap();

        let (a, b) = linked(&left, &right).await;
        assert!(a.is_active() && b.is_active());
        assert_eq!(a.session_id(), session());

        assert!(left.find_one("p2").await.unwrap().is_some());
        assert!(right.find_one("p1").await.unwrap().is_some());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn live_writes_overwrite_whole_document() {
        let left = collection().await;
        let right = collection().await;
        let (_a, _b) = linked(&left, &right).await;
        let mut right_events = right.subscribe().await.unwrap();

        left.upsert("p1", json!({"guild": "butchers", "score": 2, "momentum": 1}))
            .await
            .unwrap();
        next_remote(&mut right_events).await;

        // The second write drops `momentum`; the peer must not keep it.
        left.upsert("p1", json!({"guild": "butchers", "score": 3})).await.unwrap();
        next_remote(&mut right_events).await;

        let doc = right.find_one("p1").await.unwrap().unwrap();
        assert_eq!(doc.field("score"), Some(&json!(3)));
        assert!(doc.field("momentum").is_none());
        assert_eq!(doc, left.find_one("p1").await.unwrap().unwrap());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn removals_are_mirrored_and_not_echoed() {
        let left = collection().await;
        let right = collection().await;
        left.upsert("p1", json!({"guild": "fishermen"})).await.unwrap();
        let (_a, _b) = linked(&left, &right).await;

        let mut left_events = left.subscribe().await.unwrap();
        let mut right_events = right.subscribe().await.unwrap();
        left.remove("p1").await.unwrap();
        assert_eq!(
            next_remote(&mut right_events).await,
            Change::Remove { id: "p1".into() }
        );
        assert!(right.find_one("p1").await.unwrap().is_none());

        // A later local write on the right is the next thing the left sees.
        right.upsert("p9", json!({"guild": "alchemists"})).await.unwrap();
        let change = next_remote(&mut left_events).await;
        assert_eq!(change.id(), "p9");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn removals_lost_to_a_lagging_feed_still_reach_the_peer() {
        let left = collection().await;
        let right = collection().await;
        let docs: Vec<Document> = (0..300)
            .map(|i| Document::from_value(format!("p{i}"), &json!({"score": i})).unwrap())
            .collect();
        let ids: Vec<String> = docs.iter().map(|doc| doc.id.clone()).collect();
        // Identical on both sides, so the opening exchange changes nothing.
        left.merge_snapshot(docs.clone()).await.unwrap();
        right.merge_snapshot(docs).await.unwrap();
        let (_a, _b) = linked(&left, &right).await;
        assert_eq!(right.all().await.unwrap().len(), 300);

        // One write emits more events than the feed holds.
        let mut right_events = right.subscribe().await.unwrap();
        left.bulk_remove(&ids).await.unwrap();
        while !right.all().await.unwrap().is_empty() {
            match right_events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(err) => panic!("feed closed: {err}"),
            }
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn cancel_is_idempotent_and_ends_the_peer() {
        let left = collection().await;
        let right = collection().await;
        let (a, b) = linked(&left, &right).await;

        a.cancel().await;
        a.cancel().await;
        assert!(!a.is_active());
        b.closed().await;
        assert!(!b.is_active());

        // Writes after cancel stay local.
        left.upsert("late", json!({"guild": "engineers"})).await.unwrap();
        tokio::task::yield_now().await;
        assert!(right.find_one("late").await.unwrap().is_none());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn missing_peer_snapshot_times_out() {
        let (a, _b) = MemoryLink::pair();
        let err = ReplicationHandle::start(
            session(),
            collection().await,
            Arc::new(a),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn link_closing_before_sync_is_an_error() {
        let (a, b) = MemoryLink::pair();
        b.close().await;
        let err = ReplicationHandle::start(
            session(),
            collection().await,
            Arc::new(a),
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransportError::Closed(_)));
    }
}
