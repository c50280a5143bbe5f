use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{CollectionStateRef, Document, Query, Store, StoreError, merge_object};

/// Where a write came from. Remote writes are applied by replication and
/// must not be mirrored back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Upsert(Document),
    Remove { id: String },
}

impl Change {
    pub fn id(&self) -> &str {
        match self {
            Change::Upsert(doc) => &doc.id,
            Change::Remove { id } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub collection: String,
    pub origin: ChangeOrigin,
    pub change: Change,
}

/// Handle to one declared collection.
#[derive(Clone)]
pub struct Collection {
    store: Store,
    name: Arc<str>,
}

impl Collection {
    pub(super) fn new(store: Store, name: String) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fails with [`StoreError::Conflict`] if the id is taken.
    pub async fn insert(&self, mut doc: Document) -> Result<Document, StoreError> {
        self.store
            .mutate(&self.name, ChangeOrigin::Local, |view| {
                if view.get(&doc.id).is_some() {
                    return Err(StoreError::Conflict(doc.id.clone()));
                }
                doc.stamp_after(None);
                view.put(doc.clone());
                Ok((doc.clone(), vec![Change::Upsert(doc)]))
            })
            .await
    }

    /// Replace the whole document body.
    pub async fn upsert(&self, id: &str, data: Value) -> Result<Document, StoreError> {
        let Value::Object(data) = data else {
            return Err(StoreError::InvalidDocument(id.to_string()));
        };
        let mut doc = Document::new(id, data);
        self.store
            .mutate(&self.name, ChangeOrigin::Local, |view| {
                doc.stamp_after(view.get(id));
                view.put(doc.clone());
                Ok((doc.clone(), vec![Change::Upsert(doc)]))
            })
            .await
    }

    pub async fn upsert_value<T: Serialize>(&self, id: &str, value: &T) -> Result<Document, StoreError> {
        self.upsert(id, serde_json::to_value(value)?).await
    }

    /// Merge top-level keys of `patch` into an existing document.
    pub async fn patch(&self, id: &str, patch: Value) -> Result<Document, StoreError> {
        let Value::Object(patch) = patch else {
            return Err(StoreError::InvalidDocument(id.to_string()));
        };
        self.store
            .mutate(&self.name, ChangeOrigin::Local, |view| {
                let previous = view
                    .get(id)
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
                let mut doc = previous.clone();
                merge_object(&mut doc.data, patch);
                doc.stamp_after(Some(&previous));
                view.put(doc.clone());
                Ok((doc.clone(), vec![Change::Upsert(doc)]))
            })
            .await
    }

    /// Typed read-modify-write of an existing document under one store lock.
    pub async fn update_value<T, F>(&self, id: &str, change: F) -> Result<T, StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> Result<(), StoreError>,
    {
        self.store
            .mutate(&self.name, ChangeOrigin::Local, |view| {
                let previous = view
                    .get(id)
                    .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
                let mut value: T = previous.decode()?;
                change(&mut value)?;
                let mut doc = Document::from_value(id, &value)?;
                doc.stamp_after(Some(previous));
                view.put(doc.clone());
                Ok((value, vec![Change::Upsert(doc)]))
            })
            .await
    }

    pub async fn find_one(&self, id: &str) -> Result<Option<Document>, StoreError> {
        self.store
            .read(&self.name, |view| Ok(view.get(id).cloned()))
            .await
    }

    /// Matching documents ordered by id.
    pub async fn find(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        self.store.read(&self.name, |view| view.find(query)).await
    }

    pub async fn all(&self) -> Result<Vec<Document>, StoreError> {
        self.find(&Query::all()).await
    }

    /// All-or-nothing: a single existing id rejects the whole batch.
    pub async fn bulk_insert(&self, docs: Vec<Document>) -> Result<usize, StoreError> {
        self.store
            .mutate(&self.name, ChangeOrigin::Local, |view| {
                {
                    let mut seen = std::collections::HashSet::new();
                    for doc in &docs {
                        if view.get(&doc.id).is_some() || !seen.insert(doc.id.as_str()) {
                            return Err(StoreError::Conflict(doc.id.clone()));
                        }
                    }
                }
                let mut changes = Vec::with_capacity(docs.len());
                for mut doc in docs {
                    doc.stamp_after(None);
                    view.put(doc.clone());
                    changes.push(Change::Upsert(doc));
                }
                Ok((changes.len(), changes))
            })
            .await
    }

    /// Ids that do not exist are skipped. Returns how many were removed.
    pub async fn bulk_remove(&self, ids: &[String]) -> Result<usize, StoreError> {
        self.store
            .mutate(&self.name, ChangeOrigin::Local, |view| {
                let changes: Vec<Change> = ids
                    .iter()
                    .filter_map(|id| view.take(id))
                    .map(|doc| Change::Remove { id: doc.id })
                    .collect();
                Ok((changes.len(), changes))
            })
            .await
    }

    pub async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self.bulk_remove(&[id.to_string()]).await?;
        Ok(removed > 0)
    }

    /// Remove every document. Returns how many were removed.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        self.store
            .mutate(&self.name, ChangeOrigin::Local, |view| {
                let changes: Vec<Change> = view
                    .drain()
                    .into_iter()
                    .map(|doc| Change::Remove { id: doc.id })
                    .collect();
                Ok((changes.len(), changes))
            })
            .await
    }

    pub async fn subscribe(&self) -> Result<broadcast::Receiver<ChangeEvent>, StoreError> {
        self.store.events(&self.name).await
    }

    /// Follow a single document: yields its value after each change
    /// (`None` once removed).
    pub async fn watch(&self, id: &str) -> Result<DocumentWatch, StoreError> {
        Ok(DocumentWatch {
            id: id.to_string(),
            events: self.subscribe().await?,
        })
    }

    /// Apply a peer's write as-is: the incoming document wins regardless of
    /// timestamps.
    pub(crate) async fn apply_remote(&self, doc: Document) -> Result<(), StoreError> {
        self.store
            .mutate(&self.name, ChangeOrigin::Remote, |view| {
                view.put(doc.clone());
                Ok(((), vec![Change::Upsert(doc)]))
            })
            .await
    }

    pub(crate) async fn apply_remote_remove(&self, id: &str) -> Result<(), StoreError> {
        self.store
            .mutate(&self.name, ChangeOrigin::Remote, |view| {
                let changes = view
                    .take(id)
                    .map(|doc| vec![Change::Remove { id: doc.id }])
                    .unwrap_or_default();
                Ok(((), changes))
            })
            .await
    }

    /// Merge a peer snapshot: each incoming document replaces ours unless
    /// ours is strictly newer. Returns how many were applied.
    pub(crate) async fn merge_snapshot(&self, docs: Vec<Document>) -> Result<usize, StoreError> {
        self.store
            .mutate(&self.name, ChangeOrigin::Remote, |view| {
                let changes = merge_documents(view, docs);
                Ok((changes.len(), changes))
            })
            .await
    }

    /// Merge a full peer snapshot taken at `taken_at` (epoch millis) and
    /// drop local documents it no longer lists, unless they were written
    /// after it was taken. Returns how many documents changed.
    pub(crate) async fn reconcile_snapshot(
        &self,
        docs: Vec<Document>,
        taken_at: i64,
    ) -> Result<usize, StoreError> {
        self.store
            .mutate(&self.name, ChangeOrigin::Remote, |view| {
                let listed: HashSet<String> = docs.iter().map(|doc| doc.id.clone()).collect();
                let mut changes = merge_documents(view, docs);
                let missing: Vec<String> = view
                    .all()
                    .into_iter()
                    .filter(|doc| !listed.contains(&doc.id) && doc.updated_at <= taken_at)
                    .map(|doc| doc.id)
                    .collect();
                for id in missing {
                    if view.take(&id).is_some() {
                        changes.push(Change::Remove { id });
                    }
                }
                Ok((changes.len(), changes))
            })
            .await
    }
}

/// Last-writer-wins merge: an incoming document replaces ours unless ours is
/// strictly newer.
fn merge_documents(view: &mut CollectionStateRef<'_>, docs: Vec<Document>) -> Vec<Change> {
    let mut changes = Vec::new();
    for doc in docs {
        let newer_locally = view
            .get(&doc.id)
            .is_some_and(|local| local.updated_at > doc.updated_at);
        if newer_locally || view.get(&doc.id) == Some(&doc) {
            continue;
        }
        view.put(doc.clone());
        changes.push(Change::Upsert(doc));
    }
    changes
}

pub struct DocumentWatch {
    id: String,
    events: broadcast::Receiver<ChangeEvent>,
}

impl DocumentWatch {
    /// `None` when the store has been dropped.
    pub async fn next(&mut self) -> Option<Option<Document>> {
        loop {
            match self.events.recv().await {
                Ok(event) if event.change.id() == self.id => {
                    return Some(match event.change {
                        Change::Upsert(doc) => Some(doc),
                        Change::Remove { .. } => None,
                    });
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(target: "pitchside::store", id = %self.id, skipped, "document watch lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
