//! Local document store.
//!
//! Collections hold JSON [`Document`]s with secondary indexes and change
//! broadcasts. Local documents are a separate keyspace for per-device
//! bookkeeping; they never belong to a collection and so are never mirrored.
//! A store opened on a directory rewrites `store.json` after every mutation.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};

mod collection;
mod document;
mod query;

pub use collection::{Change, ChangeEvent, ChangeOrigin, Collection, DocumentWatch};
pub use document::Document;
pub(crate) use document::now_millis;
pub use query::Query;

use query::SecondaryIndex;

const STORE_FILE: &str = "store.json";
const EVENT_CAPACITY: usize = 256;
const TARGET: &str = "pitchside::store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("document {0} already exists")]
    Conflict(String),
    #[error("document {0} not found")]
    NotFound(String),
    #[error("field {0} is not indexed")]
    NotIndexed(String),
    #[error("collection {0} has not been declared")]
    UnknownCollection(String),
    #[error("document {0} must be a JSON object")]
    InvalidDocument(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSchema {
    pub name: String,
    pub indexes: Vec<String>,
}

impl CollectionSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, field: impl Into<String>) -> Self {
        self.indexes.push(field.into());
        self
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedStore {
    #[serde(default)]
    collections: BTreeMap<String, Vec<Document>>,
    #[serde(default)]
    locals: BTreeMap<String, Value>,
}

struct CollectionState {
    documents: BTreeMap<String, Document>,
    index: SecondaryIndex,
    events: broadcast::Sender<ChangeEvent>,
}

impl CollectionState {
    fn new(schema: &CollectionSchema, documents: Vec<Document>) -> Self {
        let mut index = SecondaryIndex::new(&schema.indexes);
        let documents = documents
            .into_iter()
            .map(|doc| {
                index.insert(&doc);
                (doc.id.clone(), doc)
            })
            .collect();
        Self {
            documents,
            index,
            events: broadcast::channel(EVENT_CAPACITY).0,
        }
    }

    fn put(&mut self, doc: Document) -> Option<Document> {
        let previous = self.documents.insert(doc.id.clone(), doc.clone());
        if let Some(prev) = &previous {
            self.index.remove(prev);
        }
        self.index.insert(&doc);
        previous
    }

    fn take(&mut self, id: &str) -> Option<Document> {
        let removed = self.documents.remove(id)?;
        self.index.remove(&removed);
        Some(removed)
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            documents: self.documents.clone(),
            index: self.index.clone(),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.documents = checkpoint.documents;
        self.index = checkpoint.index;
    }
}

/// Collection contents as they were before a mutation.
struct Checkpoint {
    documents: BTreeMap<String, Document>,
    index: SecondaryIndex,
}

#[derive(Default)]
struct StoreState {
    collections: HashMap<String, CollectionState>,
    /// Documents loaded from disk for collections not yet declared.
    undeclared: BTreeMap<String, Vec<Document>>,
    locals: BTreeMap<String, Value>,
}

impl StoreState {
    fn persisted(&self) -> PersistedStore {
        let mut collections = self.undeclared.clone();
        for (name, state) in &self.collections {
            collections.insert(name.clone(), state.documents.values().cloned().collect());
        }
        PersistedStore {
            collections,
            locals: self.locals.clone(),
        }
    }
}

struct StoreInner {
    file: Option<PathBuf>,
    state: Mutex<StoreState>,
}

/// Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn in_memory() -> Self {
        Self::with_state(None, StoreState::default())
    }

    /// Open (or create) a durable store under `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let file = dir.join(STORE_FILE);
        let persisted = match tokio::fs::read(&file).await {
            Ok(raw) => serde_json::from_slice::<PersistedStore>(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => PersistedStore::default(),
            Err(err) => return Err(err.into()),
        };
        tracing::debug!(
            target: TARGET,
            path = %file.display(),
            collections = persisted.collections.len(),
            locals = persisted.locals.len(),
            "store opened"
        );
        let state = StoreState {
            collections: HashMap::new(),
            undeclared: persisted.collections,
            locals: persisted.locals,
        };
        Ok(Self::with_state(Some(file), state))
    }

    fn with_state(file: Option<PathBuf>, state: StoreState) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                file,
                state: Mutex::new(state),
            }),
        }
    }

    /// Declare a collection, adopting any documents already on disk.
    pub async fn collection(&self, schema: CollectionSchema) -> Result<Collection, StoreError> {
        let mut state = self.inner.state.lock().await;
        if !state.collections.contains_key(&schema.name) {
            let documents = state.undeclared.remove(&schema.name).unwrap_or_default();
            state
                .collections
                .insert(schema.name.clone(), CollectionState::new(&schema, documents));
        }
        Ok(Collection::new(self.clone(), schema.name))
    }

    pub async fn insert_local<T: Serialize>(&self, id: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value)?;
        let mut state = self.inner.state.lock().await;
        if state.locals.contains_key(id) {
            return Err(StoreError::Conflict(id.to_string()));
        }
        let previous = state.locals.insert(id.to_string(), value);
        self.persist_local(&mut state, id, previous).await
    }

    pub async fn upsert_local<T: Serialize>(&self, id: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value)?;
        let mut state = self.inner.state.lock().await;
        let previous = state.locals.insert(id.to_string(), value);
        self.persist_local(&mut state, id, previous).await
    }

    pub async fn get_local<T: DeserializeOwned>(&self, id: &str) -> Result<Option<T>, StoreError> {
        let state = self.inner.state.lock().await;
        state
            .locals
            .get(id)
            .map(|value| serde_json::from_value(value.clone()).map_err(StoreError::from))
            .transpose()
    }

    /// Returns whether a document was removed.
    pub async fn remove_local(&self, id: &str) -> Result<bool, StoreError> {
        let mut state = self.inner.state.lock().await;
        let Some(previous) = state.locals.remove(id) else {
            return Ok(false);
        };
        self.persist_local(&mut state, id, Some(previous)).await?;
        Ok(true)
    }

    /// Persist a local-document change, putting `previous` back if the
    /// write fails.
    async fn persist_local(
        &self,
        state: &mut StoreState,
        id: &str,
        previous: Option<Value>,
    ) -> Result<(), StoreError> {
        let Err(err) = self.persist(state).await else {
            return Ok(());
        };
        match previous {
            Some(value) => state.locals.insert(id.to_string(), value),
            None => state.locals.remove(id),
        };
        Err(err)
    }

    /// Run `apply` against one collection under the store lock, then persist
    /// and broadcast whatever changes it reports. If `apply` or the write
    /// fails the collection is restored and nothing is broadcast.
    pub(crate) async fn mutate<R>(
        &self,
        name: &str,
        origin: ChangeOrigin,
        apply: impl FnOnce(&mut CollectionStateRef<'_>) -> Result<(R, Vec<Change>), StoreError>,
    ) -> Result<R, StoreError> {
        let mut state = self.inner.state.lock().await;
        let collection = state
            .collections
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))?;
        let checkpoint = collection.checkpoint();
        let (result, changes) = match apply(&mut CollectionStateRef { state: collection }) {
            Ok(applied) => applied,
            Err(err) => {
                collection.restore(checkpoint);
                return Err(err);
            }
        };
        if changes.is_empty() {
            return Ok(result);
        }
        let events = collection.events.clone();
        if let Err(err) = self.persist(&state).await {
            tracing::warn!(target: TARGET, collection = name, error = %err, "store write failed; change rolled back");
            if let Some(collection) = state.collections.get_mut(name) {
                collection.restore(checkpoint);
            }
            return Err(err);
        }
        for change in changes {
            let _ = events.send(ChangeEvent {
                collection: name.to_string(),
                origin,
                change,
            });
        }
        Ok(result)
    }

    pub(crate) async fn read<R>(
        &self,
        name: &str,
        read: impl FnOnce(&CollectionStateRef<'_>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut state = self.inner.state.lock().await;
        let collection = state
            .collections
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))?;
        read(&CollectionStateRef { state: collection })
    }

    pub(crate) async fn events(&self, name: &str) -> Result<broadcast::Receiver<ChangeEvent>, StoreError> {
        let state = self.inner.state.lock().await;
        state
            .collections
            .get(name)
            .map(|collection| collection.events.subscribe())
            .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))
    }

    async fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let Some(file) = &self.inner.file else {
            return Ok(());
        };
        let raw = serde_json::to_vec_pretty(&state.persisted())?;
        let staging = file.with_extension("json.tmp");
        tokio::fs::write(&staging, raw).await?;
        tokio::fs::rename(&staging, file).await?;
        Ok(())
    }
}

/// Borrowed view of one collection handed to [`Store::mutate`] closures.
pub(crate) struct CollectionStateRef<'a> {
    state: &'a mut CollectionState,
}

impl CollectionStateRef<'_> {
    pub(crate) fn get(&self, id: &str) -> Option<&Document> {
        self.state.documents.get(id)
    }

    pub(crate) fn put(&mut self, doc: Document) -> Option<Document> {
        self.state.put(doc)
    }

    pub(crate) fn take(&mut self, id: &str) -> Option<Document> {
        self.state.take(id)
    }

    pub(crate) fn drain(&mut self) -> Vec<Document> {
        self.state.index.clear();
        std::mem::take(&mut self.state.documents).into_values().collect()
    }

    pub(crate) fn all(&self) -> Vec<Document> {
        self.state.documents.values().cloned().collect()
    }

    pub(crate) fn find(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let Some(ids) = self.state.index.resolve(query)? else {
            return Ok(self.all());
        };
        Ok(ids
            .iter()
            .filter_map(|id| self.state.documents.get(id))
            .cloned()
            .collect())
    }
}

/// Shallow merge of `patch` into `target`: top-level keys replace.
pub(crate) fn merge_object(target: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        target.insert(key, value);
    }
}
