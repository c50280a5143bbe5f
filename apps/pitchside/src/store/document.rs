use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use super::StoreError;

/// A JSON object stored under a primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub data: Map<String, Value>,
    /// Milliseconds since the Unix epoch of the last write on any replica.
    pub updated_at: i64,
}

impl Document {
    pub fn new(id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            data,
            updated_at: now_millis(),
        }
    }

    pub fn from_value<T: Serialize>(id: impl Into<String>, value: &T) -> Result<Self, StoreError> {
        let id = id.into();
        match serde_json::to_value(value)? {
            Value::Object(data) => Ok(Self::new(id, data)),
            _ => Err(StoreError::InvalidDocument(id)),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(Value::Object(self.data.clone()))?)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// Stamp a write that supersedes `previous`; stays monotonic even if
    /// the wall clock steps backwards.
    pub(crate) fn stamp_after(&mut self, previous: Option<&Document>) {
        let now = now_millis();
        self.updated_at = match previous {
            Some(prev) if prev.updated_at >= now => prev.updated_at + 1,
            _ => now,
        };
    }
}

pub(crate) fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
