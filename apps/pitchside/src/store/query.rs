use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;

use super::{Document, StoreError};

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Eq(String, Value),
    In(String, Vec<Value>),
}

impl Condition {
    fn field(&self) -> &str {
        match self {
            Condition::Eq(field, _) | Condition::In(field, _) => field,
        }
    }
}

/// Conjunction of equality / membership tests on indexed fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    conditions: Vec<Condition>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(field.into(), value.into()));
        self
    }

    pub fn where_in<I, V>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.conditions.push(Condition::In(field.into(), values));
        self
    }
}

/// Value -> ids lookup for each declared field. Missing fields index as
/// `null`.
#[derive(Debug, Clone, Default)]
pub(crate) struct SecondaryIndex {
    entries: HashMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl SecondaryIndex {
    pub(crate) fn new(fields: &[String]) -> Self {
        let entries = fields
            .iter()
            .map(|field| (field.clone(), BTreeMap::new()))
            .collect();
        Self { entries }
    }

    pub(crate) fn insert(&mut self, doc: &Document) {
        for (field, values) in self.entries.iter_mut() {
            values
                .entry(index_key(doc.field(field)))
                .or_default()
                .insert(doc.id.clone());
        }
    }

    pub(crate) fn remove(&mut self, doc: &Document) {
        for (field, values) in self.entries.iter_mut() {
            let key = index_key(doc.field(field));
            if let Some(ids) = values.get_mut(&key) {
                ids.remove(&doc.id);
                if ids.is_empty() {
                    values.remove(&key);
                }
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        for values in self.entries.values_mut() {
            values.clear();
        }
    }

    /// Ids matching every condition, or `None` for an unconditional query.
    pub(crate) fn resolve(&self, query: &Query) -> Result<Option<BTreeSet<String>>, StoreError> {
        let mut matched: Option<BTreeSet<String>> = None;
        for condition in &query.conditions {
            let values = self
                .entries
                .get(condition.field())
                .ok_or_else(|| StoreError::NotIndexed(condition.field().to_string()))?;
            let ids: BTreeSet<String> = match condition {
                Condition::Eq(_, value) => values
                    .get(&index_key(Some(value)))
                    .cloned()
                    .unwrap_or_default(),
                Condition::In(_, candidates) => candidates
                    .iter()
                    .filter_map(|value| values.get(&index_key(Some(value))))
                    .flatten()
                    .cloned()
                    .collect(),
            };
            matched = Some(match matched {
                Some(current) => current.intersection(&ids).cloned().collect(),
                None => ids,
            });
        }
        Ok(matched)
    }
}

fn index_key(value: Option<&Value>) -> String {
    value.unwrap_or(&Value::Null).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, guild: Value) -> Document {
        let mut data = serde_json::Map::new();
        data.insert("guild".into(), guild);
        Document::new(id, data)
    }

    #[test]
    fn resolves_eq_and_in() {
        let mut index = SecondaryIndex::new(&["guild".to_string()]);
        index.insert(&doc("a", json!("brewers")));
        index.insert(&doc("b", json!("masons")));
        index.insert(&doc("c", json!("brewers")));

        let eq = index
            .resolve(&Query::all().where_eq("guild", "brewers"))
            .unwrap()
            .unwrap();
        assert_eq!(eq.into_iter().collect::<Vec<_>>(), vec!["a", "c"]);

        let within = index
            .resolve(&Query::all().where_in("guild", ["masons", "fishermen"]))
            .unwrap()
            .unwrap();
        assert_eq!(within.into_iter().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn removal_drops_entries() {
        let mut index = SecondaryIndex::new(&["guild".to_string()]);
        let a = doc("a", json!("brewers"));
        index.insert(&a);
        index.remove(&a);
        let ids = index
            .resolve(&Query::all().where_eq("guild", "brewers"))
            .unwrap()
            .unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn unindexed_field_is_rejected() {
        let index = SecondaryIndex::new(&["guild".to_string()]);
        let err = index
            .resolve(&Query::all().where_eq("score", 3))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotIndexed(field) if field == "score"));
    }

    #[test]
    fn missing_field_indexes_as_null() {
        let mut index = SecondaryIndex::new(&["guild".to_string()]);
        index.insert(&Document::new("a", serde_json::Map::new()));
        let ids = index
            .resolve(&Query::all().where_eq("guild", Value::Null))
            .unwrap()
            .unwrap();
        assert!(ids.contains("a"));
    }
}
