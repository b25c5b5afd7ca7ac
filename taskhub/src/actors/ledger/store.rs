//! Pluggable key-value persistence for ledger records.
//!
//! The ledger only needs get/set/query over JSON documents grouped by
//! collection; durability is whatever the implementation provides.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

pub const COLLECTION_REQUESTS: &str = "requests";
pub const COLLECTION_ASSIGNMENTS: &str = "assignments";
pub const COLLECTION_RESULTS: &str = "results";
pub const COLLECTION_ERRORS: &str = "errors";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

pub trait RecordStore: Send + 'static {
    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError>;

    fn set(&mut self, collection: &str, key: &str, value: Value) -> Result<(), StoreError>;

    /// All documents of a collection accepted by `filter`, in key order
    fn query(
        &self,
        collection: &str,
        filter: &dyn Fn(&Value) -> bool,
    ) -> Result<Vec<Value>, StoreError>;
}

/// In-memory store, the default for tests and single-process hosts
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    collections: HashMap<String, BTreeMap<String, Value>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .collections
            .get(collection)
            .and_then(|docs| docs.get(key))
            .cloned())
    }

    fn set(&mut self, collection: &str, key: &str, value: Value) -> Result<(), StoreError> {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn query(
        &self,
        collection: &str,
        filter: &dyn Fn(&Value) -> bool,
    ) -> Result<Vec<Value>, StoreError> {
        Ok(self
            .collections
            .get(collection)
            .map(|docs| docs.values().filter(|v| filter(v)).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_store_get_set_query() {
        let mut store = MemoryRecordStore::new();
        store
            .set(COLLECTION_REQUESTS, "b", json!({"status": "failed"}))
            .unwrap();
        store
            .set(COLLECTION_REQUESTS, "a", json!({"status": "completed"}))
            .unwrap();

        assert_eq!(
            store.get(COLLECTION_REQUESTS, "a").unwrap(),
            Some(json!({"status": "completed"}))
        );
        assert_eq!(store.get(COLLECTION_ERRORS, "a").unwrap(), None);

        let failed = store
            .query(COLLECTION_REQUESTS, &|v| v["status"] == "failed")
            .unwrap();
        assert_eq!(failed, vec![json!({"status": "failed"})]);
    }
}
