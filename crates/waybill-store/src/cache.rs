//! Cache accessor
//!
//! Read/write facade over [`LocalStore`] for the UI layer. Reads are
//! resilient: a storage failure is logged and surfaced as an empty result so
//! views keep rendering cached data. Writes propagate errors, because a
//! failed optimistic write must not be presented as durable.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::error::StoreError;
use crate::store::LocalStore;

/// Typed read/write facade over the local store.
#[derive(Clone)]
pub struct Cache {
    store: Arc<LocalStore>,
}

impl Cache {
    /// Create a cache accessor over a shared store.
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Point lookup. Storage failures are logged and read as absence.
    pub fn get(&self, collection: &str, id: &str) -> Option<Value> {
        match self.store.get(collection, id) {
            Ok(record) => record,
            Err(e) => {
                warn!(collection, id, error = %e, "Cache read failed");
                None
            }
        }
    }

    /// Full-collection scan. Storage failures read as an empty collection.
    pub fn all(&self, collection: &str) -> Vec<Value> {
        match self.store.all(collection) {
            Ok(records) => records,
            Err(e) => {
                warn!(collection, error = %e, "Cache scan failed");
                Vec::new()
            }
        }
    }

    /// Secondary-index lookup. Storage failures read as no matches.
    pub fn by_index(&self, collection: &str, index: &str, value: &Value) -> Vec<Value> {
        match self.store.get_by_index(collection, index, value) {
            Ok(records) => records,
            Err(e) => {
                warn!(collection, index, error = %e, "Cache index read failed");
                Vec::new()
            }
        }
    }

    /// Typed point lookup. Records failing to deserialize read as absent.
    pub fn get_as<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Option<T> {
        let record = self.get(collection, id)?;
        match serde_json::from_value(record) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!(collection, id, error = %e, "Cached record does not match expected shape");
                None
            }
        }
    }

    /// Typed scan. Records failing to deserialize are warned and skipped.
    pub fn all_as<T: DeserializeOwned>(&self, collection: &str) -> Vec<T> {
        self.all(collection)
            .into_iter()
            .filter_map(|record| match serde_json::from_value(record) {
                Ok(typed) => Some(typed),
                Err(e) => {
                    warn!(collection, error = %e, "Skipping record with unexpected shape");
                    None
                }
            })
            .collect()
    }

    /// Upsert one record.
    pub fn put(&self, collection: &str, record: &Value) -> Result<(), StoreError> {
        self.store.put(collection, record)
    }

    /// Upsert a batch atomically.
    pub fn put_many(&self, collection: &str, records: &[Value]) -> Result<(), StoreError> {
        self.store.put_many(collection, records)
    }

    /// Delete a record. Idempotent.
    pub fn remove(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.store.remove(collection, id)
    }
}
