//! Remote backend interface
//!
//! The seam between the reconciler and the server. Every operation must be
//! idempotent by record identity: a replayed insert behaves as an upsert and
//! a replayed delete of an absent identity is a no-op, because at-least-once
//! delivery can apply an entry twice.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::RemoteError;

/// The three operation shapes the reconciler dispatches.
///
/// Implementations must report a network-unreachable condition as
/// [`RemoteError::Unreachable`], distinct from a rejection, and must be
/// idempotent by identity.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Insert a record. Re-inserting the same identity behaves as an upsert.
    async fn insert(&self, collection: &str, record: &Value) -> Result<(), RemoteError>;

    /// Patch a record by identity.
    async fn update(&self, collection: &str, id: &str, patch: &Value) -> Result<(), RemoteError>;

    /// Remove a record by identity. Removing an absent identity is a no-op.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError>;
}

/// In-memory backend for tests and simulation.
///
/// Implements the idempotency contract exactly: insert is an upsert keyed by
/// the record's `id` field, update merges object fields over the stored
/// record (last write wins), delete of an absent identity succeeds.
#[derive(Default)]
pub struct InMemoryRemote {
    collections: DashMap<String, DashMap<String, Value>>,
    calls: std::sync::atomic::AtomicU64,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read back a stored record.
    pub fn get(&self, collection: &str, id: &str) -> Option<Value> {
        self.collections
            .get(collection)
            .and_then(|c| c.get(id).map(|r| r.value().clone()))
    }

    /// Number of records in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, |c| c.len())
    }

    /// Whether a collection holds no records.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Total operations dispatched to this backend.
    pub fn call_count(&self) -> u64 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn record_call(&self) {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteBackend for InMemoryRemote {
    async fn insert(&self, collection: &str, record: &Value) -> Result<(), RemoteError> {
        self.record_call();
        let id = record
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| RemoteError::Rejected("record has no id".to_string()))?;
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), record.clone());
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, patch: &Value) -> Result<(), RemoteError> {
        self.record_call();
        let records = self.collections.entry(collection.to_string()).or_default();
        match records.get_mut(id) {
            Some(mut existing) => {
                if let (Some(target), Some(fields)) = (existing.as_object_mut(), patch.as_object())
                {
                    for (key, value) in fields {
                        target.insert(key.clone(), value.clone());
                    }
                } else {
                    *existing = patch.clone();
                }
            }
            // Patch of an identity we never saw: apply as an upsert, the
            // same last-write-wins treatment the real backend gives a
            // client-generated identity.
            None => {
                records.insert(id.to_string(), patch.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.record_call();
        if let Some(records) = self.collections.get(collection) {
            records.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_is_idempotent_upsert() {
        let remote = InMemoryRemote::new();
        let record = json!({"id": "PKG1", "status": "process"});

        remote.insert("packages", &record).await.unwrap();
        remote.insert("packages", &record).await.unwrap();

        assert_eq!(remote.len("packages"), 1);
        assert_eq!(remote.get("packages", "PKG1"), Some(record));
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let remote = InMemoryRemote::new();
        remote
            .insert("packages", &json!({"id": "PKG1", "status": "process", "weight": 2}))
            .await
            .unwrap();

        remote
            .update("packages", "PKG1", &json!({"id": "PKG1", "status": "delivered"}))
            .await
            .unwrap();

        let stored = remote.get("packages", "PKG1").unwrap();
        assert_eq!(stored["status"], "delivered");
        assert_eq!(stored["weight"], 2);
    }

    #[tokio::test]
    async fn test_delete_absent_is_noop() {
        let remote = InMemoryRemote::new();
        remote.delete("packages", "ghost").await.unwrap();
        assert!(remote.is_empty("packages"));
    }

    #[tokio::test]
    async fn test_call_counting() {
        let remote = InMemoryRemote::new();
        remote
            .insert("packages", &json!({"id": "PKG1"}))
            .await
            .unwrap();
        remote.delete("packages", "PKG1").await.unwrap();
        assert_eq!(remote.call_count(), 2);
    }
}
