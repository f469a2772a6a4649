//! Durable sync queue
//!
//! An append-only log of pending mutations, stored in the reserved
//! `sync_queue` table. Entries carry a persisted monotonic sequence number
//! allocated in the same transaction as the insert; that sequence, not the
//! wall-clock timestamp, defines replay order. Entries are never deleted:
//! syncing flips the `synced` flag, which keeps the log usable as an audit
//! trail and makes re-drains safe.

use std::sync::Arc;

use redb::ReadableTable;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::{LocalStore, META, META_QUEUE_SEQ, SYNC_QUEUE};

/// The kind of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationKind::Create => write!(f, "create"),
            MutationKind::Update => write!(f, "update"),
            MutationKind::Delete => write!(f, "delete"),
        }
    }
}

/// One pending mutation awaiting remote application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Queue-wide identity and replay position
    pub seq: u64,
    /// Target collection
    pub collection: String,
    /// Mutation kind
    pub kind: MutationKind,
    /// The record for create/update, the bare identity for delete
    pub payload: serde_json::Value,
    /// When the mutation was enqueued (Unix millis, audit only)
    pub timestamp_millis: i64,
    /// Whether the backend has acknowledged this entry
    pub synced: bool,
}

/// The queue operations the sync layer drives.
///
/// [`SyncQueue`] is the durable implementation; tests wrap it to inject
/// enqueue faults and the engine only depends on this seam.
pub trait MutationQueue: Send + Sync {
    /// Append a pending mutation.
    fn enqueue(
        &self,
        collection: &str,
        kind: MutationKind,
        payload: serde_json::Value,
    ) -> Result<QueueEntry, StoreError>;

    /// All unsynced entries, ascending by sequence.
    fn pending(&self) -> Result<Vec<QueueEntry>, StoreError>;

    /// Count of unsynced entries.
    fn pending_count(&self) -> Result<usize, StoreError> {
        Ok(self.pending()?.len())
    }

    /// Flip an entry's `synced` flag to true.
    fn mark_synced(&self, seq: u64) -> Result<(), StoreError>;
}

/// Durable queue of pending mutations, built atop [`LocalStore`].
pub struct SyncQueue {
    store: Arc<LocalStore>,
}

impl SyncQueue {
    /// Create a sync queue over a shared store.
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    /// Append a pending mutation.
    ///
    /// The sequence number is allocated from a persisted counter inside the
    /// same transaction as the entry insert, so two entries can never share
    /// a sequence and a crash cannot reuse one.
    pub fn enqueue(
        &self,
        collection: &str,
        kind: MutationKind,
        payload: serde_json::Value,
    ) -> Result<QueueEntry, StoreError> {
        self.store.spec(collection)?;

        let write_txn = self
            .store
            .db()
            .begin_write()
            .map_err(|e| StoreError::database(e.to_string()))?;

        let entry = {
            let mut meta = write_txn
                .open_table(META)
                .map_err(|e| StoreError::database(e.to_string()))?;
            let seq = meta
                .get(META_QUEUE_SEQ)
                .map_err(|e| StoreError::database(e.to_string()))?
                .map(|v| v.value())
                .unwrap_or(0)
                + 1;
            meta.insert(META_QUEUE_SEQ, seq)
                .map_err(|e| StoreError::database(e.to_string()))?;

            let entry = QueueEntry {
                seq,
                collection: collection.to_string(),
                kind,
                payload,
                timestamp_millis: chrono::Utc::now().timestamp_millis(),
                synced: false,
            };

            let bytes = serde_json::to_vec(&entry)
                .map_err(|e| StoreError::serialization(e.to_string()))?;

            let mut queue = write_txn
                .open_table(SYNC_QUEUE)
                .map_err(|e| StoreError::database(e.to_string()))?;
            queue
                .insert(seq, bytes.as_slice())
                .map_err(|e| StoreError::database(e.to_string()))?;

            entry
        };

        write_txn
            .commit()
            .map_err(|e| StoreError::database(e.to_string()))?;

        debug!(seq = entry.seq, collection, kind = %kind, "Enqueued mutation");
        Ok(entry)
    }

    /// All unsynced entries, ascending by sequence.
    ///
    /// Corrupt entries are warned about and skipped; they never reach the
    /// reconciler.
    pub fn pending(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let mut entries = self.load(|e| !e.synced)?;
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    /// Count of unsynced entries.
    pub fn pending_count(&self) -> Result<usize, StoreError> {
        Ok(self.pending()?.len())
    }

    /// Total entries ever enqueued, synced or not.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.load(|_| true)?.len())
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Flip an entry's `synced` flag to true.
    ///
    /// Idempotent: marking an already-synced or unknown sequence is a no-op.
    pub fn mark_synced(&self, seq: u64) -> Result<(), StoreError> {
        let write_txn = self
            .store
            .db()
            .begin_write()
            .map_err(|e| StoreError::database(e.to_string()))?;

        {
            let mut queue = write_txn
                .open_table(SYNC_QUEUE)
                .map_err(|e| StoreError::database(e.to_string()))?;

            let bytes = queue
                .get(seq)
                .map_err(|e| StoreError::database(e.to_string()))?
                .map(|v| v.value().to_vec());

            match bytes {
                None => {
                    warn!(seq, "mark_synced for unknown queue entry");
                }
                Some(bytes) => {
                    let mut entry: QueueEntry = serde_json::from_slice(&bytes)
                        .map_err(|e| StoreError::deserialization(e.to_string()))?;
                    if !entry.synced {
                        entry.synced = true;
                        let updated = serde_json::to_vec(&entry)
                            .map_err(|e| StoreError::serialization(e.to_string()))?;
                        queue
                            .insert(seq, updated.as_slice())
                            .map_err(|e| StoreError::database(e.to_string()))?;
                    }
                }
            }
        }

        write_txn
            .commit()
            .map_err(|e| StoreError::database(e.to_string()))?;

        Ok(())
    }

    /// Load entries matching a filter, in key order.
    fn load(&self, keep: impl Fn(&QueueEntry) -> bool) -> Result<Vec<QueueEntry>, StoreError> {
        let read_txn = self
            .store
            .db()
            .begin_read()
            .map_err(|e| StoreError::database(e.to_string()))?;
        let queue = read_txn
            .open_table(SYNC_QUEUE)
            .map_err(|e| StoreError::database(e.to_string()))?;

        let mut entries = Vec::new();
        let range = queue
            .range(0..)
            .map_err(|e| StoreError::database(e.to_string()))?;

        for item in range {
            let (seq, bytes) = item.map_err(|e| StoreError::database(e.to_string()))?;
            match serde_json::from_slice::<QueueEntry>(bytes.value()) {
                Ok(entry) => {
                    if keep(&entry) {
                        entries.push(entry);
                    }
                }
                Err(e) => warn!(seq = seq.value(), error = %e, "Skipping corrupt queue entry"),
            }
        }

        Ok(entries)
    }
}

impl MutationQueue for SyncQueue {
    fn enqueue(
        &self,
        collection: &str,
        kind: MutationKind,
        payload: serde_json::Value,
    ) -> Result<QueueEntry, StoreError> {
        SyncQueue::enqueue(self, collection, kind, payload)
    }

    fn pending(&self) -> Result<Vec<QueueEntry>, StoreError> {
        SyncQueue::pending(self)
    }

    fn pending_count(&self) -> Result<usize, StoreError> {
        SyncQueue::pending_count(self)
    }

    fn mark_synced(&self, seq: u64) -> Result<(), StoreError> {
        SyncQueue::mark_synced(self, seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_queue() -> (SyncQueue, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig {
            db_path: temp_dir.path().join("test.redb"),
            ..Default::default()
        };
        let store = Arc::new(LocalStore::open(config).unwrap());
        (SyncQueue::new(store), temp_dir)
    }

    #[test]
    fn test_enqueue_assigns_increasing_seq() {
        let (queue, _temp) = create_test_queue();

        let a = queue
            .enqueue("packages", MutationKind::Create, json!({"id": "PKG1"}))
            .unwrap();
        let b = queue
            .enqueue("packages", MutationKind::Update, json!({"id": "PKG1"}))
            .unwrap();
        let c = queue
            .enqueue("activities", MutationKind::Create, json!({"id": "ACT1"}))
            .unwrap();

        assert!(a.seq < b.seq);
        assert!(b.seq < c.seq);
        assert!(!a.synced);
    }

    #[test]
    fn test_enqueue_unknown_collection() {
        let (queue, _temp) = create_test_queue();
        let err = queue
            .enqueue("mystery", MutationKind::Create, json!({"id": "1"}))
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownCollection(_)));
    }

    #[test]
    fn test_pending_is_seq_ordered() {
        let (queue, _temp) = create_test_queue();

        for i in 0..5 {
            queue
                .enqueue(
                    "packages",
                    MutationKind::Create,
                    json!({"id": format!("PKG{i}")}),
                )
                .unwrap();
        }

        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 5);
        for pair in pending.windows(2) {
            assert!(pair[0].seq < pair[1].seq);
        }
    }

    #[test]
    fn test_mark_synced_removes_from_pending_but_not_log() {
        let (queue, _temp) = create_test_queue();

        let entry = queue
            .enqueue("packages", MutationKind::Create, json!({"id": "PKG1"}))
            .unwrap();
        assert_eq!(queue.pending_count().unwrap(), 1);

        queue.mark_synced(entry.seq).unwrap();
        assert_eq!(queue.pending_count().unwrap(), 0);

        // Append-only: the entry is still in the log.
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn test_mark_synced_idempotent() {
        let (queue, _temp) = create_test_queue();

        let entry = queue
            .enqueue("packages", MutationKind::Delete, json!("PKG1"))
            .unwrap();

        queue.mark_synced(entry.seq).unwrap();
        queue.mark_synced(entry.seq).unwrap();
        queue.mark_synced(9999).unwrap(); // unknown seq is a no-op

        assert_eq!(queue.pending_count().unwrap(), 0);
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn test_entry_shape() {
        let (queue, _temp) = create_test_queue();

        let entry = queue
            .enqueue(
                "packages",
                MutationKind::Create,
                json!({"id": "PKG1", "status": "process"}),
            )
            .unwrap();

        assert_eq!(entry.collection, "packages");
        assert_eq!(entry.kind, MutationKind::Create);
        assert_eq!(entry.payload["id"], "PKG1");
        assert!(entry.timestamp_millis > 0);
    }
}
