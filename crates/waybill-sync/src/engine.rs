//! SyncEngine — the app-layer entry point.
//!
//! Ties the cache, queue, connectivity monitor, and reconciler together and
//! gives the UI layer the mutate helpers: every mutation is an optimistic
//! cache write followed by a durable enqueue, and an enqueue failure rolls
//! the optimistic write back so the caller never sees a mutation that will
//! silently fail to sync.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::warn;

use waybill_store::{Cache, LocalStore, MutationKind, MutationQueue, SyncQueue};

use crate::connectivity::ConnectivityMonitor;
use crate::error::SyncError;
use crate::reconciler::{DrainReport, Reconciler};
use crate::remote::RemoteBackend;

/// The offline-first sync facade.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use serde_json::json;
/// use waybill_store::{LocalStore, StoreConfig};
/// use waybill_sync::{Connectivity, ConnectivityMonitor, SyncEngine};
///
/// let store = Arc::new(LocalStore::open(StoreConfig::default())?);
/// let connectivity = ConnectivityMonitor::new(Connectivity::Online);
/// let engine = SyncEngine::new(store, connectivity.clone(), backend);
/// let _drainer = engine.start();
///
/// // Works the same offline; the queue drains once connectivity returns.
/// engine.create("packages", json!({"id": "PKG1", "status": "process"}))?;
/// ```
pub struct SyncEngine {
    store: Arc<LocalStore>,
    cache: Cache,
    queue: Arc<dyn MutationQueue>,
    connectivity: ConnectivityMonitor,
    reconciler: Arc<Reconciler>,
}

impl SyncEngine {
    /// Create an engine over a shared store, an injected connectivity
    /// monitor, and the remote backend collaborator.
    pub fn new(
        store: Arc<LocalStore>,
        connectivity: ConnectivityMonitor,
        backend: Arc<dyn RemoteBackend>,
    ) -> Self {
        let queue = Arc::new(SyncQueue::new(Arc::clone(&store)));
        Self::with_queue(store, queue, connectivity, backend)
    }

    /// Create an engine over an explicit queue implementation, for callers
    /// that decorate the durable queue (fault injection in tests).
    pub fn with_queue(
        store: Arc<LocalStore>,
        queue: Arc<dyn MutationQueue>,
        connectivity: ConnectivityMonitor,
        backend: Arc<dyn RemoteBackend>,
    ) -> Self {
        let cache = Cache::new(Arc::clone(&store));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            connectivity.clone(),
            backend,
        ));

        Self {
            store,
            cache,
            queue,
            connectivity,
            reconciler,
        }
    }

    /// Record a creation: optimistic cache write plus queued mutation.
    pub fn create(&self, collection: &str, record: Value) -> Result<(), SyncError> {
        self.mutate(collection, MutationKind::Create, record)
    }

    /// Record an update (last write wins locally and remotely).
    pub fn update(&self, collection: &str, record: Value) -> Result<(), SyncError> {
        self.mutate(collection, MutationKind::Update, record)
    }

    /// Record a deletion.
    pub fn delete(&self, collection: &str, id: &str) -> Result<(), SyncError> {
        // Snapshot through the store, not the resilient cache: a masked read
        // error here would make a later rollback destroy the record.
        let previous = self.store.get(collection, id)?;
        self.store.remove(collection, id)?;

        if let Err(e) = self
            .queue
            .enqueue(collection, MutationKind::Delete, Value::String(id.to_string()))
        {
            self.restore(collection, id, previous);
            return Err(SyncError::EnqueueFailed(e));
        }
        Ok(())
    }

    fn mutate(
        &self,
        collection: &str,
        kind: MutationKind,
        record: Value,
    ) -> Result<(), SyncError> {
        let key_field = self.store.key_field(collection)?;
        let id = record
            .get(key_field)
            .and_then(Value::as_str)
            .map(str::to_string);

        let previous = match id.as_deref() {
            Some(id) => self.store.get(collection, id)?,
            None => None,
        };
        self.store.put(collection, &record)?;

        if let Err(e) = self.queue.enqueue(collection, kind, record) {
            // The write is not reliable without its queue entry; undo it.
            if let Some(id) = id.as_deref() {
                self.restore(collection, id, previous);
            }
            return Err(SyncError::EnqueueFailed(e));
        }
        Ok(())
    }

    /// Put the pre-mutation state back after a failed enqueue.
    fn restore(&self, collection: &str, id: &str, previous: Option<Value>) {
        let result = match previous {
            Some(record) => self.store.put(collection, &record),
            None => self.store.remove(collection, id),
        };
        if let Err(e) = result {
            warn!(collection, id, error = %e, "Rollback of optimistic write failed");
        }
    }

    /// Run one drain pass now (explicit manual retry).
    pub async fn sync_now(&self) -> Result<DrainReport, SyncError> {
        self.reconciler.drain().await
    }

    /// Spawn the auto-drain task reacting to connectivity transitions.
    pub fn start(&self) -> JoinHandle<()> {
        self.reconciler.spawn_auto_drain()
    }

    /// Pending mutations awaiting sync.
    pub fn pending_count(&self) -> Result<usize, SyncError> {
        Ok(self.queue.pending_count()?)
    }

    /// The cache accessor for reads while offline.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// The mutation queue.
    pub fn queue(&self) -> &Arc<dyn MutationQueue> {
        &self.queue
    }

    /// The injected connectivity monitor.
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }
}
