//! End-to-end drain behavior
//!
//! Exercises the reconciler and engine against an in-memory backend with
//! failure injection: offline no-ops, the offline-create-then-reconnect
//! flow, partial-failure isolation, per-record ordering across interrupted
//! drains, and idempotent replay.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use tempfile::TempDir;

use waybill_store::{LocalStore, MutationKind, MutationQueue, StoreConfig};
use waybill_sync::{
    Connectivity, ConnectivityMonitor, InMemoryRemote, RemoteBackend, RemoteError, SyncEngine,
};

/// Delegating backend that records successful operations in order and can
/// fail an operation a configured number of times.
struct TestRemote {
    inner: InMemoryRemote,
    /// "op id" -> remaining failures to inject
    failures: DashMap<String, u32>,
    log: Mutex<Vec<String>>,
}

impl TestRemote {
    fn new() -> Self {
        Self {
            inner: InMemoryRemote::new(),
            failures: DashMap::new(),
            log: Mutex::new(Vec::new()),
        }
    }

    fn fail_once(&self, op: &str, id: &str) {
        self.failures.insert(format!("{op} {id}"), 1);
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn check(&self, op: &str, id: &str) -> Result<(), RemoteError> {
        let key = format!("{op} {id}");
        if let Some(mut remaining) = self.failures.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RemoteError::Unreachable("injected".to_string()));
            }
        }
        self.log.lock().unwrap().push(key);
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for TestRemote {
    async fn insert(&self, collection: &str, record: &Value) -> Result<(), RemoteError> {
        let id = record
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string();
        self.check("insert", &id)?;
        self.inner.insert(collection, record).await
    }

    async fn update(&self, collection: &str, id: &str, patch: &Value) -> Result<(), RemoteError> {
        self.check("update", id)?;
        self.inner.update(collection, id, patch).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.check("delete", id)?;
        self.inner.delete(collection, id).await
    }
}

struct Fixture {
    engine: SyncEngine,
    remote: Arc<TestRemote>,
    connectivity: ConnectivityMonitor,
    _temp: TempDir,
}

fn fixture(initial: Connectivity) -> Fixture {
    let temp = TempDir::new().unwrap();
    let config = StoreConfig {
        db_path: temp.path().join("waybill.redb"),
        ..Default::default()
    };
    let store = Arc::new(LocalStore::open(config).unwrap());
    let connectivity = ConnectivityMonitor::new(initial);
    let remote = Arc::new(TestRemote::new());
    let engine = SyncEngine::new(
        store,
        connectivity.clone(),
        Arc::clone(&remote) as Arc<dyn RemoteBackend>,
    );
    Fixture {
        engine,
        remote,
        connectivity,
        _temp: temp,
    }
}

async fn wait_for_empty_queue(engine: &SyncEngine) {
    for _ in 0..200 {
        if engine.pending_count().unwrap() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue never drained");
}

#[tokio::test]
async fn no_drain_while_offline() {
    let f = fixture(Connectivity::Offline);

    f.engine
        .create("packages", json!({"id": "PKG1", "status": "process"}))
        .unwrap();

    let report = f.engine.sync_now().await.unwrap();
    assert_eq!(report.attempted, 0);
    assert_eq!(f.remote.inner.call_count(), 0);
    assert_eq!(f.engine.pending_count().unwrap(), 1);
}

#[tokio::test]
async fn offline_create_syncs_after_reconnect() {
    let f = fixture(Connectivity::Offline);

    f.engine
        .create("packages", json!({"id": "PKG1", "status": "process"}))
        .unwrap();

    let pending = f.engine.queue().pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert!(!pending[0].synced);
    assert_eq!(pending[0].kind, MutationKind::Create);

    f.connectivity.set_online();
    let report = f.engine.sync_now().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.synced, 1);

    // Nothing pending, backend has the record, and the cache still serves it.
    assert_eq!(f.engine.pending_count().unwrap(), 0);
    assert_eq!(
        f.remote.inner.get("packages", "PKG1").unwrap()["status"],
        "process"
    );
    assert_eq!(
        f.engine.cache().get("packages", "PKG1").unwrap()["status"],
        "process"
    );
}

#[tokio::test]
async fn auto_drain_on_reconnect() {
    let f = fixture(Connectivity::Offline);
    let drainer = f.engine.start();

    f.engine
        .create("packages", json!({"id": "PKG1", "status": "process"}))
        .unwrap();
    assert_eq!(f.engine.pending_count().unwrap(), 1);

    f.connectivity.set_online();
    wait_for_empty_queue(&f.engine).await;

    assert!(f.remote.inner.get("packages", "PKG1").is_some());
    drainer.abort();
}

#[tokio::test]
async fn partial_failure_does_not_block_unrelated_entries() {
    let f = fixture(Connectivity::Online);
    f.remote.fail_once("insert", "PKG2");

    for id in ["PKG1", "PKG2", "PKG3"] {
        f.engine
            .create("packages", json!({"id": id, "status": "process"}))
            .unwrap();
    }

    let report = f.engine.sync_now().await.unwrap();
    assert_eq!(report.attempted, 3);
    assert_eq!(report.synced, 2);
    assert_eq!(report.failed, 1);

    // Only the failed entry is still pending.
    let pending = f.engine.queue().pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload["id"], "PKG2");

    // It syncs on the next pass.
    let report = f.engine.sync_now().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(f.remote.inner.len("packages"), 3);
}

#[tokio::test]
async fn per_record_order_survives_interrupted_drain() {
    let f = fixture(Connectivity::Online);
    f.remote.fail_once("update", "PKG1");

    f.engine
        .create("packages", json!({"id": "PKG1", "status": "process"}))
        .unwrap();
    f.engine
        .update("packages", json!({"id": "PKG1", "status": "delivered"}))
        .unwrap();
    f.engine.delete("packages", "PKG1").unwrap();

    // First pass: create lands, update fails, so the delete for the same
    // record must be held back rather than applied out of order.
    let report = f.engine.sync_now().await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 1);

    // Resumed pass replays the remainder in order.
    let report = f.engine.sync_now().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.synced, 2);

    assert_eq!(
        f.remote.log(),
        vec!["insert PKG1", "update PKG1", "delete PKG1"]
    );
    assert!(f.remote.inner.get("packages", "PKG1").is_none());
    assert_eq!(f.engine.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn replaying_a_create_is_idempotent() {
    let f = fixture(Connectivity::Online);

    // At-least-once delivery can hand the backend the same creation twice
    // (e.g. a mark_synced that failed after the first acknowledgement).
    let record = json!({"id": "PKG1", "status": "process"});
    f.engine.queue()
        .enqueue("packages", MutationKind::Create, record.clone())
        .unwrap();
    f.engine.queue()
        .enqueue("packages", MutationKind::Create, record.clone())
        .unwrap();

    let report = f.engine.sync_now().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.synced, 2);

    assert_eq!(f.remote.inner.len("packages"), 1);
    assert_eq!(f.remote.inner.get("packages", "PKG1"), Some(record));
}

/// Backend whose first operation drops the link, simulating connectivity
/// loss while a drain pass is in flight.
struct DropLinkRemote {
    monitor: ConnectivityMonitor,
    inner: InMemoryRemote,
}

#[async_trait]
impl RemoteBackend for DropLinkRemote {
    async fn insert(&self, collection: &str, record: &Value) -> Result<(), RemoteError> {
        self.monitor.set_offline();
        self.inner.insert(collection, record).await
    }

    async fn update(&self, collection: &str, id: &str, patch: &Value) -> Result<(), RemoteError> {
        self.inner.update(collection, id, patch).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        self.inner.delete(collection, id).await
    }
}

#[tokio::test]
async fn connectivity_loss_mid_drain_skips_remaining_entries() {
    let temp = TempDir::new().unwrap();
    let config = StoreConfig {
        db_path: temp.path().join("waybill.redb"),
        ..Default::default()
    };
    let store = Arc::new(LocalStore::open(config).unwrap());
    let connectivity = ConnectivityMonitor::new(Connectivity::Online);
    let remote = Arc::new(DropLinkRemote {
        monitor: connectivity.clone(),
        inner: InMemoryRemote::new(),
    });
    let engine = SyncEngine::new(
        store,
        connectivity.clone(),
        Arc::clone(&remote) as Arc<dyn RemoteBackend>,
    );

    for id in ["PKG1", "PKG2", "PKG3"] {
        engine
            .create("packages", json!({"id": id, "status": "process"}))
            .unwrap();
    }

    // The first dispatch completes but takes the link down with it; the
    // guard is re-checked before every entry, so the rest are skipped
    // rather than attempted against a dead link.
    let report = engine.sync_now().await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.synced, 1);
    assert_eq!(report.skipped, 2);
    assert_eq!(engine.pending_count().unwrap(), 2);
    assert_eq!(remote.inner.len("packages"), 1);
}

#[tokio::test]
async fn mutations_while_offline_serve_from_cache() {
    let f = fixture(Connectivity::Offline);

    f.engine
        .create("packages", json!({"id": "PKG1", "status": "process"}))
        .unwrap();
    f.engine
        .update("packages", json!({"id": "PKG1", "status": "delivered"}))
        .unwrap();

    // Two individual entries, no coalescing.
    assert_eq!(f.engine.pending_count().unwrap(), 2);

    // The cache serves the optimistic state while offline.
    let cached = f.engine.cache().get("packages", "PKG1").unwrap();
    assert_eq!(cached["status"], "delivered");
    let delivered = f
        .engine
        .cache()
        .by_index("packages", "by_status", &json!("delivered"));
    assert_eq!(delivered.len(), 1);
}
