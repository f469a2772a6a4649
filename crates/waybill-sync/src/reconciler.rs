//! Sync reconciler
//!
//! Replays pending queue entries against the remote backend, in sequence
//! order, when connectivity permits. Replay is strictly sequential: each
//! remote call is awaited before the next entry is considered, which is what
//! preserves per-record program order (a create must reach the backend
//! before an update to the same identity). Cross-record parallelism would be
//! a valid optimization but the ordering contract only needs this.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use waybill_store::{LocalStore, MutationKind, MutationQueue, QueueEntry};

use crate::connectivity::ConnectivityMonitor;
use crate::error::{RemoteError, SyncError};
use crate::remote::RemoteBackend;

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries dispatched to the backend
    pub attempted: usize,
    /// Entries acknowledged and marked synced
    pub synced: usize,
    /// Entries that failed (remote error or malformed) and remain pending
    pub failed: usize,
    /// Entries not dispatched: connectivity lost mid-pass, or held back
    /// behind an earlier failed entry for the same record
    pub skipped: usize,
}

impl DrainReport {
    /// Whether every pending entry was dispatched and acknowledged.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }
}

/// Replays the sync queue against the remote backend.
pub struct Reconciler {
    store: Arc<LocalStore>,
    queue: Arc<dyn MutationQueue>,
    connectivity: ConnectivityMonitor,
    backend: Arc<dyn RemoteBackend>,
}

impl Reconciler {
    pub fn new(
        store: Arc<LocalStore>,
        queue: Arc<dyn MutationQueue>,
        connectivity: ConnectivityMonitor,
        backend: Arc<dyn RemoteBackend>,
    ) -> Self {
        Self {
            store,
            queue,
            connectivity,
            backend,
        }
    }

    /// One drain pass over all currently pending entries.
    ///
    /// While offline this is a no-op, not an error: zero remote calls are
    /// made and every entry stays pending. A failed entry never blocks
    /// unrelated entries, but later entries for the same record are held
    /// back so program order per identity is preserved. Entries stay pending
    /// until the backend acknowledges them; `synced` is never written first.
    pub async fn drain(&self) -> Result<DrainReport, SyncError> {
        if self.connectivity.current().is_offline() {
            debug!("Drain requested while offline; nothing to do");
            return Ok(DrainReport::default());
        }

        let pending = self.queue.pending()?;
        if pending.is_empty() {
            debug!("Sync queue empty");
            return Ok(DrainReport::default());
        }

        info!(pending = pending.len(), "Draining sync queue");

        let mut report = DrainReport::default();
        let mut failed_records: HashSet<(String, String)> = HashSet::new();
        let total = pending.len();
        let mut processed = 0;

        for entry in pending {
            // Connectivity can drop mid-pass; the in-flight call fails
            // naturally, the rest should not even be attempted.
            if self.connectivity.current().is_offline() {
                report.skipped += total - processed;
                warn!(remaining = total - processed, "Connectivity lost mid-drain");
                break;
            }
            processed += 1;

            let scope = match self.entry_identity(&entry) {
                Ok(id) => (entry.collection.clone(), id),
                Err(e) => {
                    report.failed += 1;
                    warn!(seq = entry.seq, error = %e, "Malformed queue entry left pending");
                    continue;
                }
            };

            if failed_records.contains(&scope) {
                report.skipped += 1;
                debug!(
                    seq = entry.seq,
                    collection = %scope.0,
                    record_id = %scope.1,
                    "Held back behind an earlier failed entry for the same record"
                );
                continue;
            }

            report.attempted += 1;
            match self.dispatch(&entry, &scope.1).await {
                Ok(()) => {
                    report.synced += 1;
                    // A failed mark leaves the entry pending; replaying it
                    // next pass is safe because remote ops are idempotent.
                    if let Err(e) = self.queue.mark_synced(entry.seq) {
                        warn!(seq = entry.seq, error = %e, "Synced entry could not be marked");
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    failed_records.insert(scope);
                    warn!(
                        seq = entry.seq,
                        collection = %entry.collection,
                        kind = %entry.kind,
                        unreachable = e.is_unreachable(),
                        error = %e,
                        "Entry failed, leaving pending for next drain"
                    );
                }
            }
        }

        info!(
            attempted = report.attempted,
            synced = report.synced,
            failed = report.failed,
            skipped = report.skipped,
            "Drain pass finished"
        );

        Ok(report)
    }

    /// Dispatch one entry's remote operation.
    async fn dispatch(&self, entry: &QueueEntry, id: &str) -> Result<(), RemoteError> {
        match entry.kind {
            MutationKind::Create => self.backend.insert(&entry.collection, &entry.payload).await,
            MutationKind::Update => {
                self.backend
                    .update(&entry.collection, id, &entry.payload)
                    .await
            }
            MutationKind::Delete => self.backend.delete(&entry.collection, id).await,
        }
    }

    /// Extract the record identity an entry targets.
    ///
    /// Deletes carry the bare identity as their payload; creates and updates
    /// carry the record, keyed by the collection's declared key field.
    fn entry_identity(&self, entry: &QueueEntry) -> Result<String, SyncError> {
        let key_field = self
            .store
            .key_field(&entry.collection)
            .map_err(|_| SyncError::MalformedEntry {
                seq: entry.seq,
                reason: format!("collection '{}' is not declared", entry.collection),
            })?;

        let id = match entry.kind {
            MutationKind::Delete => entry
                .payload
                .as_str()
                .or_else(|| entry.payload.get(key_field).and_then(Value::as_str)),
            MutationKind::Create | MutationKind::Update => {
                entry.payload.get(key_field).and_then(Value::as_str)
            }
        };

        id.map(str::to_string).ok_or_else(|| SyncError::MalformedEntry {
            seq: entry.seq,
            reason: format!("payload carries no '{key_field}' identity"),
        })
    }

    /// Spawn the auto-drain task.
    ///
    /// Watches connectivity and runs a drain pass on every transition to
    /// online. The offline transition does nothing; in-flight work fails
    /// naturally. The task keeps the reconciler (and its monitor clone)
    /// alive, so it does not end on its own: hold the [`JoinHandle`] and
    /// abort it at shutdown.
    pub fn spawn_auto_drain(self: &Arc<Self>) -> JoinHandle<()> {
        let reconciler = Arc::clone(self);
        let mut rx = reconciler.connectivity.watch();

        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                if state.is_online() {
                    info!("Connectivity restored; draining sync queue");
                    if let Err(e) = reconciler.drain().await {
                        warn!(error = %e, "Auto drain failed");
                    }
                }
            }
        })
    }
}
