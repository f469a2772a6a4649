//! # Waybill Store
//!
//! Offline-first local persistence for the waybill delivery app.
//!
//! This crate owns the on-device cache: durable record collections with
//! secondary indexes, a read/write cache accessor for the UI layer, and the
//! durable queue of pending mutations awaiting reconciliation with the
//! remote backend.
//!
//! ## Features
//!
//! - **LocalStore**: redb-backed transactional storage with named
//!   collections, declared indexes, and a schema version
//! - **Cache**: resilient typed reads and pass-through writes
//! - **SyncQueue**: append-only pending-mutation log with an explicit
//!   persisted replay order
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use waybill_store::{Cache, LocalStore, MutationKind, StoreConfig, SyncQueue};
//!
//! let store = Arc::new(LocalStore::open(StoreConfig::default())?);
//! let cache = Cache::new(Arc::clone(&store));
//! let queue = SyncQueue::new(Arc::clone(&store));
//!
//! // Optimistic local write, then queue the mutation for later sync.
//! let record = json!({"id": "PKG1", "status": "process"});
//! cache.put("packages", &record)?;
//! queue.enqueue("packages", MutationKind::Create, record)?;
//! ```

pub mod cache;
pub mod error;
pub mod queue;
pub mod schema;
pub mod store;

// Re-exports
pub use cache::Cache;
pub use error::StoreError;
pub use queue::{MutationKind, MutationQueue, QueueEntry, SyncQueue};
pub use schema::{CollectionSpec, IndexSpec, delivery_schema};
pub use store::{LocalStore, SCHEMA_VERSION, StoreConfig};
