//! # Waybill Sync
//!
//! Reconciliation layer for the waybill offline cache.
//!
//! While the device is offline the UI keeps reading and mutating the local
//! cache; mutations accumulate in the durable sync queue. This crate watches
//! connectivity and, whenever it returns, replays the queue against the
//! remote backend in order — at-least-once, idempotent by record identity,
//! with per-record program order preserved.
//!
//! ## Components
//!
//! - **ConnectivityMonitor**: injected observable online/offline state
//! - **RemoteBackend**: the trait seam to the server, with an in-memory
//!   implementation for tests and simulation
//! - **Reconciler**: the sequential drain loop with per-entry failure
//!   isolation
//! - **SyncEngine**: the facade the UI layer calls — optimistic mutate
//!   helpers, manual sync, and the auto-drain task

pub mod connectivity;
pub mod engine;
pub mod error;
pub mod reconciler;
pub mod remote;

// Re-exports
pub use connectivity::{Connectivity, ConnectivityMonitor, Subscription};
pub use engine::SyncEngine;
pub use error::{RemoteError, SyncError};
pub use reconciler::{DrainReport, Reconciler};
pub use remote::{InMemoryRemote, RemoteBackend};
