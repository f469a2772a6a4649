//! Error types for waybill-sync

use thiserror::Error;

use waybill_store::StoreError;

/// Errors from the remote backend collaborator.
///
/// Network-unreachable is distinct from backend rejection so the reconciler
/// can log them differently, but both leave the entry pending: nothing is
/// marked synced without an acknowledgement.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The backend could not be reached at all
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend received the operation and rejected it
    #[error("backend rejected operation: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Whether this is a network-level failure rather than a rejection.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, RemoteError::Unreachable(_))
    }
}

/// Errors from the sync layer
#[derive(Debug, Error)]
pub enum SyncError {
    /// Underlying storage error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A local mutation could not be durably queued.
    ///
    /// The engine has already rolled the optimistic cache write back; the
    /// caller must not assume the mutation will ever sync.
    #[error("failed to enqueue mutation")]
    EnqueueFailed(#[source] StoreError),

    /// Remote operation failed
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A queue entry is missing the identity its operation needs
    #[error("queue entry {seq} is malformed: {reason}")]
    MalformedEntry { seq: u64, reason: String },
}
