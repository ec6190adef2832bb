//! Error types for the sync layer.

use thiserror::Error;

/// Main error type for sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Blank or whitespace-only content, rejected before any backend I/O.
    #[error("content is blank")]
    BlankContent,

    /// The backend rejected the write or it timed out. The optimistic record
    /// has already been rolled back when this is returned.
    #[error("backend write failed: {0}")]
    WriteFailed(String),

    /// The backend live channel reported an error. Non-fatal: delivered as an
    /// event on the view stream, local state stays at last-known-good.
    #[error("listener error: {0}")]
    Listener(String),

    /// The subscription this handle belonged to was torn down.
    #[error("subscription dropped")]
    SubscriptionDropped,
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
