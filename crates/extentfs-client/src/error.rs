//! Error types for the extent engine.
//!
//! ## Error Handling Strategy
//!
//! - **Retried internally**: transient transport failures (the partition
//!   wrapper retries up to its budget), `ExtentNotFound` on read (the
//!   streamer flushes, refetches and retries once).
//! - **Surfaced immediately**: `VolNotExists`, `InvalidArgument`,
//!   `Closed`, `Cancelled`, `Conflict`.
//! - **Caller decides**: `RateLimited` only appears when a request
//!   deadline fired while waiting on a token bucket.

use extentfs_meta::MetaError;
use thiserror::Error;

use crate::transport::TransportError;

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Operation on an inode with no open stream. Call `open_stream`
    /// first.
    #[error("stream not opened yet: inode {0}")]
    StreamNotOpen(u64),

    /// The volume was deleted out from under the client. Every mutating
    /// operation fails with this once the wrapper observes it.
    #[error("volume '{0}' does not exist")]
    VolNotExists(String),

    /// The one-shot extent fetch after open never succeeded, so the
    /// extent cache was never initialized.
    #[error("extent list fetch failed: inode {0}")]
    GetExtentsFailed(u64),

    /// A data partition no longer holds the extent the cache points at.
    /// The read path treats this as a stale-cache signal.
    #[error("extent not found: partition {partition_id} extent {extent_id}")]
    ExtentNotFound { partition_id: u64, extent_id: u64 },

    /// The caller's deadline fired, or the caller went away while the
    /// request was queued or in flight. Partial effects are abandoned.
    #[error("request cancelled")]
    Cancelled,

    /// The streamer is terminal; the request was drained without running.
    #[error("streamer closed")]
    Closed,

    /// The metadata service rejected a mutation as stale.
    #[error("metadata conflict: {0}")]
    Conflict(String),

    /// Transport-level failure that survived the wrapper's retry budget.
    #[error("network error: {0}")]
    Network(String),

    /// No healthy, writable data partition to allocate a new extent on.
    #[error("no writable data partition available")]
    NoWritablePartition,

    /// The request deadline fired while waiting on a token bucket.
    #[error("rate limit wait exceeded deadline")]
    RateLimited,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Partition wrapper construction exhausted its mount retries.
    #[error("data partition wrapper init failed after {0} attempts")]
    InitWrapperFailed(usize),

    #[error("metadata error: {0}")]
    Meta(#[from] MetaError),
}

impl ClientError {
    /// Whether this error is the read path's stale-cache signal.
    pub fn is_extent_not_found(&self) -> bool {
        matches!(self, ClientError::ExtentNotFound { .. })
    }
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::ExtentNotFound {
                partition_id,
                extent_id,
            } => ClientError::ExtentNotFound {
                partition_id,
                extent_id,
            },
            other => ClientError::Network(other.to_string()),
        }
    }
}
