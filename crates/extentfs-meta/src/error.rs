//! Metadata Error Types
//!
//! Errors surfaced by the metadata service and master collaborators. The
//! engine treats `Unavailable` as retryable and everything else as final;
//! `Conflict` means the server rejected a mutation because the client's
//! view of the extent list was stale.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetaError>;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("metadata service unavailable: {0}")]
    Unavailable(String),

    #[error("metadata conflict: {0}")]
    Conflict(String),

    #[error("inode not found: {0}")]
    InodeNotFound(u64),

    #[error("volume not found: {0}")]
    VolNotFound(String),

    #[error("internal metadata error: {0}")]
    Internal(String),
}
