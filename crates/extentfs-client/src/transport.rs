//! Data-plane transport trait.
//!
//! On-wire framing to data nodes is not this engine's business. The
//! partition wrapper routes every extent-level operation through an
//! implementation of [`ExtentTransport`]; production wires this to the
//! data-node protocol client (with its shared connection pool), tests
//! wire it to an in-memory cluster.
//!
//! Reads take an explicit `host` so the wrapper's follower-read and
//! near-read policy stays observable at this boundary; writes always go
//! to the partition leader.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::wrapper::DataPartition;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("extent not found: partition {partition_id} extent {extent_id}")]
    ExtentNotFound { partition_id: u64, extent_id: u64 },

    #[error("data partition {0} unavailable")]
    PartitionUnavailable(u64),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("request timed out")]
    Timeout,
}

impl TransportError {
    /// Transient failures the partition wrapper retries within its budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::PartitionUnavailable(_)
                | TransportError::Io(_)
                | TransportError::Timeout
        )
    }
}

/// Extent-level I/O against the data plane.
///
/// Shared across all streamers as `Arc<dyn ExtentTransport>`; the
/// implementation owns the process-wide connection pool and tears it down
/// in [`shutdown`](ExtentTransport::shutdown).
#[async_trait]
pub trait ExtentTransport: Send + Sync {
    /// Allocate a new extent on the partition and return its id.
    ///
    /// `tiny` selects the small-object extent pool used to amortize
    /// allocation for short files.
    async fn create_extent(
        &self,
        partition: &DataPartition,
        inode: u64,
        tiny: bool,
    ) -> Result<u64, TransportError>;

    /// Write `data` at `extent_offset` within the extent, via the
    /// partition leader. Returns the number of bytes written.
    async fn write_extent(
        &self,
        partition: &DataPartition,
        extent_id: u64,
        extent_offset: u64,
        data: &[u8],
    ) -> Result<usize, TransportError>;

    /// Read `size` bytes at `extent_offset` from `host` (chosen by the
    /// wrapper's read-routing policy).
    async fn read_extent(
        &self,
        partition: &DataPartition,
        host: &str,
        extent_id: u64,
        extent_offset: u64,
        size: usize,
    ) -> Result<Bytes, TransportError>;

    /// Tear down pooled connections. Called last during engine shutdown.
    async fn shutdown(&self);
}
