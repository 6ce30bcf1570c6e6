//! Master RPC trait.
//!
//! The master is the cluster's control plane: it knows which data
//! partitions exist for a volume and publishes per-tenant limits. The
//! engine never speaks the master's wire protocol itself; it is handed an
//! implementation of this trait.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{LimitInfo, PartitionInfo};

/// Client-side view of the master.
///
/// Implementations must be `Send + Sync`; the engine shares one instance
/// across all streamers via `Arc<dyn MasterClient>`.
#[async_trait]
pub trait MasterClient: Send + Sync {
    /// Fetch the current per-tenant limits for `volume`.
    async fn get_limit_info(&self, volume: &str) -> Result<LimitInfo>;

    /// Enumerate the data partitions of `volume`.
    ///
    /// Returns [`MetaError::VolNotFound`](crate::MetaError::VolNotFound)
    /// when the volume has been deleted; the engine latches that state and
    /// fails every subsequent mutating operation.
    async fn get_data_partitions(&self, volume: &str) -> Result<Vec<PartitionInfo>>;
}
