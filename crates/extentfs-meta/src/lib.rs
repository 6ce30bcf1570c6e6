//! Metadata Collaborators for extentfs
//!
//! The extent engine does not own the namespace. File sizes, extent lists
//! and directory structure live at the metadata service; partition maps
//! and tenant limits live at the master. This crate defines the trait
//! boundary to both, so the engine can be driven against the real wire
//! clients in production and against in-memory fakes in tests.
//!
//! ## The Contract
//!
//! The metadata service is the source of truth for the extent list. The
//! engine's in-memory cache is an optimization: after a successful data
//! write, the new key is first made durable via
//! [`MetaStore::insert_extent_key`] and only then installed in the cache.
//! A data write whose key insert fails is treated as failed; the orphaned
//! extent is left for server-side garbage collection.
//!
//! ## Thread Safety
//!
//! Both traits are object-safe and `Send + Sync`; the engine holds them as
//! `Arc<dyn MetaStore>` / `Arc<dyn MasterClient>` shared across every
//! per-inode worker.

pub mod error;
pub mod master;
pub mod types;

pub use error::{MetaError, Result};
pub use master::MasterClient;
pub use types::{Dentry, ExtentSnapshot, InodeKind, LimitInfo, PartitionInfo};

use async_trait::async_trait;
use extentfs_core::ExtentKey;

/// Callbacks into the metadata service, provided by the namespace layer.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Durably append an extent key to the file's extent list.
    ///
    /// `is_pre_extent` marks keys allocated ahead of the data they will
    /// hold (pre-allocation); the server treats them as provisional.
    async fn insert_extent_key(&self, inode: u64, key: ExtentKey, is_pre_extent: bool)
        -> Result<()>;

    /// Snapshot fetch of the file's extent list, size and generation.
    async fn get_extents(&self, inode: u64) -> Result<ExtentSnapshot>;

    /// Truncate the file from `old_size` to `new_size`.
    async fn truncate(&self, inode: u64, old_size: u64, new_size: u64) -> Result<()>;

    /// Hint that this client no longer caches metadata for `inode`.
    async fn evict_inode_cache(&self, inode: u64);

    /// Atomically replace `old` keys with `new` keys in the file's extent
    /// list. Used by the background merger; the server rejects the swap if
    /// the list changed underneath.
    async fn merge_extents(&self, inode: u64, old: &[ExtentKey], new: &[ExtentKey]) -> Result<()>;

    /// List the entries of directory `parent`. Powers the merger's
    /// full-tree walk when the master publishes the pseudo-inode `0`.
    async fn read_dir(&self, parent: u64) -> Result<Vec<Dentry>>;
}
