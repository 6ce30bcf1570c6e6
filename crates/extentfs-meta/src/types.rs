//! Value types exchanged with the metadata service and the master.

use std::collections::HashMap;

use extentfs_core::ExtentKey;
use serde::{Deserialize, Serialize};

/// Snapshot of a file's extent list as held by the metadata service.
///
/// `generation` increases monotonically at the server on every mutation;
/// the client uses it to detect stale caches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtentSnapshot {
    pub size: u64,
    pub generation: u64,
    pub keys: Vec<ExtentKey>,
}

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeKind {
    Regular,
    Directory,
    Other,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dentry {
    pub inode: u64,
    pub name: String,
    pub kind: InodeKind,
}

/// Per-tenant limits published by the master, pulled by the config
/// refresher once a minute.
///
/// The rate maps are keyed by volume name; the empty string is the
/// default-tier fallback. A value of zero means "no limit from the
/// master" (the client falls back to its constructor-provided rate).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitInfo {
    pub client_read_rate: HashMap<String, u64>,
    pub client_write_rate: HashMap<String, u64>,
    /// Volume → inodes the background merger should defragment. The
    /// single pseudo-inode `0` means "walk the whole tree".
    pub extent_merge_inodes: HashMap<String, Vec<u64>>,
    /// Throttle between merge steps.
    pub extent_merge_sleep_ms: u64,
}

/// A data partition as reported by the master.
///
/// The client wraps these into read-only snapshots handed to streamers;
/// health tracking happens client-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub partition_id: u64,
    /// Replica endpoints, leader included.
    pub hosts: Vec<String>,
    /// Endpoint of the current leader.
    pub leader: String,
    /// Replica endpoints considered topologically near this client.
    pub near_hosts: Vec<String>,
    /// Whether the partition accepts new extents.
    pub writable: bool,
}
