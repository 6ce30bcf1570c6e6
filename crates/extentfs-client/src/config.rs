//! Engine Configuration
//!
//! One record drives the whole engine. Sizes are coerced, never
//! rejected: extent size is clamped to `[1 MiB, 128 MiB]` and rounded up
//! to a power of two, align size is capped at 128 KiB, tiny size maps
//! its sentinels (0 = default, -1 = disabled). Rates of zero or below
//! mean unlimited.
//!
//! The collaborators (metadata service, master, data-plane transport)
//! arrive as trait objects; everything the engine does goes through
//! them.
//!
//! ## Usage
//!
//! ```ignore
//! use extentfs_client::{ExtentClient, ExtentConfig};
//!
//! let mut config = ExtentConfig::new("vol-a", masters, meta, master, transport);
//! config.write_rate = 64 * 1024 * 1024; // 64 MiB/s tenant cap
//! config.extent_merge = true;
//! let client = ExtentClient::new(config).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use extentfs_meta::{MasterClient, MetaStore};

use crate::transport::ExtentTransport;

/// Default mount retry budget.
pub const MAX_MOUNT_RETRY_LIMIT: usize = 5;

/// Default pause between mount attempts.
pub const MOUNT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Default config-refresh tick.
pub const UPDATE_CONFIG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct ExtentConfig {
    /// Volume this engine serves; keys the master's limit maps.
    pub volume: String,
    /// Master endpoints, recorded for diagnostics. The wire client
    /// behind `master` owns the actual addressing.
    pub masters: Vec<String>,

    /// Allow reads from follower replicas.
    pub follower_read: bool,
    /// Prefer topologically near replicas (only meaningful with
    /// `follower_read`).
    pub near_read: bool,

    /// Tenant read limit in bytes/s; ≤ 0 means unlimited.
    pub read_rate: i64,
    /// Tenant write limit in bytes/s; ≤ 0 means unlimited.
    pub write_rate: i64,

    /// Merge alignment in bytes; capped at 128 KiB.
    pub align_size: u64,
    /// Tiny-extent threshold: 0 = default, -1 = disabled.
    pub tiny_size: i64,
    /// Extent size in bytes; coerced to a power of two in
    /// `[1 MiB, 128 MiB]`, 0 = default (128 MiB).
    pub extent_size: u64,

    /// Cap on extents per merge run; 0 = no cap.
    pub max_extent_num_per_align_area: usize,
    /// Merge runs regardless of start alignment.
    pub force_align_merge: bool,
    /// Run the background merger.
    pub extent_merge: bool,

    /// Flush implicitly after every successful write.
    pub auto_flush: bool,

    /// Deadline applied to each queued request (limiter wait + I/O).
    /// `None` disables deadlines.
    pub request_timeout: Option<Duration>,
    /// Extent cache freshness window; an expired cache is refetched
    /// before serving a read.
    pub extent_cache_ttl: Duration,
    /// Config-refresh tick (rate limits, merge targets, partition map).
    pub update_interval: Duration,

    /// Mount retry budget for partition wrapper construction.
    pub mount_retry_limit: usize,
    pub mount_retry_interval: Duration,

    /// Namespace callbacks.
    pub meta_store: Arc<dyn MetaStore>,
    /// Control plane.
    pub master: Arc<dyn MasterClient>,
    /// Data plane.
    pub transport: Arc<dyn ExtentTransport>,
}

impl ExtentConfig {
    /// Config with defaults: unlimited rates, 128 MiB extents, no
    /// buffers forced, background merge off.
    pub fn new(
        volume: impl Into<String>,
        masters: Vec<String>,
        meta_store: Arc<dyn MetaStore>,
        master: Arc<dyn MasterClient>,
        transport: Arc<dyn ExtentTransport>,
    ) -> Self {
        Self {
            volume: volume.into(),
            masters,
            follower_read: false,
            near_read: false,
            read_rate: 0,
            write_rate: 0,
            align_size: 0,
            tiny_size: 0,
            extent_size: 0,
            max_extent_num_per_align_area: 0,
            force_align_merge: false,
            extent_merge: false,
            auto_flush: false,
            request_timeout: Some(Duration::from_secs(30)),
            extent_cache_ttl: Duration::from_secs(30),
            update_interval: UPDATE_CONFIG_INTERVAL,
            mount_retry_limit: MAX_MOUNT_RETRY_LIMIT,
            mount_retry_interval: MOUNT_RETRY_INTERVAL,
            meta_store,
            master,
            transport,
        }
    }
}
