//! extentfs Client Engine
//!
//! This crate is the client-side extent engine that sits between a
//! POSIX-like file interface and a distributed block/extent storage
//! cluster. For every open file (keyed by inode) it maintains a
//! **streamer**: a serialized request pipeline that owns the file's
//! extent map, buffers overwrites and appends, routes I/O to the right
//! data partition, enforces tenant-wide read/write rate limits, and
//! coordinates background maintenance.
//!
//! ## Architecture
//!
//! ```text
//! callers ──► ExtentClient (façade)
//!                │  registry: inode mod 128 → shard → streamer
//!                ▼
//!         ┌─ Streamer (one worker per inode) ─┐
//!         │  extent cache    overwrite buffer │
//!         │  append buffer   read-ahead       │
//!         └───────┬──────────────┬────────────┘
//!                 ▼              ▼
//!        PartitionWrapper   Arc<dyn MetaStore>
//!        (routing, health,  (extent list, truncate,
//!         retry budget)      merge swap)
//!                 │
//!                 ▼
//!        Arc<dyn ExtentTransport>  (data-plane wire client)
//! ```
//!
//! ## Main Components
//!
//! - [`ExtentClient`]: lifecycle, public API, background config
//!   refresher and extent merger.
//! - `streamer`: per-inode serialized worker; all cache and buffer
//!   mutation happens there.
//! - [`ExtentCache`]: ordered extent map with read/write planning.
//! - [`PartitionWrapper`]: partition pool, follower/near-read routing,
//!   health penalties, transport retry budget.
//! - [`FlowLimiter`]: byte-valued token buckets with dynamic limits.
//!
//! ## Ordering Guarantees
//!
//! Requests for a single inode are serviced strictly in enqueue order,
//! which gives read-your-writes and flush-after-write semantics. Across
//! inodes there is no ordering; cross-inode parallelism is bounded only
//! by the shared transport.
//!
//! ## Usage
//!
//! ```ignore
//! use extentfs_client::{ExtentClient, ExtentConfig};
//!
//! let config = ExtentConfig::new("vol-a", masters, meta, master, transport);
//! let client = ExtentClient::new(config).await?;
//!
//! client.open_stream(ino, false, false).await?;
//! let (n, row) = client.write(ino, 0, b"hello", false, false).await?;
//! client.flush(ino).await?;
//!
//! let mut buf = vec![0u8; 5];
//! let (read, has_hole) = client.read(ino, &mut buf, 0, 5).await?;
//!
//! client.close_stream(ino).await?;
//! client.evict_stream(ino).await?;
//! client.close().await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod extent_cache;
pub mod limiter;
mod merge;
mod registry;
mod streamer;
pub mod transport;
pub mod wrapper;

pub use client::ExtentClient;
pub use config::{
    ExtentConfig, MAX_MOUNT_RETRY_LIMIT, MOUNT_RETRY_INTERVAL, UPDATE_CONFIG_INTERVAL,
};
pub use error::{ClientError, Result};
pub use extent_cache::{ExtentCache, ExtentRequest, ReadSpan};
pub use limiter::{FlowKind, FlowLimiter, DEFAULT_LIMIT_BURST};
pub use streamer::WriteOutcome;
pub use transport::{ExtentTransport, TransportError};
pub use wrapper::{DataPartition, PartitionWrapper, RetryPolicy, UNHEALTHY_PENALTY};
