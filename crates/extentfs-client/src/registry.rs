//! Sharded inode → streamer map.
//!
//! One flat map guarded by one lock would serialize every open/lookup in
//! the process. Instead the registry is an array of shards, each with its
//! own `RwLock`; shard selection is `inode mod SHARD_COUNT`.
//!
//! ## Contracts
//!
//! - `get` takes the shard read lock only.
//! - Stream creation takes the shard write lock and MUST keep it held
//!   across queueing of the initial Open request, so two racing opens
//!   can never produce two streamers (the façade owns that sequence, see
//!   `ExtentClient::open_stream`).
//! - An entry is removed only after its worker has observed a release or
//!   evict and is on its way out; removal is pointer-guarded so a stale
//!   remove can never take out a successor streamer under the same
//!   inode.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::streamer::StreamerHandle;

/// Number of shards. Must be a power of two.
pub(crate) const SHARD_COUNT: usize = 128;

type Shard = RwLock<HashMap<u64, Arc<StreamerHandle>>>;

pub(crate) struct StreamerRegistry {
    shards: Vec<Shard>,
}

impl StreamerRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    pub fn shard(&self, inode: u64) -> &Shard {
        &self.shards[(inode % SHARD_COUNT as u64) as usize]
    }

    pub async fn get(&self, inode: u64) -> Option<Arc<StreamerHandle>> {
        self.shard(inode).read().await.get(&inode).cloned()
    }

    /// Remove `inode` only if it still maps to `handle`. Called by the
    /// worker on exit; a fresh streamer registered after this one went
    /// terminal is left alone.
    pub async fn remove_entry(&self, inode: u64, handle: &Arc<StreamerHandle>) {
        let mut shard = self.shard(inode).write().await;
        if let Some(current) = shard.get(&inode) {
            if Arc::ptr_eq(current, handle) {
                shard.remove(&inode);
            }
        }
    }

    /// Snapshot of all registered inodes (shutdown iteration).
    pub async fn keys(&self) -> Vec<u64> {
        let mut keys = Vec::new();
        for shard in &self.shards {
            keys.extend(shard.read().await.keys().copied());
        }
        keys
    }

    pub async fn len(&self) -> usize {
        let mut n = 0;
        for shard in &self.shards {
            n += shard.read().await.len();
        }
        n
    }
}
