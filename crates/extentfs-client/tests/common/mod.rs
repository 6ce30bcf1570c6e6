//! In-memory collaborators for driving the engine end to end: a
//! metadata store, and a cluster that plays both master and data plane.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use extentfs_client::{DataPartition, ExtentConfig, TransportError};
use extentfs_core::ExtentKey;
use extentfs_meta::{
    Dentry, ExtentSnapshot, LimitInfo, MasterClient, MetaError, MetaStore, PartitionInfo,
};

#[derive(Debug, Clone, Default)]
pub struct FileMeta {
    pub size: u64,
    pub generation: u64,
    pub keys: Vec<ExtentKey>,
}

/// Metadata service fake: extent lists and directory listings in maps.
#[derive(Default)]
pub struct MemMetaStore {
    files: Mutex<HashMap<u64, FileMeta>>,
    dirs: Mutex<HashMap<u64, Vec<Dentry>>>,
    pub evictions: AtomicUsize,
    pub inserts: AtomicUsize,
    pub merges: AtomicUsize,
}

impl MemMetaStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed_file(&self, inode: u64, size: u64, keys: Vec<ExtentKey>) {
        self.files.lock().unwrap().insert(
            inode,
            FileMeta {
                size,
                generation: 1,
                keys,
            },
        );
    }

    pub fn file(&self, inode: u64) -> FileMeta {
        self.files.lock().unwrap().get(&inode).cloned().unwrap_or_default()
    }

    pub fn set_dir(&self, parent: u64, entries: Vec<Dentry>) {
        self.dirs.lock().unwrap().insert(parent, entries);
    }
}

#[async_trait]
impl MetaStore for MemMetaStore {
    async fn insert_extent_key(
        &self,
        inode: u64,
        key: ExtentKey,
        _is_pre_extent: bool,
    ) -> extentfs_meta::Result<()> {
        self.inserts.fetch_add(1, Ordering::Relaxed);
        let mut files = self.files.lock().unwrap();
        let file = files.entry(inode).or_default();
        file.keys.retain(|old| {
            !(old.file_offset >= key.file_offset && old.file_end() <= key.file_end())
        });
        file.keys.push(key);
        file.keys.sort_by_key(|k| k.file_offset);
        file.size = file.size.max(key.file_end());
        file.generation += 1;
        Ok(())
    }

    async fn get_extents(&self, inode: u64) -> extentfs_meta::Result<ExtentSnapshot> {
        let mut files = self.files.lock().unwrap();
        let file = files.entry(inode).or_default();
        Ok(ExtentSnapshot {
            size: file.size,
            generation: file.generation,
            keys: file.keys.clone(),
        })
    }

    async fn truncate(
        &self,
        inode: u64,
        old_size: u64,
        new_size: u64,
    ) -> extentfs_meta::Result<()> {
        let mut files = self.files.lock().unwrap();
        let file = files
            .get_mut(&inode)
            .ok_or(MetaError::InodeNotFound(inode))?;
        if file.size != old_size {
            return Err(MetaError::Conflict(format!(
                "truncate inode {}: stale size {} (server {})",
                inode, old_size, file.size
            )));
        }
        file.keys.retain(|k| k.file_offset < new_size);
        file.size = new_size;
        file.generation += 1;
        Ok(())
    }

    async fn evict_inode_cache(&self, _inode: u64) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    async fn merge_extents(
        &self,
        inode: u64,
        old: &[ExtentKey],
        new: &[ExtentKey],
    ) -> extentfs_meta::Result<()> {
        self.merges.fetch_add(1, Ordering::Relaxed);
        let mut files = self.files.lock().unwrap();
        let file = files
            .get_mut(&inode)
            .ok_or(MetaError::InodeNotFound(inode))?;
        for gone in old {
            file.keys.retain(|k| k != gone);
        }
        file.keys.extend_from_slice(new);
        file.keys.sort_by_key(|k| k.file_offset);
        file.generation += 1;
        Ok(())
    }

    async fn read_dir(&self, parent: u64) -> extentfs_meta::Result<Vec<Dentry>> {
        Ok(self
            .dirs
            .lock()
            .unwrap()
            .get(&parent)
            .cloned()
            .unwrap_or_default())
    }
}

/// Master + data plane in one fake: partition list, extent storage,
/// per-partition failure injection.
pub struct MemCluster {
    partitions: Mutex<Vec<PartitionInfo>>,
    extents: Mutex<HashMap<(u64, u64), Vec<u8>>>,
    next_extent_id: AtomicU64,
    failed: Mutex<HashSet<u64>>,
    limits: Mutex<LimitInfo>,
    vol_missing: AtomicBool,
    pub shutdown_called: AtomicBool,
    pub tiny_creates: AtomicUsize,
}

impl MemCluster {
    pub fn new(partition_count: u64) -> Arc<Self> {
        let partitions = (1..=partition_count)
            .map(|id| PartitionInfo {
                partition_id: id,
                hosts: vec![format!("dn{}-a:17030", id), format!("dn{}-b:17030", id)],
                leader: format!("dn{}-a:17030", id),
                near_hosts: vec![format!("dn{}-b:17030", id)],
                writable: true,
            })
            .collect();
        Arc::new(Self {
            partitions: Mutex::new(partitions),
            extents: Mutex::new(HashMap::new()),
            next_extent_id: AtomicU64::new(1),
            failed: Mutex::new(HashSet::new()),
            limits: Mutex::new(LimitInfo::default()),
            vol_missing: AtomicBool::new(false),
            shutdown_called: AtomicBool::new(false),
            tiny_creates: AtomicUsize::new(0),
        })
    }

    pub fn fail_partition(&self, id: u64) {
        self.failed.lock().unwrap().insert(id);
    }

    pub fn heal_partition(&self, id: u64) {
        self.failed.lock().unwrap().remove(&id);
    }

    pub fn set_vol_missing(&self, missing: bool) {
        self.vol_missing.store(missing, Ordering::Relaxed);
    }

    pub fn set_limits(&self, limits: LimitInfo) {
        *self.limits.lock().unwrap() = limits;
    }

    /// Pre-populate an extent, keeping the id allocator ahead of it.
    pub fn seed_extent(&self, partition_id: u64, extent_id: u64, data: Vec<u8>) {
        self.next_extent_id
            .fetch_max(extent_id + 1, Ordering::Relaxed);
        self.extents
            .lock()
            .unwrap()
            .insert((partition_id, extent_id), data);
    }

    pub fn remove_extent(&self, partition_id: u64, extent_id: u64) {
        self.extents
            .lock()
            .unwrap()
            .remove(&(partition_id, extent_id));
    }

    pub fn extent_data(&self, partition_id: u64, extent_id: u64) -> Option<Vec<u8>> {
        self.extents
            .lock()
            .unwrap()
            .get(&(partition_id, extent_id))
            .cloned()
    }

    pub fn extent_count(&self) -> usize {
        self.extents.lock().unwrap().len()
    }
}

#[async_trait]
impl MasterClient for MemCluster {
    async fn get_limit_info(&self, _volume: &str) -> extentfs_meta::Result<LimitInfo> {
        Ok(self.limits.lock().unwrap().clone())
    }

    async fn get_data_partitions(
        &self,
        volume: &str,
    ) -> extentfs_meta::Result<Vec<PartitionInfo>> {
        if self.vol_missing.load(Ordering::Relaxed) {
            return Err(MetaError::VolNotFound(volume.to_string()));
        }
        Ok(self.partitions.lock().unwrap().clone())
    }
}

#[async_trait]
impl extentfs_client::ExtentTransport for MemCluster {
    async fn create_extent(
        &self,
        partition: &DataPartition,
        _inode: u64,
        tiny: bool,
    ) -> Result<u64, TransportError> {
        if self.failed.lock().unwrap().contains(&partition.partition_id) {
            return Err(TransportError::PartitionUnavailable(partition.partition_id));
        }
        if tiny {
            self.tiny_creates.fetch_add(1, Ordering::Relaxed);
        }
        let id = self.next_extent_id.fetch_add(1, Ordering::Relaxed);
        self.extents
            .lock()
            .unwrap()
            .insert((partition.partition_id, id), Vec::new());
        Ok(id)
    }

    async fn write_extent(
        &self,
        partition: &DataPartition,
        extent_id: u64,
        extent_offset: u64,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        if self.failed.lock().unwrap().contains(&partition.partition_id) {
            return Err(TransportError::PartitionUnavailable(partition.partition_id));
        }
        let mut extents = self.extents.lock().unwrap();
        let extent = extents
            .get_mut(&(partition.partition_id, extent_id))
            .ok_or(TransportError::ExtentNotFound {
                partition_id: partition.partition_id,
                extent_id,
            })?;
        let end = extent_offset as usize + data.len();
        if extent.len() < end {
            extent.resize(end, 0);
        }
        extent[extent_offset as usize..end].copy_from_slice(data);
        Ok(data.len())
    }

    async fn read_extent(
        &self,
        partition: &DataPartition,
        _host: &str,
        extent_id: u64,
        extent_offset: u64,
        size: usize,
    ) -> Result<Bytes, TransportError> {
        if self.failed.lock().unwrap().contains(&partition.partition_id) {
            return Err(TransportError::PartitionUnavailable(partition.partition_id));
        }
        let extents = self.extents.lock().unwrap();
        let extent = extents
            .get(&(partition.partition_id, extent_id))
            .ok_or(TransportError::ExtentNotFound {
                partition_id: partition.partition_id,
                extent_id,
            })?;
        let start = (extent_offset as usize).min(extent.len());
        let end = (start + size).min(extent.len());
        Ok(Bytes::copy_from_slice(&extent[start..end]))
    }

    async fn shutdown(&self) {
        self.shutdown_called.store(true, Ordering::Relaxed);
    }
}

/// Config wired to the fakes, with fast mount retries for tests.
pub fn test_config(meta: &Arc<MemMetaStore>, cluster: &Arc<MemCluster>) -> ExtentConfig {
    let mut config = ExtentConfig::new(
        "vol-test",
        vec!["master-1:17010".to_string()],
        Arc::clone(meta) as Arc<dyn MetaStore>,
        Arc::clone(cluster) as Arc<dyn MasterClient>,
        Arc::clone(cluster) as Arc<dyn extentfs_client::ExtentTransport>,
    );
    config.mount_retry_interval = std::time::Duration::from_millis(10);
    config
}

pub fn key(partition: u64, extent: u64, file_offset: u64, size: u32) -> ExtentKey {
    ExtentKey {
        partition_id: partition,
        extent_id: extent,
        extent_offset: 0,
        file_offset,
        size,
    }
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
