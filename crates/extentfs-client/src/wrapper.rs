//! Data-Partition Wrapper
//!
//! The wrapper owns the client's view of the data plane: the pool of
//! partition snapshots pulled from the master, the routing policy for
//! new-extent placement and for reads (follower read, near read), health
//! penalties for partitions that failed recently, and the retry budget
//! for transient transport errors.
//!
//! ## Routing
//!
//! - **Writes** go to the leader of a writable partition chosen round
//!   robin, skipping excluded and penalized partitions.
//! - **Reads** go to the leader unless follower read is on; with near
//!   read, topologically-near replicas are preferred when known.
//!
//! ## Health
//!
//! A partition whose write or read failed terminally is penalized for
//! [`UNHEALTHY_PENALTY`]; the round-robin pick skips it until the penalty
//! expires. References handed out are read-only `Arc` snapshots.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use extentfs_meta::{MasterClient, MetaError, PartitionInfo};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::transport::{ExtentTransport, TransportError};

/// How long a failed partition is skipped by the write pick.
pub const UNHEALTHY_PENALTY: Duration = Duration::from_secs(60);

/// Read-only snapshot of a data partition.
#[derive(Debug, Clone)]
pub struct DataPartition {
    pub partition_id: u64,
    pub hosts: Vec<String>,
    pub leader: String,
    pub near_hosts: Vec<String>,
    pub writable: bool,
}

impl From<PartitionInfo> for DataPartition {
    fn from(info: PartitionInfo) -> Self {
        Self {
            partition_id: info.partition_id,
            hosts: info.hosts,
            leader: info.leader,
            near_hosts: info.near_hosts,
            writable: info.writable,
        }
    }
}

/// Exponential backoff with jitter for transient transport errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Backoff for the given attempt, jittered ±25% to avoid thundering
    /// herd on partition recovery.
    fn backoff(&self, attempt: usize) -> Duration {
        let base = self.initial_backoff.as_millis() as f64 * 2f64.powi(attempt as i32);
        let jitter = 0.75 + rand::random::<f64>() * 0.5;
        Duration::from_millis((base * jitter) as u64).min(self.max_backoff)
    }
}

/// Pool of partition handles plus routing and health state.
pub struct PartitionWrapper {
    volume: String,
    master: Arc<dyn MasterClient>,
    transport: Arc<dyn ExtentTransport>,

    partitions: RwLock<HashMap<u64, Arc<DataPartition>>>,
    /// Ids of writable partitions, in round-robin order.
    write_order: RwLock<Vec<u64>>,
    write_counter: AtomicUsize,
    read_counter: AtomicUsize,

    vol_not_exists: AtomicBool,
    follower_read: AtomicBool,
    near_read: AtomicBool,

    /// Partition id → penalty expiry.
    unhealthy: Mutex<HashMap<u64, Instant>>,
    retry: RetryPolicy,
}

impl PartitionWrapper {
    /// Build the wrapper and perform the initial partition fetch. The
    /// engine retries this whole constructor on mount.
    pub async fn new(
        volume: impl Into<String>,
        master: Arc<dyn MasterClient>,
        transport: Arc<dyn ExtentTransport>,
        follower_read: bool,
        near_read: bool,
    ) -> Result<Self> {
        let wrapper = Self {
            volume: volume.into(),
            master,
            transport,
            partitions: RwLock::new(HashMap::new()),
            write_order: RwLock::new(Vec::new()),
            write_counter: AtomicUsize::new(0),
            read_counter: AtomicUsize::new(0),
            vol_not_exists: AtomicBool::new(false),
            follower_read: AtomicBool::new(follower_read),
            near_read: AtomicBool::new(near_read),
            unhealthy: Mutex::new(HashMap::new()),
            retry: RetryPolicy::default(),
        };
        wrapper.refresh().await?;
        Ok(wrapper)
    }

    pub fn volume(&self) -> &str {
        &self.volume
    }

    /// Re-pull the partition map from the master. Latches the
    /// volume-missing state when the master reports it.
    pub async fn refresh(&self) -> Result<()> {
        match self.master.get_data_partitions(&self.volume).await {
            Ok(infos) => {
                let mut map = HashMap::with_capacity(infos.len());
                let mut order = Vec::new();
                for info in infos {
                    let dp: DataPartition = info.into();
                    if dp.writable {
                        order.push(dp.partition_id);
                    }
                    map.insert(dp.partition_id, Arc::new(dp));
                }
                let count = map.len();
                *self.partitions.write().await = map;
                *self.write_order.write().await = order;
                self.vol_not_exists.store(false, Ordering::Release);
                debug!(volume = %self.volume, partitions = count, "partition map refreshed");
                Ok(())
            }
            Err(MetaError::VolNotFound(vol)) => {
                warn!(volume = %vol, "volume gone, failing mutating operations");
                self.vol_not_exists.store(true, Ordering::Release);
                Err(MetaError::VolNotFound(vol).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn vol_not_exists(&self) -> bool {
        self.vol_not_exists.load(Ordering::Acquire)
    }

    pub fn follower_read(&self) -> bool {
        self.follower_read.load(Ordering::Relaxed)
    }

    pub fn set_follower_read(&self, enabled: bool) {
        self.follower_read.store(enabled, Ordering::Relaxed);
    }

    pub fn set_near_read(&self, enabled: bool) {
        self.near_read.store(enabled, Ordering::Relaxed);
    }

    pub async fn partition(&self, partition_id: u64) -> Option<Arc<DataPartition>> {
        self.partitions.read().await.get(&partition_id).cloned()
    }

    pub async fn partition_count(&self) -> usize {
        self.partitions.read().await.len()
    }

    /// Round-robin pick of a healthy, writable partition for a new
    /// extent, skipping `exclude` (used by row-on-write to avoid the
    /// partition that just failed).
    pub async fn pick_write_partition(
        &self,
        exclude: &HashSet<u64>,
    ) -> Result<Arc<DataPartition>> {
        let order = self.write_order.read().await;
        if order.is_empty() {
            return Err(ClientError::NoWritablePartition);
        }

        let now = Instant::now();
        let mut unhealthy = self.unhealthy.lock().await;
        unhealthy.retain(|_, until| *until > now);

        let partitions = self.partitions.read().await;
        let start = self.write_counter.fetch_add(1, Ordering::Relaxed);
        for i in 0..order.len() {
            let id = order[(start + i) % order.len()];
            if exclude.contains(&id) || unhealthy.contains_key(&id) {
                continue;
            }
            if let Some(dp) = partitions.get(&id) {
                return Ok(Arc::clone(dp));
            }
        }
        Err(ClientError::NoWritablePartition)
    }

    /// Penalize a partition after a terminal failure.
    pub async fn report_failure(&self, partition_id: u64) {
        warn!(partition = partition_id, "penalizing data partition");
        self.unhealthy
            .lock()
            .await
            .insert(partition_id, Instant::now() + UNHEALTHY_PENALTY);
    }

    /// Pick the replica endpoint for a read per the routing policy.
    pub fn pick_read_host(&self, dp: &DataPartition) -> String {
        if !self.follower_read.load(Ordering::Relaxed) {
            return dp.leader.clone();
        }
        let hosts = if self.near_read.load(Ordering::Relaxed) && !dp.near_hosts.is_empty() {
            &dp.near_hosts
        } else {
            &dp.hosts
        };
        if hosts.is_empty() {
            return dp.leader.clone();
        }
        let i = self.read_counter.fetch_add(1, Ordering::Relaxed) % hosts.len();
        hosts[i].clone()
    }

    /// Allocate a new extent on `dp`, retrying transient failures.
    pub async fn create_extent(
        &self,
        dp: &DataPartition,
        inode: u64,
        tiny: bool,
    ) -> Result<u64> {
        self.with_retry(dp.partition_id, || {
            self.transport.create_extent(dp, inode, tiny)
        })
        .await
    }

    /// Write to an extent via the partition leader, retrying transient
    /// failures up to the budget.
    pub async fn write_to_extent(
        &self,
        partition_id: u64,
        extent_id: u64,
        extent_offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        let dp = self.require_partition(partition_id).await?;
        self.with_retry(partition_id, || {
            self.transport.write_extent(&dp, extent_id, extent_offset, data)
        })
        .await
    }

    /// Read from an extent, re-picking the read host on every attempt.
    pub async fn read_from_extent(
        &self,
        partition_id: u64,
        extent_id: u64,
        extent_offset: u64,
        size: usize,
    ) -> Result<Bytes> {
        let dp = self.require_partition(partition_id).await?;
        self.with_retry(partition_id, || {
            let host = self.pick_read_host(&dp);
            let dp = Arc::clone(&dp);
            let transport = Arc::clone(&self.transport);
            async move {
                transport
                    .read_extent(&dp, &host, extent_id, extent_offset, size)
                    .await
            }
        })
        .await
    }

    async fn require_partition(&self, partition_id: u64) -> Result<Arc<DataPartition>> {
        match self.partition(partition_id).await {
            Some(dp) => Ok(dp),
            None => Err(TransportError::PartitionUnavailable(partition_id).into()),
        }
    }

    async fn with_retry<T, F, Fut>(&self, partition_id: u64, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, TransportError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        partition = partition_id,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient transport error, backing off"
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        self.report_failure(partition_id).await;
                    }
                    return Err(e.into());
                }
            }
        }
    }
}
