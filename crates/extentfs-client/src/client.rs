//! Engine Façade
//!
//! `ExtentClient` is the public face of the engine. It owns the shared
//! resources (partition wrapper, rate limiter, collaborator handles), the
//! sharded streamer registry, and two background tasks:
//!
//! - the **config refresher**, pulling tenant limits, merge targets and
//!   the partition map from the master once a minute. The loop is
//!   supervised: a panic is reported to the `extentfs::alarm` tracing
//!   target and the loop restarts.
//! - the **background merger**, woken by the refresher whenever the
//!   master publishes a non-empty merge target list.
//!
//! Every per-inode operation resolves the inode to its streamer and
//! suspends on a oneshot reply; the streamer worker does the actual
//! work. See the `streamer` module for the ordering contract.
//!
//! ## Construction
//!
//! The partition wrapper is built first, with a bounded mount retry loop
//! (`mount_retry_limit` attempts, `mount_retry_interval` apart);
//! exhaustion surfaces `InitWrapperFailed`.
//!
//! ## Shutdown
//!
//! `close()` flips the stop signal, joins the background tasks, then
//! walks a snapshot of the registry doing Flush → MustClose → Evict per
//! inode. The transport (and its connection pool) is shut down last.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::RwLock as StdRwLock;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use extentfs_core::{
    coerce_align_size, coerce_extent_size, coerce_tiny_size, ExtentKey, ROOT_INODE,
};
use extentfs_meta::{InodeKind, MasterClient, MetaStore};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ExtentConfig;
use crate::error::{ClientError, Result};
use crate::limiter::{FlowKind, FlowLimiter};
use crate::registry::StreamerRegistry;
use crate::streamer::{self, Request};
use crate::transport::ExtentTransport;
use crate::wrapper::{DataPartition, PartitionWrapper};

/// Resources shared by the façade and every streamer worker.
pub(crate) struct EngineShared {
    pub volume: String,
    pub meta: Arc<dyn MetaStore>,
    pub wrapper: Arc<PartitionWrapper>,
    pub limiter: Arc<FlowLimiter>,
    pub extent_size: u64,
    pub tiny_size: u64,
    pub align_size: u64,
    pub max_extent_num_per_align_area: usize,
    pub force_align_merge: bool,
    pub auto_flush: bool,
    pub request_timeout: Option<Duration>,
    pub extent_cache_ttl: Duration,
}

/// Constructor-provided rates, the fallback when the master publishes no
/// limit. Updated by `set_read_rate` / `set_write_rate`.
struct RateSettings {
    origin_read: AtomicI64,
    origin_write: AtomicI64,
}

/// Merge targets as last published by the master.
#[derive(Default)]
struct MergeTargets {
    inodes: StdRwLock<Vec<u64>>,
    sleep_ms: AtomicU64,
}

/// Client-side extent engine for one volume.
pub struct ExtentClient {
    shared: Arc<EngineShared>,
    registry: Arc<StreamerRegistry>,
    rates: Arc<RateSettings>,
    transport: Arc<dyn ExtentTransport>,
    stop: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    merge_targets: Arc<MergeTargets>,
    closed: AtomicBool,
}

impl ExtentClient {
    /// Build the engine: mount the partition wrapper (with retries),
    /// start the background tasks, and hand back the shared client.
    pub async fn new(config: ExtentConfig) -> Result<Arc<Self>> {
        let extent_size = coerce_extent_size(config.extent_size);
        let align_size = coerce_align_size(config.align_size);
        let tiny_size = coerce_tiny_size(config.tiny_size);
        let retry_limit = config.mount_retry_limit.max(1);

        let mut wrapper = None;
        for attempt in 1..=retry_limit {
            match PartitionWrapper::new(
                config.volume.clone(),
                Arc::clone(&config.master),
                Arc::clone(&config.transport),
                config.follower_read,
                config.near_read,
            )
            .await
            {
                Ok(w) => {
                    wrapper = Some(Arc::new(w));
                    break;
                }
                Err(e) => {
                    warn!(
                        volume = %config.volume,
                        attempt,
                        error = %e,
                        "data wrapper init failed"
                    );
                    if attempt < retry_limit {
                        sleep(config.mount_retry_interval).await;
                    }
                }
            }
        }
        let wrapper = match wrapper {
            Some(wrapper) => wrapper,
            None => return Err(ClientError::InitWrapperFailed(retry_limit)),
        };

        let limiter = Arc::new(FlowLimiter::new(config.read_rate, config.write_rate));
        let shared = Arc::new(EngineShared {
            volume: config.volume.clone(),
            meta: Arc::clone(&config.meta_store),
            wrapper,
            limiter,
            extent_size,
            tiny_size,
            align_size,
            max_extent_num_per_align_area: config.max_extent_num_per_align_area,
            force_align_merge: config.force_align_merge,
            auto_flush: config.auto_flush,
            request_timeout: config.request_timeout,
            extent_cache_ttl: config.extent_cache_ttl,
        });
        let rates = Arc::new(RateSettings {
            origin_read: AtomicI64::new(config.read_rate),
            origin_write: AtomicI64::new(config.write_rate),
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let merge_targets = Arc::new(MergeTargets::default());
        let (merge_signal, merge_rx) = if config.extent_merge {
            let (tx, rx) = mpsc::channel(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let client = Arc::new(Self {
            shared: Arc::clone(&shared),
            registry: Arc::new(StreamerRegistry::new()),
            rates: Arc::clone(&rates),
            transport: Arc::clone(&config.transport),
            stop: stop_tx,
            tasks: StdMutex::new(Vec::new()),
            merge_targets: Arc::clone(&merge_targets),
            closed: AtomicBool::new(false),
        });

        let refresher = spawn_config_refresher(
            shared,
            Arc::clone(&config.master),
            rates,
            merge_signal.map(|signal| (signal, Arc::clone(&merge_targets))),
            config.update_interval,
            stop_rx.clone(),
        );
        client.tasks.lock().unwrap().push(refresher);

        if let Some(merge_rx) = merge_rx {
            let merger = spawn_merger(Arc::clone(&client), merge_rx, stop_rx);
            client.tasks.lock().unwrap().push(merger);
        }

        info!(
            volume = %config.volume,
            masters = ?config.masters,
            extent_size,
            tiny_size,
            align_size,
            "extent client ready"
        );
        Ok(client)
    }

    /// Open a stream on `inode`, creating the streamer if absent.
    ///
    /// The registry shard lock is held from the lookup until the Open
    /// request is queued, so two racing opens always land on the same
    /// streamer. A terminal streamer still present in the shard is
    /// replaced and the open retried.
    pub async fn open_stream(
        &self,
        inode: u64,
        append_write_buffer: bool,
        read_ahead: bool,
    ) -> Result<()> {
        loop {
            let pending = {
                let shard = self.registry.shard(inode);
                let mut guard = shard.write().await;
                let handle = match guard.get(&inode) {
                    Some(handle) => Arc::clone(handle),
                    None => {
                        let handle = streamer::spawn(
                            Arc::clone(&self.shared),
                            Arc::clone(&self.registry),
                            inode,
                            append_write_buffer,
                            read_ahead,
                        );
                        guard.insert(inode, Arc::clone(&handle));
                        handle
                    }
                };
                let (reply, rx) = oneshot::channel();
                match handle.tx.send(Request::Open { reply }).await {
                    Ok(()) => Some(rx),
                    Err(_) => {
                        // The worker went terminal before the send; drop
                        // the stale entry and start over.
                        if let Some(current) = guard.get(&inode) {
                            if Arc::ptr_eq(current, &handle) {
                                guard.remove(&inode);
                            }
                        }
                        None
                    }
                }
            };
            match pending {
                Some(rx) => match rx.await {
                    Ok(result) => return result,
                    Err(_) => continue,
                },
                None => continue,
            }
        }
    }

    /// Graceful release of one handle; the last release drains buffers.
    pub async fn close_stream(&self, inode: u64) -> Result<()> {
        match self.issue(inode, |reply| Request::Release { must: false, reply }).await {
            Err(ClientError::StreamNotOpen(_)) => Ok(()),
            other => other,
        }
    }

    /// Release even if the final flush fails.
    pub async fn must_close_stream(&self, inode: u64) -> Result<()> {
        match self.issue(inode, |reply| Request::Release { must: true, reply }).await {
            Err(ClientError::StreamNotOpen(_)) => Ok(()),
            other => other,
        }
    }

    /// Terminate the streamer, wait for its worker to exit and its
    /// registry entry to be gone.
    pub async fn evict_stream(&self, inode: u64) -> Result<()> {
        let handle = match self.registry.get(inode).await {
            Some(handle) => handle,
            None => return Ok(()),
        };
        let (reply, rx) = oneshot::channel();
        if handle.tx.send(Request::Evict { reply }).await.is_ok() {
            let _ = rx.await;
        }
        let worker = handle.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        Ok(())
    }

    /// Write `data` at `offset`.
    ///
    /// Returns `(written, row_happened)`. With `overwrite_buffer` set and
    /// the whole range lying inside existing extents, the data is
    /// buffered on the streamer and written out on the next flush.
    pub async fn write(
        &self,
        inode: u64,
        offset: u64,
        data: &[u8],
        direct: bool,
        overwrite_buffer: bool,
    ) -> Result<(usize, bool)> {
        self.check_vol()?;
        if data.is_empty() {
            return Ok((0, false));
        }
        let data = Bytes::copy_from_slice(data);
        let outcome = self
            .issue(inode, move |reply| Request::Write {
                offset,
                data,
                direct,
                overwrite_buffer,
                reply,
            })
            .await?;
        Ok((outcome.written, outcome.row_happened))
    }

    /// Allocate a fresh extent and write synchronously. The returned key
    /// is NOT inserted into the extent cache; the caller owns that.
    pub async fn sync_write(
        &self,
        inode: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<(Arc<DataPartition>, usize, ExtentKey)> {
        self.check_vol()?;
        if self.registry.get(inode).await.is_none() {
            return Err(ClientError::StreamNotOpen(inode));
        }
        let deadline = self.deadline();
        self.shared
            .limiter
            .wait(FlowKind::Write, data.len() as u64, deadline)
            .await?;
        let data = Bytes::copy_from_slice(data);
        let key = streamer::alloc_and_write(
            &self.shared,
            inode,
            offset,
            &data,
            false,
            &HashSet::new(),
        )
        .await?;
        let dp = self
            .shared
            .wrapper
            .partition(key.partition_id)
            .await
            .ok_or(ClientError::NoWritablePartition)?;
        Ok((dp, key.size as usize, key))
    }

    /// Append to a pre-chosen extent on a pre-chosen partition.
    pub async fn sync_write_to_specific_extent(
        &self,
        dp: &DataPartition,
        inode: u64,
        _file_offset: u64,
        extent_offset: u64,
        data: &[u8],
        extent_id: u64,
    ) -> Result<usize> {
        self.check_vol()?;
        if self.registry.get(inode).await.is_none() {
            return Err(ClientError::StreamNotOpen(inode));
        }
        let deadline = self.deadline();
        self.shared
            .limiter
            .wait(FlowKind::Write, data.len() as u64, deadline)
            .await?;
        let written = self
            .shared
            .wrapper
            .write_to_extent(dp.partition_id, extent_id, extent_offset, data)
            .await?;
        Ok(written)
    }

    /// Read up to `size` bytes at `offset` into `buf`.
    ///
    /// Returns `(read, has_hole)`; holes read as zeros. Reads past the
    /// end of the file return fewer bytes than requested.
    pub async fn read(
        &self,
        inode: u64,
        buf: &mut [u8],
        offset: u64,
        size: usize,
    ) -> Result<(usize, bool)> {
        if size == 0 {
            return Ok((0, false));
        }
        self.check_vol()?;
        if buf.len() < size {
            return Err(ClientError::InvalidArgument(format!(
                "read buffer {} smaller than requested size {}",
                buf.len(),
                size
            )));
        }
        let (data, has_hole) = self
            .issue(inode, move |reply| Request::Read { offset, size, reply })
            .await?;
        buf[..data.len()].copy_from_slice(&data);
        Ok((data.len(), has_hole))
    }

    /// Truncate the file to `size`.
    pub async fn truncate(&self, inode: u64, size: u64) -> Result<()> {
        self.check_vol()?;
        self.issue(inode, move |reply| Request::Truncate { size, reply })
            .await
    }

    /// Drain the streamer's buffers and fence outstanding appends.
    pub async fn flush(&self, inode: u64) -> Result<()> {
        self.check_vol()?;
        self.issue(inode, |reply| Request::Flush { reply }).await
    }

    /// Force a full refetch of the extent list on an open stream.
    pub async fn refresh_extents_cache(&self, inode: u64) -> Result<()> {
        self.issue(inode, |reply| Request::RefreshExtents { reply })
            .await
    }

    /// One idempotent merge step; `Ok(true)` means nothing left to
    /// merge.
    pub async fn extent_merge(&self, inode: u64) -> Result<bool> {
        self.issue(inode, |reply| Request::ExtentMerge { reply }).await
    }

    /// File size and cache generation as maintained by the worker.
    /// `valid` is false when the inode has no streamer.
    pub async fn file_size(&self, inode: u64) -> (u64, u64, bool) {
        match self.registry.get(inode).await {
            None => (0, 0, false),
            Some(handle) => (
                handle.stat.size.load(Ordering::Acquire),
                handle.stat.generation.load(Ordering::Acquire),
                true,
            ),
        }
    }

    /// Number of live streamers (monitoring).
    pub async fn streamer_count(&self) -> usize {
        self.registry.len().await
    }

    /// Two-line rate summary: `read: …\nwrite: …\n`.
    pub async fn get_rate(&self) -> String {
        self.shared.limiter.describe().await
    }

    /// Apply a read limit (≤ 0 = unlimited); returns the applied value.
    pub async fn set_read_rate(&self, rate: i64) -> String {
        self.rates.origin_read.store(rate, Ordering::Relaxed);
        self.shared.limiter.set_limit(FlowKind::Read, rate).await
    }

    /// Apply a write limit (≤ 0 = unlimited); returns the applied value.
    pub async fn set_write_rate(&self, rate: i64) -> String {
        self.rates.origin_write.store(rate, Ordering::Relaxed);
        self.shared.limiter.set_limit(FlowKind::Write, rate).await
    }

    /// Stop background tasks, drain every streamer (Flush → MustClose →
    /// Evict), then shut the transport down. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(volume = %self.shared.volume, "closing extent client");
        let _ = self.stop.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        for inode in self.registry.keys().await {
            let _ = self.flush(inode).await;
            let _ = self.must_close_stream(inode).await;
            let _ = self.evict_stream(inode).await;
        }

        self.transport.shutdown().await;
        Ok(())
    }

    fn check_vol(&self) -> Result<()> {
        if self.shared.wrapper.vol_not_exists() {
            return Err(ClientError::VolNotExists(self.shared.volume.clone()));
        }
        Ok(())
    }

    fn deadline(&self) -> Option<Instant> {
        self.shared.request_timeout.map(|t| Instant::now() + t)
    }

    /// Queue a request on the inode's streamer and await the reply.
    async fn issue<T>(
        &self,
        inode: u64,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Request,
    ) -> Result<T> {
        let handle = self
            .registry
            .get(inode)
            .await
            .ok_or(ClientError::StreamNotOpen(inode))?;
        let (reply, rx) = oneshot::channel();
        handle
            .tx
            .send(make(reply))
            .await
            .map_err(|_| ClientError::Closed)?;
        rx.await.unwrap_or(Err(ClientError::Closed))
    }

    /// Run one merger round over the published targets.
    async fn run_merge_round(&self, stop: &mut watch::Receiver<bool>) {
        let mut inodes = self.merge_targets.inodes.read().unwrap().clone();
        if inodes.len() == 1 && inodes[0] == 0 {
            inodes = self.collect_regular_inodes().await;
        }
        let sleep_ms = self.merge_targets.sleep_ms.load(Ordering::Relaxed);
        info!(count = inodes.len(), "extent merge round started");

        for inode in inodes {
            if *stop.borrow() {
                return;
            }
            // Transient stream: no buffers, no read-ahead.
            if let Err(e) = self.open_stream(inode, false, false).await {
                warn!(inode, error = %e, "merge open failed");
                continue;
            }
            let interrupted = self.merge_inode(inode, sleep_ms, stop).await;
            let _ = self.close_stream(inode).await;
            let _ = self.evict_stream(inode).await;
            if interrupted {
                return;
            }
        }
    }

    /// Step the merge until done; returns true when interrupted by stop.
    async fn merge_inode(
        &self,
        inode: u64,
        sleep_ms: u64,
        stop: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            match self.extent_merge(inode).await {
                Ok(true) => return false,
                Ok(false) => {
                    tokio::select! {
                        changed = stop.changed() => {
                            if changed.is_err() || *stop.borrow() {
                                return true;
                            }
                        }
                        _ = sleep(Duration::from_millis(sleep_ms)) => {}
                    }
                }
                Err(e) => {
                    warn!(inode, error = %e, "extent merge step failed");
                    return false;
                }
            }
        }
    }

    /// Walk the directory tree from the root, collecting regular files.
    async fn collect_regular_inodes(&self) -> Vec<u64> {
        let mut stack = vec![ROOT_INODE];
        let mut inodes = Vec::new();
        while let Some(dir) = stack.pop() {
            match self.shared.meta.read_dir(dir).await {
                Ok(entries) => {
                    for entry in entries {
                        match entry.kind {
                            InodeKind::Regular => inodes.push(entry.inode),
                            InodeKind::Directory => stack.push(entry.inode),
                            InodeKind::Other => {}
                        }
                    }
                }
                Err(e) => warn!(dir, error = %e, "merge tree walk read_dir failed"),
            }
        }
        inodes
    }
}

fn spawn_config_refresher(
    shared: Arc<EngineShared>,
    master: Arc<dyn MasterClient>,
    rates: Arc<RateSettings>,
    merge: Option<(mpsc::Sender<()>, Arc<MergeTargets>)>,
    tick: Duration,
    stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let run = refresh_loop(
                Arc::clone(&shared),
                Arc::clone(&master),
                Arc::clone(&rates),
                merge.clone(),
                tick,
                stop.clone(),
            );
            match AssertUnwindSafe(run).catch_unwind().await {
                Ok(()) => break,
                Err(_) => {
                    error!(
                        target: "extentfs::alarm",
                        volume = %shared.volume,
                        task = "config_refresher",
                        "background task panicked, restarting"
                    );
                }
            }
        }
    })
}

async fn refresh_loop(
    shared: Arc<EngineShared>,
    master: Arc<dyn MasterClient>,
    rates: Arc<RateSettings>,
    merge: Option<(mpsc::Sender<()>, Arc<MergeTargets>)>,
    tick: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        if *stop.borrow() {
            return;
        }
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                update_config(&shared, &master, &rates, merge.as_ref()).await;
            }
        }
    }
}

async fn update_config(
    shared: &EngineShared,
    master: &Arc<dyn MasterClient>,
    rates: &RateSettings,
    merge: Option<&(mpsc::Sender<()>, Arc<MergeTargets>)>,
) {
    let info = match master.get_limit_info(&shared.volume).await {
        Ok(info) => info,
        Err(e) => {
            warn!(volume = %shared.volume, error = %e, "limit info fetch failed");
            return;
        }
    };

    let read = resolve_rate(
        &info.client_read_rate,
        &shared.volume,
        rates.origin_read.load(Ordering::Relaxed),
    );
    shared.limiter.set_limit(FlowKind::Read, read).await;
    let write = resolve_rate(
        &info.client_write_rate,
        &shared.volume,
        rates.origin_write.load(Ordering::Relaxed),
    );
    shared.limiter.set_limit(FlowKind::Write, write).await;
    debug!(volume = %shared.volume, read, write, "tenant rates applied");

    if let Some((signal, targets)) = merge {
        let published = info
            .extent_merge_inodes
            .get(&shared.volume)
            .cloned()
            .unwrap_or_default();
        let was_empty = targets.inodes.read().unwrap().is_empty();
        if was_empty && !published.is_empty() {
            let _ = signal.try_send(());
        }
        *targets.inodes.write().unwrap() = published;
        targets
            .sleep_ms
            .store(info.extent_merge_sleep_ms, Ordering::Relaxed);
    }

    if let Err(e) = shared.wrapper.refresh().await {
        warn!(volume = %shared.volume, error = %e, "partition map refresh failed");
    }
}

/// Master-published rate if non-zero, else the constructor rate if
/// positive, else unlimited.
fn resolve_rate(map: &HashMap<String, u64>, volume: &str, origin: i64) -> i64 {
    let published = map
        .get(volume)
        .copied()
        .or_else(|| map.get("").copied())
        .unwrap_or(0);
    if published > 0 {
        published as i64
    } else if origin > 0 {
        origin
    } else {
        0
    }
}

fn spawn_merger(
    client: Arc<ExtentClient>,
    mut signal: mpsc::Receiver<()>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *stop.borrow() {
                return;
            }
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return;
                    }
                }
                message = signal.recv() => {
                    if message.is_none() {
                        return;
                    }
                    let round = AssertUnwindSafe(client.run_merge_round(&mut stop));
                    if round.catch_unwind().await.is_err() {
                        error!(
                            target: "extentfs::alarm",
                            task = "extent_merger",
                            "background task panicked, resuming on next signal"
                        );
                    }
                }
            }
        }
    })
}
