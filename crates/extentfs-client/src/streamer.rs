//! Per-Inode Streamer
//!
//! Every open file gets exactly one streamer: a worker task consuming a
//! bounded request queue. All extent-cache and buffer mutation happens on
//! that worker, which is the concurrency contract that keeps the cache
//! free of interior locking and gives each inode strict read-your-writes
//! ordering.
//!
//! ```text
//!  callers ──► mpsc (bounded) ──► worker ──► extent cache
//!     ▲                             │        overwrite buffer
//!     └──────── oneshot reply ◄─────┘        append buffer
//!                                            partition wrapper / limiter
//! ```
//!
//! ## Lifecycle
//!
//! Fresh → Initialized (first use fetches the extent list once) →
//! Draining (release observed with zero handles, or evict) → Terminal.
//! Once terminal the worker drains whatever is still queued with
//! `Closed`, unregisters itself and exits. The façade never removes a
//! registry entry for a live worker.
//!
//! ## Buffers
//!
//! - The **overwrite buffer** holds in-place overwrites accepted with
//!   `overwrite_buffer = true`; they are written out on flush.
//! - The **append buffer** (per-stream opt-in) coalesces tail appends so
//!   a burst of small writes allocates one extent, not one per write.
//! - The **read-ahead buffer** (per-stream opt-in) keeps up to 128 KiB
//!   past the last sequential read within one extent.
//!
//! Any operation whose correctness depends on buffered bytes being
//! durable (read, truncate, merge, release) drains the buffers first.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use extentfs_core::ExtentKey;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::client::EngineShared;
use crate::error::{ClientError, Result};
use crate::extent_cache::{ExtentCache, ExtentRequest, ReadSpan};
use crate::limiter::FlowKind;
use crate::merge::{self, MergePolicy};
use crate::registry::StreamerRegistry;

/// Depth of the inbound request queue.
pub(crate) const REQUEST_QUEUE_DEPTH: usize = 1024;

/// The read path only retries on `ExtentNotFound` when the cache is at
/// least this stale; a fresh cache means the keys really are gone.
const RETRY_REFRESH_TTL: Duration = Duration::from_secs(1);

/// How far past a sequential read the worker prefetches.
const READ_AHEAD_SIZE: usize = 128 * 1024;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Result of a write as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub written: usize,
    /// Whether any overwrite was converted to row-on-write.
    pub row_happened: bool,
}

/// Typed requests consumed by the worker, each carrying its reply.
pub(crate) enum Request {
    Open {
        reply: Reply<()>,
    },
    Write {
        offset: u64,
        data: Bytes,
        direct: bool,
        overwrite_buffer: bool,
        reply: Reply<WriteOutcome>,
    },
    Read {
        offset: u64,
        size: usize,
        reply: Reply<(Bytes, bool)>,
    },
    Flush {
        reply: Reply<()>,
    },
    Truncate {
        size: u64,
        reply: Reply<()>,
    },
    Release {
        must: bool,
        reply: Reply<()>,
    },
    Evict {
        reply: Reply<()>,
    },
    ExtentMerge {
        reply: Reply<bool>,
    },
    RefreshExtents {
        reply: Reply<()>,
    },
}

/// Atomic mirror of the cache's (size, generation), maintained by the
/// worker so `file_size` never has to touch worker-owned state.
#[derive(Default)]
pub(crate) struct CacheStat {
    pub size: AtomicU64,
    pub generation: AtomicU64,
}

/// What the registry holds per inode.
pub(crate) struct StreamerHandle {
    pub tx: mpsc::Sender<Request>,
    pub stat: Arc<CacheStat>,
    pub worker: StdMutex<Option<JoinHandle<()>>>,
}

impl StreamerHandle {
    #[cfg(test)]
    pub(crate) fn detached() -> Arc<Self> {
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(Self {
            tx,
            stat: Arc::new(CacheStat::default()),
            worker: StdMutex::new(None),
        })
    }
}

/// Spawn the worker for `inode` and hand back its handle.
///
/// The caller (the façade) holds the registry shard lock across both this
/// call and the queueing of the initial Open request.
pub(crate) fn spawn(
    shared: Arc<EngineShared>,
    registry: Arc<StreamerRegistry>,
    inode: u64,
    append_write_buffer: bool,
    read_ahead: bool,
) -> Arc<StreamerHandle> {
    let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    let stat = Arc::new(CacheStat::default());
    let handle = Arc::new(StreamerHandle {
        tx,
        stat: Arc::clone(&stat),
        worker: StdMutex::new(None),
    });

    let streamer = Streamer {
        inode,
        shared,
        registry,
        handle: Arc::clone(&handle),
        cache: ExtentCache::new(inode),
        overwrite_buf: Vec::new(),
        append_buf: AppendBuffer::default(),
        read_ahead: None,
        append_write_buffer,
        read_ahead_enabled: read_ahead,
        refs: 0,
        fetch_attempted: false,
        stat,
    };
    let worker = tokio::spawn(streamer.run(rx));
    *handle.worker.lock().unwrap() = Some(worker);
    handle
}

#[derive(Default)]
struct AppendBuffer {
    base: u64,
    data: BytesMut,
}

impl AppendBuffer {
    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }
}

struct ReadAhead {
    file_offset: u64,
    data: Bytes,
}

struct Streamer {
    inode: u64,
    shared: Arc<EngineShared>,
    registry: Arc<StreamerRegistry>,
    handle: Arc<StreamerHandle>,
    cache: ExtentCache,
    overwrite_buf: Vec<ExtentRequest>,
    append_buf: AppendBuffer,
    read_ahead: Option<ReadAhead>,
    append_write_buffer: bool,
    read_ahead_enabled: bool,
    refs: usize,
    fetch_attempted: bool,
    stat: Arc<CacheStat>,
}

impl Streamer {
    async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        debug!(inode = self.inode, "streamer started");
        while let Some(request) = rx.recv().await {
            if self.handle_request(request).await {
                break;
            }
        }
        // Terminal: everything still queued is drained with Closed, then
        // the worker unregisters itself and exits.
        rx.close();
        while let Ok(request) = rx.try_recv() {
            reply_closed(request);
        }
        self.registry.remove_entry(self.inode, &self.handle).await;
        debug!(inode = self.inode, "streamer stopped");
    }

    /// Returns `true` when the worker should exit.
    async fn handle_request(&mut self, request: Request) -> bool {
        match request {
            Request::Open { reply } => {
                self.refs += 1;
                let _ = reply.send(Ok(()));
                false
            }
            Request::Write {
                offset,
                data,
                direct,
                overwrite_buffer,
                reply,
            } => {
                // A caller that gave up while queued gets no work done on
                // its behalf.
                if reply.is_closed() {
                    return false;
                }
                let deadline = self.deadline();
                let result = self
                    .handle_write(offset, data, direct, overwrite_buffer, deadline)
                    .await;
                let succeeded = result.is_ok();
                let _ = reply.send(result);
                if succeeded && self.shared.auto_flush {
                    let deadline = self.deadline();
                    if let Err(e) = self.flush_buffers(deadline).await {
                        warn!(inode = self.inode, error = %e, "auto flush failed");
                    }
                }
                false
            }
            Request::Read {
                offset,
                size,
                reply,
            } => {
                if reply.is_closed() {
                    return false;
                }
                let deadline = self.deadline();
                let result = self.handle_read(offset, size, deadline).await;
                let _ = reply.send(result);
                false
            }
            Request::Flush { reply } => {
                let deadline = self.deadline();
                let result = self.flush_buffers(deadline).await;
                let _ = reply.send(result);
                false
            }
            Request::Truncate { size, reply } => {
                if reply.is_closed() {
                    return false;
                }
                let deadline = self.deadline();
                let result = self.handle_truncate(size, deadline).await;
                let _ = reply.send(result);
                false
            }
            Request::Release { must, reply } => self.handle_release(must, reply).await,
            Request::Evict { reply } => {
                let _ = reply.send(Ok(()));
                true
            }
            Request::ExtentMerge { reply } => {
                if reply.is_closed() {
                    return false;
                }
                let deadline = self.deadline();
                let result = self.handle_extent_merge(deadline).await;
                let _ = reply.send(result);
                false
            }
            Request::RefreshExtents { reply } => {
                let result = self.fetch_extents().await;
                self.fetch_attempted = true;
                let _ = reply.send(result);
                false
            }
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.shared.request_timeout.map(|t| Instant::now() + t)
    }

    /// Virtual file size: cache size extended by buffered tail appends.
    fn virtual_size(&self) -> u64 {
        if self.append_buf.is_empty() {
            self.cache.file_size()
        } else {
            self.cache.file_size().max(self.append_buf.end())
        }
    }

    fn publish_stat(&self) {
        let (_, generation) = self.cache.size();
        self.stat.size.store(self.virtual_size(), Ordering::Release);
        self.stat.generation.store(generation, Ordering::Release);
    }

    /// One-shot extent fetch before first use. A failed first fetch
    /// leaves the stream answering `GetExtentsFailed` until an explicit
    /// refresh succeeds.
    async fn ensure_extents(&mut self) -> Result<()> {
        if !self.fetch_attempted {
            self.fetch_attempted = true;
            if let Err(e) = self.fetch_extents().await {
                warn!(inode = self.inode, error = %e, "initial extent fetch failed");
            }
        }
        if !self.cache.initialized() {
            return Err(ClientError::GetExtentsFailed(self.inode));
        }
        Ok(())
    }

    async fn fetch_extents(&mut self) -> Result<()> {
        let snapshot = self.shared.meta.get_extents(self.inode).await?;
        self.cache.replace(snapshot);
        self.read_ahead = None;
        self.publish_stat();
        Ok(())
    }

    async fn handle_write(
        &mut self,
        offset: u64,
        data: Bytes,
        direct: bool,
        overwrite_buffer: bool,
        deadline: Option<Instant>,
    ) -> Result<WriteOutcome> {
        self.ensure_extents().await?;
        if data.is_empty() {
            return Ok(WriteOutcome {
                written: 0,
                row_happened: false,
            });
        }
        self.read_ahead = None;
        let len = data.len();

        // Tail appends coalesce into the append buffer when the stream
        // opted in; direct writes always hit the data plane.
        if self.append_write_buffer && !direct && offset == self.virtual_size() {
            if self.append_buf.is_empty() {
                self.append_buf.base = offset;
            }
            self.append_buf.data.extend_from_slice(&data);
            self.publish_stat();
            if self.append_buf.data.len() as u64 >= self.shared.extent_size {
                self.flush_append_buf(deadline).await?;
            }
            return Ok(WriteOutcome {
                written: len,
                row_happened: false,
            });
        }

        // Other writes may overlap buffered bytes; land them first so
        // ordering stays write-after-write.
        if !self.append_buf.is_empty() {
            self.flush_append_buf(deadline).await?;
        }

        let requests = self.cache.prepare_write(offset, &data);

        if overwrite_buffer && requests.iter().all(|r| !r.is_append()) {
            self.overwrite_buf.extend(requests);
            return Ok(WriteOutcome {
                written: len,
                row_happened: false,
            });
        }

        if !self.overwrite_buf.is_empty() {
            self.flush_overwrite_buf(deadline).await?;
        }

        self.shared
            .limiter
            .wait(FlowKind::Write, len as u64, deadline)
            .await?;

        let mut written = 0;
        let mut row_happened = false;
        for request in requests {
            match request.key {
                None => written += self.write_append(&request, deadline).await?,
                Some(key) => {
                    let (n, row) = self.write_overwrite(key, &request, deadline).await?;
                    written += n;
                    row_happened |= row;
                }
            }
        }

        Ok(WriteOutcome {
            written,
            row_happened,
        })
    }

    /// Append `request` (no target key), chunked at the extent size.
    async fn write_append(
        &mut self,
        request: &ExtentRequest,
        deadline: Option<Instant>,
    ) -> Result<usize> {
        let extent_size = self.shared.extent_size as usize;
        let mut written = 0;
        let mut file_offset = request.file_offset;
        let mut start = 0;
        while start < request.data.len() {
            let end = (start + extent_size).min(request.data.len());
            let key = self
                .append_chunk(
                    file_offset,
                    request.data.slice(start..end),
                    deadline,
                    &HashSet::new(),
                )
                .await?;
            written += key.size as usize;
            file_offset = key.file_end();
            start = end;
        }
        Ok(written)
    }

    /// Allocate a fresh extent, write `data`, make the key durable, then
    /// install it in the cache.
    async fn append_chunk(
        &mut self,
        file_offset: u64,
        data: Bytes,
        deadline: Option<Instant>,
        exclude: &HashSet<u64>,
    ) -> Result<ExtentKey> {
        let tiny = file_offset == 0
            && self.shared.tiny_size > 0
            && data.len() as u64 <= self.shared.tiny_size;
        let key = with_deadline(
            deadline,
            alloc_and_write(&self.shared, self.inode, file_offset, &data, tiny, exclude),
        )
        .await?;

        // The metadata service is the source of truth: the key must be
        // durable before the cache learns about it. On failure the data
        // extent is orphaned and left to server-side GC.
        if let Err(e) = self.shared.meta.insert_extent_key(self.inode, key, false).await {
            warn!(
                inode = self.inode,
                partition = key.partition_id,
                extent = key.extent_id,
                error = %e,
                "extent key insert failed, orphaning extent"
            );
            return Err(e.into());
        }

        self.cache.insert(key);
        self.publish_stat();
        Ok(key)
    }

    /// Overwrite in place; an unreachable target converts to
    /// row-on-write.
    async fn write_overwrite(
        &mut self,
        key: ExtentKey,
        request: &ExtentRequest,
        deadline: Option<Instant>,
    ) -> Result<(usize, bool)> {
        let extent_offset = key.extent_offset + (request.file_offset - key.file_offset);
        let io = self.shared.wrapper.write_to_extent(
            key.partition_id,
            key.extent_id,
            extent_offset,
            &request.data,
        );
        match with_deadline(deadline, io).await {
            Ok(n) => Ok((n, false)),
            Err(e @ (ClientError::Cancelled | ClientError::RateLimited)) => Err(e),
            Err(e) => {
                warn!(
                    inode = self.inode,
                    partition = key.partition_id,
                    extent = key.extent_id,
                    error = %e,
                    "overwrite target unreachable, converting to row-on-write"
                );
                let mut exclude = HashSet::new();
                exclude.insert(key.partition_id);
                let new_key = self
                    .append_chunk(request.file_offset, request.data.clone(), deadline, &exclude)
                    .await?;
                Ok((new_key.size as usize, true))
            }
        }
    }

    async fn flush_buffers(&mut self, deadline: Option<Instant>) -> Result<()> {
        self.flush_overwrite_buf(deadline).await?;
        self.flush_append_buf(deadline).await?;
        Ok(())
    }

    async fn flush_overwrite_buf(&mut self, deadline: Option<Instant>) -> Result<()> {
        if self.overwrite_buf.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.overwrite_buf);
        let total: u64 = pending.iter().map(|r| r.size() as u64).sum();
        if let Err(e) = self
            .shared
            .limiter
            .wait(FlowKind::Write, total, deadline)
            .await
        {
            self.overwrite_buf = pending;
            return Err(e);
        }
        for (i, request) in pending.iter().enumerate() {
            let key = match request.key {
                Some(key) => key,
                None => continue,
            };
            if let Err(e) = self.write_overwrite(key, request, deadline).await {
                self.overwrite_buf = pending[i..].to_vec();
                return Err(e);
            }
        }
        Ok(())
    }

    async fn flush_append_buf(&mut self, deadline: Option<Instant>) -> Result<()> {
        if self.append_buf.is_empty() {
            return Ok(());
        }
        let base = self.append_buf.base;
        let data = std::mem::take(&mut self.append_buf.data).freeze();
        self.append_buf.base = 0;

        if let Err(e) = self
            .shared
            .limiter
            .wait(FlowKind::Write, data.len() as u64, deadline)
            .await
        {
            self.append_buf.base = base;
            self.append_buf.data = BytesMut::from(&data[..]);
            return Err(e);
        }

        let extent_size = self.shared.extent_size as usize;
        let mut file_offset = base;
        let mut start = 0;
        while start < data.len() {
            let end = (start + extent_size).min(data.len());
            match self
                .append_chunk(file_offset, data.slice(start..end), deadline, &HashSet::new())
                .await
            {
                Ok(key) => {
                    file_offset = key.file_end();
                    start = end;
                }
                Err(e) => {
                    // Keep whatever has not been made durable yet.
                    self.append_buf.base = file_offset;
                    self.append_buf.data = BytesMut::from(&data[start..]);
                    self.publish_stat();
                    return Err(e);
                }
            }
        }
        self.publish_stat();
        Ok(())
    }

    async fn handle_read(
        &mut self,
        offset: u64,
        size: usize,
        deadline: Option<Instant>,
    ) -> Result<(Bytes, bool)> {
        self.ensure_extents().await?;
        if size == 0 {
            return Ok((Bytes::new(), false));
        }
        if !self.append_buf.is_empty() || !self.overwrite_buf.is_empty() {
            self.flush_buffers(deadline).await?;
        }
        if self.cache.is_expired(self.shared.extent_cache_ttl) {
            if let Err(e) = self.fetch_extents().await {
                warn!(inode = self.inode, error = %e, "extent refresh failed, reading stale");
            }
        }

        match self.read_spans(offset, size, deadline).await {
            Err(e) if e.is_extent_not_found() => {
                if !self.cache.is_expired(RETRY_REFRESH_TTL) {
                    return Err(e);
                }
                self.flush_buffers(deadline).await?;
                self.fetch_extents().await?;
                let result = self.read_spans(offset, size, deadline).await;
                warn!(
                    inode = self.inode,
                    offset,
                    size,
                    ok = result.is_ok(),
                    "read retried after extent refresh"
                );
                result
            }
            other => other,
        }
    }

    async fn read_spans(
        &mut self,
        offset: u64,
        size: usize,
        deadline: Option<Instant>,
    ) -> Result<(Bytes, bool)> {
        let spans = self.cache.prepare_read(offset, size);
        if spans.is_empty() {
            return Ok((Bytes::new(), false));
        }

        let extent_bytes: u64 = spans
            .iter()
            .map(|s| match s {
                ReadSpan::Extent { size, .. } => *size as u64,
                ReadSpan::Hole { .. } => 0,
            })
            .sum();
        self.shared
            .limiter
            .wait(FlowKind::Read, extent_bytes, deadline)
            .await?;

        let mut buf = BytesMut::with_capacity(size);
        let mut has_hole = false;
        for span in spans {
            match span {
                ReadSpan::Hole { size, .. } => {
                    has_hole = true;
                    buf.resize(buf.len() + size, 0);
                }
                ReadSpan::Extent {
                    key,
                    file_offset,
                    size,
                } => {
                    let data = self.read_extent_span(&key, file_offset, size, deadline).await?;
                    buf.extend_from_slice(&data);
                }
            }
        }
        Ok((buf.freeze(), has_hole))
    }

    async fn read_extent_span(
        &mut self,
        key: &ExtentKey,
        file_offset: u64,
        size: usize,
        deadline: Option<Instant>,
    ) -> Result<Bytes> {
        if let Some(ra) = &self.read_ahead {
            let end = file_offset + size as u64;
            if file_offset >= ra.file_offset && end <= ra.file_offset + ra.data.len() as u64 {
                let start = (file_offset - ra.file_offset) as usize;
                return Ok(ra.data.slice(start..start + size));
            }
        }

        let extent_offset = key.extent_offset + (file_offset - key.file_offset);
        let in_key = (key.file_end() - file_offset) as usize;
        let fetch = if self.read_ahead_enabled {
            (size + READ_AHEAD_SIZE).min(in_key)
        } else {
            size
        };

        let io = self.shared.wrapper.read_from_extent(
            key.partition_id,
            key.extent_id,
            extent_offset,
            fetch,
        );
        let data = with_deadline(deadline, io).await?;
        if data.len() < size {
            return Err(ClientError::Network(format!(
                "short read: wanted {} got {} (partition {} extent {})",
                size,
                data.len(),
                key.partition_id,
                key.extent_id
            )));
        }
        if self.read_ahead_enabled && data.len() > size {
            self.read_ahead = Some(ReadAhead {
                file_offset,
                data: data.clone(),
            });
        }
        Ok(data.slice(..size))
    }

    async fn handle_truncate(&mut self, new_size: u64, deadline: Option<Instant>) -> Result<()> {
        self.ensure_extents().await?;
        self.flush_buffers(deadline).await?;
        self.read_ahead = None;

        let (old_size, _) = self.cache.size();
        self.shared
            .meta
            .truncate(self.inode, old_size, new_size)
            .await?;
        self.cache.truncate(new_size);
        self.publish_stat();
        Ok(())
    }

    /// One merge step; `Ok(true)` means no further step applies.
    async fn handle_extent_merge(&mut self, deadline: Option<Instant>) -> Result<bool> {
        self.ensure_extents().await?;
        self.flush_buffers(deadline).await?;

        let policy = MergePolicy {
            extent_size: self.shared.extent_size,
            align_size: self.shared.align_size,
            max_run: self.shared.max_extent_num_per_align_area,
            force_align: self.shared.force_align_merge,
        };
        let run = match merge::find_candidate(self.cache.keys(), &policy) {
            None => return Ok(true),
            Some(run) => run,
        };

        let total: usize = run.iter().map(|k| k.size as usize).sum();
        let mut merged = BytesMut::with_capacity(total);
        for key in &run {
            let io = self.shared.wrapper.read_from_extent(
                key.partition_id,
                key.extent_id,
                key.extent_offset,
                key.size as usize,
            );
            let data = with_deadline(deadline, io).await?;
            if data.len() < key.size as usize {
                return Err(ClientError::Network(format!(
                    "short read during merge (partition {} extent {})",
                    key.partition_id, key.extent_id
                )));
            }
            merged.extend_from_slice(&data[..key.size as usize]);
        }

        let file_offset = run[0].file_offset;
        let data = merged.freeze();
        let new_key = with_deadline(
            deadline,
            alloc_and_write(
                &self.shared,
                self.inode,
                file_offset,
                &data,
                false,
                &HashSet::new(),
            ),
        )
        .await?;

        self.shared
            .meta
            .merge_extents(self.inode, &run, &[new_key])
            .await?;
        for key in &run {
            self.cache.remove_key(key);
        }
        self.cache.insert(new_key);
        self.read_ahead = None;
        self.publish_stat();
        debug!(
            inode = self.inode,
            extents = run.len(),
            bytes = total,
            file_offset,
            "merged extent run"
        );
        Ok(false)
    }

    /// Returns `true` when the worker should exit.
    async fn handle_release(&mut self, must: bool, reply: Reply<()>) -> bool {
        if self.refs > 0 {
            self.refs -= 1;
        }
        if self.refs > 0 {
            let _ = reply.send(Ok(()));
            return false;
        }

        let deadline = self.deadline();
        match self.flush_buffers(deadline).await {
            Ok(()) => {}
            Err(e) if must => {
                warn!(inode = self.inode, error = %e, "flush failed during forced release");
            }
            Err(e) => {
                // The stream stays open; the handle count is restored so
                // the caller can retry the close.
                self.refs += 1;
                let _ = reply.send(Err(e));
                return false;
            }
        }

        self.shared.meta.evict_inode_cache(self.inode).await;
        let _ = reply.send(Ok(()));
        true
    }
}

/// Pick a partition, allocate an extent and write `data` into it. Pure
/// data-plane work: no metadata insert, no cache mutation. Shared by the
/// worker's append path, the merge rewrite and the façade's sync writes.
pub(crate) async fn alloc_and_write(
    shared: &EngineShared,
    inode: u64,
    file_offset: u64,
    data: &Bytes,
    tiny: bool,
    exclude: &HashSet<u64>,
) -> Result<ExtentKey> {
    let dp = shared.wrapper.pick_write_partition(exclude).await?;
    let extent_id = shared.wrapper.create_extent(&dp, inode, tiny).await?;
    let written = shared
        .wrapper
        .write_to_extent(dp.partition_id, extent_id, 0, data)
        .await?;
    Ok(ExtentKey {
        partition_id: dp.partition_id,
        extent_id,
        extent_offset: 0,
        file_offset,
        size: written as u32,
    })
}

async fn with_deadline<T>(
    deadline: Option<Instant>,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(deadline) => match timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Cancelled),
        },
        None => fut.await,
    }
}

/// Drain reply for a request that will never run.
fn reply_closed(request: Request) {
    match request {
        Request::Open { reply }
        | Request::Flush { reply }
        | Request::Truncate { reply, .. }
        | Request::Release { reply, .. }
        | Request::Evict { reply }
        | Request::RefreshExtents { reply } => {
            let _ = reply.send(Err(ClientError::Closed));
        }
        Request::Write { reply, .. } => {
            let _ = reply.send(Err(ClientError::Closed));
        }
        Request::Read { reply, .. } => {
            let _ = reply.send(Err(ClientError::Closed));
        }
        Request::ExtentMerge { reply } => {
            let _ = reply.send(Err(ClientError::Closed));
        }
    }
}
