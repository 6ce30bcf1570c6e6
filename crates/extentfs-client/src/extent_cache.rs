//! In-Memory Extent Cache with O(log n) Offset Lookups
//!
//! Every open file carries one `ExtentCache`: an ordered, non-overlapping
//! set of extent keys plus the file size and a generation counter. All
//! read and write planning happens against this map.
//!
//! ```text
//! BTreeMap<u64, ExtentKey>            (keyed by file_offset)
//!   0     -> {dp 7, ext 12, size 512}
//!   2048  -> {dp 3, ext 48, size 512}
//!
//! prepare_read(0, 2560):
//!   [Extent 0..512) [Hole 512..2048) [Extent 2048..2560)
//! ```
//!
//! ## Ownership
//!
//! The cache is owned by its streamer and touched only from the
//! streamer's worker task. That single-writer contract is what lets it be
//! a plain struct with no interior locking.
//!
//! ## Invariants
//!
//! - Keys are sorted by file offset and never overlap; a gap is a hole
//!   (reads return zeros and report `has_hole`).
//! - `size >= max(key.file_end())` at all times.
//! - `generation` increases on every mutation visible to readers.
//!
//! ## Freshness
//!
//! `last_refresh` tracks the last snapshot fetch from the metadata
//! service; [`ExtentCache::is_expired`] drives both the pre-read refresh
//! and the read path's stale-cache retry guard.

use std::collections::BTreeMap;
use std::ops::Bound::Excluded;
use std::time::Duration;

use bytes::Bytes;
use extentfs_core::ExtentKey;
use extentfs_meta::ExtentSnapshot;
use tokio::time::Instant;
use tracing::debug;

/// Internal planning record for one slice of a write.
///
/// `key == None` marks the slice as an append: a new extent must be
/// allocated at `file_offset`. Otherwise the slice overwrites the named
/// key in place.
#[derive(Debug, Clone)]
pub struct ExtentRequest {
    pub file_offset: u64,
    pub data: Bytes,
    pub key: Option<ExtentKey>,
}

impl ExtentRequest {
    pub fn is_append(&self) -> bool {
        self.key.is_none()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// One slice of a planned read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadSpan {
    /// Covered by an extent; read `size` bytes of `key` starting at file
    /// offset `file_offset`.
    Extent {
        key: ExtentKey,
        file_offset: u64,
        size: usize,
    },
    /// A hole; yields `size` zero bytes.
    Hole { file_offset: u64, size: usize },
}

/// Ordered extent map for one inode.
pub struct ExtentCache {
    inode: u64,
    keys: BTreeMap<u64, ExtentKey>,
    size: u64,
    generation: u64,
    initialized: bool,
    last_refresh: Option<Instant>,
}

impl ExtentCache {
    pub fn new(inode: u64) -> Self {
        Self {
            inode,
            keys: BTreeMap::new(),
            size: 0,
            generation: 0,
            initialized: false,
            last_refresh: None,
        }
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// Install a snapshot fetched from the metadata service.
    pub fn replace(&mut self, snapshot: ExtentSnapshot) {
        self.keys.clear();
        for key in snapshot.keys {
            self.keys.insert(key.file_offset, key);
        }
        self.size = snapshot.size;
        self.generation = self.generation.max(snapshot.generation);
        self.initialized = true;
        self.mark_fresh();
        debug!(
            inode = self.inode,
            size = self.size,
            generation = self.generation,
            keys = self.keys.len(),
            "extent cache refreshed"
        );
    }

    /// Install a new key, replacing whatever part of the range it covers.
    ///
    /// Overlapped keys are dropped; a key partially overlapped at either
    /// edge is trimmed, and one strictly containing the new range is
    /// split around it. Row-on-write relies on this to supersede the
    /// unreachable extent without ever producing an overlap.
    pub fn insert(&mut self, key: ExtentKey) {
        let start = key.file_offset;
        let end = key.file_end();

        let mut overlapped = Vec::new();
        if let Some((_, k)) = self.keys.range(..=start).next_back() {
            if k.file_end() > start {
                overlapped.push(*k);
            }
        }
        for (_, k) in self.keys.range((Excluded(start), Excluded(end))) {
            overlapped.push(*k);
        }

        for old in overlapped {
            self.keys.remove(&old.file_offset);
            if old.file_offset < start {
                let mut left = old;
                left.size = (start - old.file_offset) as u32;
                self.keys.insert(left.file_offset, left);
            }
            if old.file_end() > end {
                let mut right = old;
                let delta = end - old.file_offset;
                right.extent_offset = old.extent_offset + delta;
                right.file_offset = end;
                right.size = (old.file_end() - end) as u32;
                self.keys.insert(right.file_offset, right);
            }
        }

        self.keys.insert(key.file_offset, key);
        if end > self.size {
            self.size = end;
        }
        self.generation += 1;
    }

    /// Remove an exact key (used by the merge swap). No generation bump;
    /// the insert of the merged key accounts for the mutation.
    pub fn remove_key(&mut self, key: &ExtentKey) -> bool {
        match self.keys.get(&key.file_offset) {
            Some(existing) if existing == key => {
                self.keys.remove(&key.file_offset);
                true
            }
            _ => false,
        }
    }

    /// Split `[offset, offset + data.len())` into overwrite and append
    /// requests against the current map.
    pub fn prepare_write(&self, offset: u64, data: &Bytes) -> Vec<ExtentRequest> {
        let end = offset + data.len() as u64;
        let mut requests = Vec::new();
        let mut cursor = offset;

        for key in self.overlapping(offset, end) {
            if cursor < key.file_offset {
                requests.push(ExtentRequest {
                    file_offset: cursor,
                    data: data.slice((cursor - offset) as usize..(key.file_offset - offset) as usize),
                    key: None,
                });
                cursor = key.file_offset;
            }
            let span_end = key.file_end().min(end);
            requests.push(ExtentRequest {
                file_offset: cursor,
                data: data.slice((cursor - offset) as usize..(span_end - offset) as usize),
                key: Some(key),
            });
            cursor = span_end;
        }

        if cursor < end {
            requests.push(ExtentRequest {
                file_offset: cursor,
                data: data.slice((cursor - offset) as usize..),
                key: None,
            });
        }

        requests
    }

    /// Plan a read of `[offset, offset + size)`, clamped to the file
    /// size. Uncovered sub-ranges come back as holes.
    pub fn prepare_read(&self, offset: u64, size: usize) -> Vec<ReadSpan> {
        let end = (offset + size as u64).min(self.size);
        if offset >= end {
            return Vec::new();
        }

        let mut spans = Vec::new();
        let mut cursor = offset;

        for key in self.overlapping(offset, end) {
            if cursor < key.file_offset {
                spans.push(ReadSpan::Hole {
                    file_offset: cursor,
                    size: (key.file_offset - cursor) as usize,
                });
                cursor = key.file_offset;
            }
            let span_end = key.file_end().min(end);
            spans.push(ReadSpan::Extent {
                key,
                file_offset: cursor,
                size: (span_end - cursor) as usize,
            });
            cursor = span_end;
        }

        if cursor < end {
            spans.push(ReadSpan::Hole {
                file_offset: cursor,
                size: (end - cursor) as usize,
            });
        }

        spans
    }

    /// Drop keys wholly past `new_size`, shorten the boundary key.
    pub fn truncate(&mut self, new_size: u64) {
        let dropped: Vec<u64> = self.keys.range(new_size..).map(|(&o, _)| o).collect();
        for offset in dropped {
            self.keys.remove(&offset);
        }
        if let Some((&offset, key)) = self.keys.range(..new_size).next_back() {
            if key.file_end() > new_size {
                let mut shortened = *key;
                shortened.size = (new_size - offset) as u32;
                self.keys.insert(offset, shortened);
            }
        }
        self.size = new_size;
        self.generation += 1;
    }

    pub fn size(&self) -> (u64, u64) {
        (self.size, self.generation)
    }

    pub fn file_size(&self) -> u64 {
        self.size
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Keys in file-offset order.
    pub fn keys(&self) -> impl Iterator<Item = &ExtentKey> {
        self.keys.values()
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        match self.last_refresh {
            None => true,
            Some(at) => at.elapsed() > ttl,
        }
    }

    pub fn mark_fresh(&mut self) {
        self.last_refresh = Some(Instant::now());
    }

    /// Keys intersecting `[start, end)`, in order.
    fn overlapping(&self, start: u64, end: u64) -> Vec<ExtentKey> {
        let mut keys = Vec::new();
        if let Some((_, k)) = self.keys.range(..=start).next_back() {
            if k.file_end() > start {
                keys.push(*k);
            }
        }
        for (_, k) in self.keys.range((Excluded(start), Excluded(end))) {
            keys.push(*k);
        }
        keys
    }
}
