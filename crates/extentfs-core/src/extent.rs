//! Extent keys and size units.
//!
//! An `ExtentKey` is the immutable metadata record for one contiguous byte
//! range of a file stored in one extent on one data partition. The extent
//! cache keeps an ordered, non-overlapping set of these per file.
//!
//! This module also owns the size-coercion rules for user configuration:
//! extent size is clamped to `[1 MiB, 128 MiB]` and rounded up to a power
//! of two, align size is capped at 128 KiB, and tiny size maps its two
//! sentinels (0 = default, -1 = disabled).

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Maximum (and default) extent size: 128 MiB.
pub const EXTENT_SIZE: u64 = 128 * 1024 * 1024;

/// Minimum extent size: 1 MiB.
pub const MIN_EXTENT_SIZE: u64 = 1024 * 1024;

/// Maximum align size: 128 KiB. Larger configured values are capped.
pub const MAX_ALIGN_SIZE: u64 = 128 * 1024;

/// Default threshold below which appends use the tiny-extent pool: 1 MiB.
pub const DEFAULT_TINY_SIZE: u64 = 1024 * 1024;

/// Sentinel for `tiny_size` configuration: disable tiny extents entirely.
pub const NO_TINY_EXTENT: i64 = -1;

/// Inode of the filesystem root, the starting point for full-tree walks.
pub const ROOT_INODE: u64 = 1;

/// Metadata record mapping a file-offset range to an extent region.
///
/// `size` is 32-bit: extents never exceed [`EXTENT_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtentKey {
    /// Data partition holding the extent.
    pub partition_id: u64,
    /// Extent within the partition.
    pub extent_id: u64,
    /// Offset of this range within the extent.
    pub extent_offset: u64,
    /// Offset of this range within the file.
    pub file_offset: u64,
    /// Length of the range in bytes.
    pub size: u32,
}

impl ExtentKey {
    /// First file offset past this key.
    pub fn file_end(&self) -> u64 {
        self.file_offset + self.size as u64
    }

    /// Whether `offset` falls inside this key's file range.
    pub fn covers(&self, offset: u64) -> bool {
        offset >= self.file_offset && offset < self.file_end()
    }

    /// Whether this key's file range intersects `[start, end)`.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        start < self.file_end() && end > self.file_offset
    }
}

/// Coerce a configured extent size into a legal one.
///
/// - `0` → default ([`EXTENT_SIZE`])
/// - above [`EXTENT_SIZE`] → [`EXTENT_SIZE`]
/// - below [`MIN_EXTENT_SIZE`] → [`MIN_EXTENT_SIZE`]
/// - not a power of two → rounded up to the next power of two
pub fn coerce_extent_size(size: u64) -> u64 {
    if size == 0 {
        return EXTENT_SIZE;
    }
    if size > EXTENT_SIZE {
        warn!(
            configured = size,
            applied = EXTENT_SIZE,
            "extent size too large, using maximum"
        );
        return EXTENT_SIZE;
    }
    if size < MIN_EXTENT_SIZE {
        warn!(
            configured = size,
            applied = MIN_EXTENT_SIZE,
            "extent size too small, using minimum"
        );
        return MIN_EXTENT_SIZE;
    }
    if !size.is_power_of_two() {
        let coerced = size.next_power_of_two();
        warn!(
            configured = size,
            applied = coerced,
            "extent size must be a power of two, rounding up"
        );
        return coerced;
    }
    size
}

/// Cap a configured align size at [`MAX_ALIGN_SIZE`].
pub fn coerce_align_size(size: u64) -> u64 {
    if size > MAX_ALIGN_SIZE {
        warn!(
            configured = size,
            applied = MAX_ALIGN_SIZE,
            "align size too large, capping"
        );
        return MAX_ALIGN_SIZE;
    }
    size
}

/// Resolve the tiny-extent threshold from its configured value.
///
/// `0` selects the default, [`NO_TINY_EXTENT`] (or any negative value)
/// disables tiny extents (threshold 0), anything else is taken as bytes.
pub fn coerce_tiny_size(size: i64) -> u64 {
    if size == 0 {
        DEFAULT_TINY_SIZE
    } else if size < 0 {
        0
    } else {
        size as u64
    }
}
