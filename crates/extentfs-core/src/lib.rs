//! Core Types for extentfs
//!
//! This crate holds the value types shared by every layer of the extentfs
//! client: the extent key (the metadata record mapping a file-offset range
//! to a region of an extent on a data partition), the size units that bound
//! extents, and the coercion rules applied to user-supplied sizes.
//!
//! ## What is an Extent?
//!
//! A file is stored as a sequence of extents. Each extent is a contiguous
//! byte range living on exactly one data partition, and each `ExtentKey`
//! records where a slice of the file lives:
//!
//! ```text
//! file:    [0 ............ 1024) [1024 ........ 3072)
//!               │                      │
//!               ▼                      ▼
//! keys:    {dp 7, ext 12,         {dp 3, ext 48,
//!           ext_off 0,             ext_off 0,
//!           file_off 0,            file_off 1024,
//!           size 1024}             size 2048}
//! ```
//!
//! Keys are sorted by file offset and never overlap; a gap between keys is
//! a hole (reads return zeros).
//!
//! ## Size Rules
//!
//! Extent sizes are bounded to `[MIN_EXTENT_SIZE, EXTENT_SIZE]` and must be
//! a power of two; user configuration is coerced, never rejected. See
//! [`extent::coerce_extent_size`] for the exact table.

pub mod extent;

pub use extent::{
    coerce_align_size, coerce_extent_size, coerce_tiny_size, ExtentKey, DEFAULT_TINY_SIZE,
    EXTENT_SIZE, MAX_ALIGN_SIZE, MIN_EXTENT_SIZE, NO_TINY_EXTENT, ROOT_INODE,
};

/// Numeric file identifier assigned by the metadata service.
pub type Inode = u64;
