//! Free-space tracking for cluster data pages.
//!
//! Free space is quantized to one byte per page ("bucket") so that a whole
//! binary max-tree over thousands of pages fits in a single page. See
//! [`FreeSpacePage`] for the tree layout and [`FreeSpaceMap`] for the two-level
//! hierarchy built from such pages.

mod map;
mod page;

pub use map::{FreeSpaceMap, FreeSpaceMapError, FREE_SPACE_MAP_EXTENSION};
pub use page::{FreeSpacePage, LEAF_COUNT, TREE_DEPTH};

use crate::storage::page::PAGE_SIZE;

/// Width of one free-space bucket in bytes.
pub const NORMALIZATION_INTERVAL: usize = PAGE_SIZE / 256;

/// Bucket recorded for a page with `free_bytes` of free space (rounded down).
#[must_use]
pub fn free_space_bucket(free_bytes: usize) -> u8 {
    u8::try_from(free_bytes / NORMALIZATION_INTERVAL).unwrap_or(u8::MAX)
}

/// Smallest bucket that guarantees at least `required_bytes` of free space.
///
/// `None` when no page can ever report that much.
#[must_use]
pub fn required_bucket(required_bytes: usize) -> Option<u8> {
    u8::try_from(required_bytes / NORMALIZATION_INTERVAL + 1).ok()
}
