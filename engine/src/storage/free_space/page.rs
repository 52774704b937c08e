//! One page of the free-space tree.
//!
//! The page body is an implicit, heap-indexed complete binary tree of one-byte
//! cells. Level 0 is the root; node `(level, index)` lives at
//! `PageHeader::SIZE + (2^level - 1) + index`, and its children are
//! `(level + 1, 2 * index)` and `(level + 1, 2 * index + 1)`. Every internal
//! node holds the max of its children, so the root is the largest bucket on
//! the page.
//!
//! The body does not hold a full last level: only the first [`LEAF_COUNT`]
//! leaves fit. A child cell that would fall outside the page is treated as
//! equal to its sibling.

use std::ops::{Deref, DerefMut};

use crate::storage::page::{PAGE_SIZE, Page, PageHeader, PageType};

const CELLS_OFFSET: usize = PageHeader::SIZE;
const CELL_COUNT: usize = PAGE_SIZE - PageHeader::SIZE;

/// Level of the leaves (the root is level 0).
pub const TREE_DEPTH: u32 = CELL_COUNT.ilog2();

const INTERNAL_CELLS: usize = (1 << TREE_DEPTH) - 1;

/// Number of leaves that fit in one page.
pub const LEAF_COUNT: usize = {
    let available = CELL_COUNT - INTERNAL_CELLS;
    let full_level = 1 << TREE_DEPTH;
    if available < full_level {
        available
    } else {
        full_level
    }
};

const fn cell_offset(level: u32, index: usize) -> usize {
    CELLS_OFFSET + (1 << level) - 1 + index
}

/// Typed view of a free-space tree page.
pub struct FreeSpacePage<P> {
    page: P,
}

impl<P: Deref<Target = Page>> FreeSpacePage<P> {
    #[must_use]
    pub const fn new(page: P) -> Self {
        Self { page }
    }

    /// Bucket stored at `(level, index)`.
    #[must_use]
    pub fn bucket(&self, level: u32, index: usize) -> u8 {
        self.page.read_u8(cell_offset(level, index))
    }

    /// Largest bucket on the page.
    #[must_use]
    pub fn max_bucket(&self) -> u8 {
        self.bucket(0, 0)
    }

    /// Find a leaf whose bucket is at least `required`.
    ///
    /// Walks from the root, always taking the left child when it qualifies.
    #[must_use]
    pub fn find_leaf(&self, required: u8) -> Option<usize> {
        let root = self.max_bucket();
        if root == 0 || root < required {
            return None;
        }

        let mut index = 0;
        for level in 1..=TREE_DEPTH {
            let left = 2 * index;
            if level == TREE_DEPTH && left >= LEAF_COUNT {
                return None;
            }
            if self.bucket(level, left) >= required {
                index = left;
            } else {
                index = left + 1;
                if level == TREE_DEPTH && index >= LEAF_COUNT {
                    return None;
                }
                debug_assert!(self.bucket(level, index) >= required);
            }
        }
        Some(index)
    }
}

impl<P: DerefMut<Target = Page>> FreeSpacePage<P> {
    /// Reset the tree: every leaf reports no free space.
    pub fn init(&mut self) {
        self.page.set_page_type(PageType::FreeSpaceMap);
        self.page.write_bytes(CELLS_OFFSET, &[0u8; CELL_COUNT]);
    }

    /// Set a leaf's bucket and fix up its ancestors.
    ///
    /// Returns the root bucket afterwards, so the caller can push it into an
    /// aggregating page.
    ///
    /// # Panics
    /// Panics if `leaf >= LEAF_COUNT`.
    pub fn update_leaf(&mut self, leaf: usize, bucket: u8) -> u8 {
        assert!(
            leaf < LEAF_COUNT,
            "free-space leaf {leaf} out of range (capacity {LEAF_COUNT})"
        );

        let mut level = TREE_DEPTH;
        let mut index = leaf;
        let mut value = bucket;
        loop {
            let offset = cell_offset(level, index);
            if self.page.read_u8(offset) == value {
                break;
            }
            self.page.write_u8(offset, value);
            if level == 0 {
                break;
            }

            let sibling_offset = cell_offset(level, index ^ 1);
            let sibling = if sibling_offset < PAGE_SIZE {
                self.page.read_u8(sibling_offset)
            } else {
                value
            };
            value = value.max(sibling);
            index /= 2;
            level -= 1;
        }
        self.max_bucket()
    }
}
