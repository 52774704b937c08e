//! Bounded pool of page buffers.
//!
//! The file cache leases one buffer per resident page frame. The pool caps
//! how many frames can be resident at once; when it runs dry the cache
//! evicts unpinned frames and retries.
//!
//! # Design
//!
//! - Buffers are allocated lazily, up to `capacity`
//! - Released buffers are kept on a free list and recycled
//! - Returned automatically via RAII (Drop on Page)
//!
//! # Invariants
//!
//! - `free_list.len() <= allocated <= capacity`
//! - `allocated - free_list.len()` is the number of leased buffers

use std::sync::Arc;

use parking_lot::Mutex;

use crate::storage::page::{PAGE_SIZE, Page};

/// Default buffer pool capacity in pages (16,384 pages = 128MB).
pub const DEFAULT_POOL_CAPACITY: usize = 16_384;

struct PoolState {
    free_list: Vec<Box<[u8; PAGE_SIZE]>>,
    allocated: usize,
}

/// A buffer pool handing out zeroed page buffers.
///
/// # Pre-conditions
/// - `capacity` must be > 0 when creating
///
/// # Invariants
/// - Never more than `capacity` buffers exist at the same time
pub struct BufferPool {
    state: Mutex<PoolState>,
    capacity: usize,
}

impl BufferPool {
    /// Create a new buffer pool with the given capacity.
    ///
    /// # Panics
    /// Panics if capacity is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0, "Buffer pool capacity must be positive");

        Arc::new(Self {
            state: Mutex::new(PoolState {
                free_list: Vec::new(),
                allocated: 0,
            }),
            capacity,
        })
    }

    /// Lease a zeroed buffer from the pool.
    ///
    /// # Returns
    /// - `Some(buffer)` when a recycled buffer exists or capacity remains
    /// - `None` if every buffer is leased
    pub fn lease_zeroed(&self) -> Option<Box<[u8; PAGE_SIZE]>> {
        let mut state = self.state.lock();
        if let Some(mut buffer) = state.free_list.pop() {
            buffer.fill(0);
            return Some(buffer);
        }
        if state.allocated == self.capacity {
            return None;
        }
        state.allocated += 1;
        Some(Box::new([0u8; PAGE_SIZE]))
    }

    /// Lease a zeroed page from the pool.
    ///
    /// The page returns its buffer to this pool when dropped.
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn lease_page(self: &Arc<Self>) -> Option<Page> {
        let buffer = self.lease_zeroed()?;
        Some(Page::from_pool(buffer, Arc::clone(self)))
    }

    /// Return a buffer to the pool.
    ///
    /// # Panics
    /// Panics if more buffers come back than were handed out (indicates a bug).
    pub fn return_buffer(&self, buffer: Box<[u8; PAGE_SIZE]>) {
        let mut state = self.state.lock();
        assert!(
            state.free_list.len() < state.allocated,
            "Buffer pool overflow: returning buffer to full pool"
        );
        state.free_list.push(buffer);
    }

    /// Number of buffers that can still be leased.
    #[must_use]
    pub fn available(&self) -> usize {
        let state = self.state.lock();
        self.capacity - state.allocated + state.free_list.len()
    }

    /// Get the total capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_creation() {
        let pool = BufferPool::new(10);
        assert_eq!(pool.capacity(), 10);
        assert_eq!(pool.available(), 10);
    }

    #[test]
    fn test_lease_page_returns_on_drop() {
        let pool = BufferPool::new(2);

        {
            let _page1 = pool.lease_page().expect("should lease");
            assert_eq!(pool.available(), 1);

            let _page2 = pool.lease_page().expect("should lease");
            assert_eq!(pool.available(), 0);

            assert!(pool.lease_page().is_none());
        }

        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_recycled_buffers_are_zeroed() {
        let pool = BufferPool::new(1);

        {
            let mut page = pool.lease_page().expect("should lease");
            page.write_u8(0, 0xFF);
            page.write_u8(100, 0xAB);
        }

        let page = pool.lease_page().expect("should lease");
        assert_eq!(page.read_u8(0), 0);
        assert_eq!(page.read_u8(100), 0);
    }

    #[test]
    #[should_panic(expected = "capacity must be positive")]
    fn test_zero_capacity_panics() {
        let _ = BufferPool::new(0);
    }

    #[test]
    #[should_panic(expected = "Buffer pool overflow")]
    fn test_return_to_full_pool_panics() {
        let pool = BufferPool::new(1);
        pool.return_buffer(Box::new([0u8; PAGE_SIZE]));
    }
}
