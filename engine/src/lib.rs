#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() and expect() in production code to prevent panics from corrupt data.
// Test code is allowed to use them for convenience.
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

// Life of a record write:
// 1. Caller starts an atomic operation
// 2. The cluster takes its component lock in that operation
// 3. The record entry is cut into chunks:
//     - Ask the free-space map for a page with room
//     - Otherwise initialize a new data page
//     - Append the chunk to the page's slot array
//     - Report the page's new free space to the map
//     - Patch the previous chunk's next pointer
// 4. The position map points the record's position at the head chunk
// 5. Commit writes every changed page, then releases the locks
//
// System components:
//  - Page cache and buffer pool
//  - Atomic operations (copy-on-write page overlay + component locks)
//  - Free-space map
//  - Paginated clusters

pub mod config;
pub mod storage;

#[cfg(test)]
mod testing;
