//! Atomic operations over the page cache.
//!
//! An [`AtomicOperation`] collects page changes in a private copy-on-write
//! overlay. Nothing reaches the cache or the disk until [`AtomicOperation::commit`];
//! [`AtomicOperation::rollback`] (or dropping the operation) throws the overlay
//! away.
//!
//! The [`AtomicOperationsManager`] hands out operations and owns the
//! component lock table. A component (one cluster, for example) locked
//! exclusively by an operation stays locked until that operation ends, so
//! concurrent operations can never interleave their structural changes to the
//! same component.

mod manager;
mod operation;

pub use manager::{AtomicOperationsManager, ComponentId, ComponentReadGuard};
pub use operation::{AtomicOperation, OperationId, PageWriteGuard};
