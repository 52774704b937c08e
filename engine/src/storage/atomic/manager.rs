use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use super::operation::{AtomicOperation, OperationId};
use crate::storage::file_cache::{CacheError, FileCache};

/// Identifier of a lockable storage component.
pub type ComponentId = u32;

#[derive(Default)]
struct ComponentLock {
    owner: Option<OperationId>,
    readers: usize,
    waiting_writers: usize,
}

impl ComponentLock {
    const fn is_idle(&self) -> bool {
        self.owner.is_none() && self.readers == 0 && self.waiting_writers == 0
    }
}

/// Starts atomic operations and arbitrates component locks between them.
pub struct AtomicOperationsManager {
    cache: Arc<FileCache>,
    next_operation_id: AtomicU64,
    locks: Mutex<HashMap<ComponentId, ComponentLock>>,
    released: Condvar,
}

impl AtomicOperationsManager {
    #[must_use]
    pub fn new(cache: Arc<FileCache>) -> Self {
        Self {
            cache,
            next_operation_id: AtomicU64::new(1),
            locks: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// The page cache operations write through to.
    #[must_use]
    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    /// Begin a new atomic operation.
    pub fn start(&self) -> AtomicOperation<'_> {
        let id = self.next_operation_id.fetch_add(1, Ordering::Relaxed);
        AtomicOperation::new(id, self)
    }

    /// Run `f` inside a fresh operation.
    ///
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err`.
    pub fn execute<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut AtomicOperation<'_>) -> Result<T, E>,
        E: From<CacheError>,
    {
        let mut operation = self.start();
        match f(&mut operation) {
            Ok(value) => {
                operation.commit()?;
                Ok(value)
            }
            Err(e) => {
                operation.rollback();
                Err(e)
            }
        }
    }

    /// Wait until no operation holds or waits for `component` exclusively,
    /// then register a reader.
    ///
    /// The returned guard keeps exclusive lockers out until it is dropped.
    /// Waiting writers go first, so a stream of readers cannot starve them.
    pub fn acquire_read_lock(&self, component: ComponentId) -> ComponentReadGuard<'_> {
        let mut locks = self.locks.lock();
        loop {
            let lock = locks.entry(component).or_default();
            if lock.owner.is_none() && lock.waiting_writers == 0 {
                lock.readers += 1;
                break;
            }
            self.released.wait(&mut locks);
        }
        ComponentReadGuard {
            manager: self,
            component,
        }
    }

    /// Block until `operation` owns `component` exclusively.
    ///
    /// Reentrant: returns immediately if `operation` already owns it.
    pub(super) fn acquire_exclusive_lock(&self, component: ComponentId, operation: OperationId) {
        let mut locks = self.locks.lock();
        let mut waiting = false;
        loop {
            let lock = locks.entry(component).or_default();
            match lock.owner {
                Some(owner) if owner == operation => return,
                None if lock.readers == 0 => {
                    lock.owner = Some(operation);
                    if waiting {
                        lock.waiting_writers -= 1;
                    }
                    return;
                }
                _ => {
                    if !waiting {
                        lock.waiting_writers += 1;
                        waiting = true;
                    }
                    self.released.wait(&mut locks);
                }
            }
        }
    }

    /// Release every lock in `components` owned by `operation`.
    pub(super) fn release_exclusive_locks(
        &self,
        components: &[ComponentId],
        operation: OperationId,
    ) {
        if components.is_empty() {
            return;
        }
        let mut locks = self.locks.lock();
        for component in components {
            if let Some(lock) = locks.get_mut(component)
                && lock.owner == Some(operation)
            {
                lock.owner = None;
                if lock.is_idle() {
                    locks.remove(component);
                }
            }
        }
        self.released.notify_all();
    }

    fn release_read_lock(&self, component: ComponentId) {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get_mut(&component) {
            lock.readers = lock.readers.saturating_sub(1);
            if lock.is_idle() {
                locks.remove(&component);
            }
        }
        self.released.notify_all();
    }
}

/// Shared hold on a component; released on drop.
pub struct ComponentReadGuard<'a> {
    manager: &'a AtomicOperationsManager,
    component: ComponentId,
}

impl Drop for ComponentReadGuard<'_> {
    fn drop(&mut self) {
        self.manager.release_read_lock(self.component);
    }
}
