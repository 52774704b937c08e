use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::{Deref, DerefMut};

use super::manager::{AtomicOperationsManager, ComponentId};
use crate::storage::file_cache::{CacheError, FileCache, FileId, PageReadGuard, PageSource};
use crate::storage::page::{Page, PageIndex};

/// Identifier of an atomic operation.
pub type OperationId = u64;

/// A page checked out of an operation's overlay for writing.
///
/// Borrowing the operation mutably, so at most one is alive at a time; the
/// borrow ends (and the page is released) when the guard goes out of scope.
pub struct PageWriteGuard<'a> {
    page_index: PageIndex,
    page: &'a mut Page,
}

impl PageWriteGuard<'_> {
    #[must_use]
    pub const fn page_index(&self) -> PageIndex {
        self.page_index
    }
}

impl Deref for PageWriteGuard<'_> {
    type Target = Page;

    fn deref(&self) -> &Page {
        self.page
    }
}

impl DerefMut for PageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut Page {
        self.page
    }
}

/// A batch of page changes applied all at once on commit.
///
/// # Invariants
/// - Every page added by this operation lives in `changes`
/// - `filled_up_to[f]`, when present, is the file's size including added pages
/// - Exclusive component locks are held until commit or rollback
pub struct AtomicOperation<'a> {
    id: OperationId,
    manager: &'a AtomicOperationsManager,
    changes: BTreeMap<(FileId, PageIndex), Page>,
    filled_up_to: HashMap<FileId, u64>,
    created_files: Vec<FileId>,
    deleted_files: Vec<FileId>,
    locks: Vec<ComponentId>,
    finished: bool,
}

impl<'a> AtomicOperation<'a> {
    pub(super) fn new(id: OperationId, manager: &'a AtomicOperationsManager) -> Self {
        Self {
            id,
            manager,
            changes: BTreeMap::new(),
            filled_up_to: HashMap::new(),
            created_files: Vec::new(),
            deleted_files: Vec::new(),
            locks: Vec::new(),
            finished: false,
        }
    }

    #[must_use]
    pub const fn id(&self) -> OperationId {
        self.id
    }

    #[must_use]
    pub fn cache(&self) -> &'a FileCache {
        self.manager.cache()
    }

    /// Number of pages in the file as seen by this operation.
    pub fn filled_up_to(&self, file_id: FileId) -> Result<u64, CacheError> {
        if self.deleted_files.contains(&file_id) {
            return Err(CacheError::UnknownFile(file_id));
        }
        match self.filled_up_to.get(&file_id) {
            Some(pages) => Ok(*pages),
            None => self.cache().filled_up_to(file_id),
        }
    }

    /// Load a page for reading, preferring this operation's own changes.
    pub fn load_page_for_read(
        &self,
        file_id: FileId,
        page_index: PageIndex,
    ) -> Result<PageReadGuard<'_>, CacheError> {
        self.read_page(file_id, page_index)
    }

    /// Load a page for writing.
    ///
    /// The first write to a page copies the committed version into the overlay.
    pub fn load_page_for_write(
        &mut self,
        file_id: FileId,
        page_index: PageIndex,
    ) -> Result<PageWriteGuard<'_>, CacheError> {
        let filled_up_to = self.filled_up_to(file_id)?;
        if page_index >= filled_up_to {
            return Err(CacheError::PageOutOfBounds {
                file_id,
                page_index,
                filled_up_to,
            });
        }

        let cache = self.cache();
        let page = match self.changes.entry((file_id, page_index)) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let frame = cache.load_page(file_id, page_index)?;
                let copy = Page::copy_of(&frame.read());
                entry.insert(copy)
            }
        };
        Ok(PageWriteGuard { page_index, page })
    }

    /// Append a zeroed page to the file and return it for writing.
    pub fn add_page(&mut self, file_id: FileId) -> Result<PageWriteGuard<'_>, CacheError> {
        let page_index = self.filled_up_to(file_id)?;
        self.filled_up_to.insert(file_id, page_index + 1);
        tracing::debug!("Operation {} added page {page_index} to file {file_id}", self.id);

        let page = match self.changes.entry((file_id, page_index)) {
            Entry::Occupied(entry) => {
                let page = entry.into_mut();
                page.as_bytes_mut().fill(0);
                page
            }
            Entry::Vacant(entry) => entry.insert(Page::new()),
        };
        Ok(PageWriteGuard { page_index, page })
    }

    /// Create a file. It is removed again if the operation rolls back.
    pub fn add_file(&mut self, name: &str) -> Result<FileId, CacheError> {
        let file_id = self.cache().add_file(name)?;
        self.created_files.push(file_id);
        Ok(file_id)
    }

    /// Open an existing file.
    pub fn open_file(&self, name: &str) -> Result<FileId, CacheError> {
        self.cache().open_file(name)
    }

    /// Schedule a file for deletion on commit.
    pub fn delete_file(&mut self, file_id: FileId) -> Result<(), CacheError> {
        self.filled_up_to(file_id)?;
        self.deleted_files.push(file_id);
        Ok(())
    }

    /// Whether a file exists as seen by this operation.
    #[must_use]
    pub fn is_file_exists(&self, name: &str) -> bool {
        let cache = self.cache();
        match cache.file_id(name) {
            Some(file_id) => !self.deleted_files.contains(&file_id),
            None => cache.exists(name),
        }
    }

    /// Take `component` exclusively until this operation ends.
    pub fn acquire_exclusive_lock(&mut self, component: ComponentId) {
        if self.locks.contains(&component) {
            return;
        }
        self.manager.acquire_exclusive_lock(component, self.id);
        self.locks.push(component);
    }

    /// Apply every change to the cache and disk, then release locks.
    pub fn commit(mut self) -> Result<(), CacheError> {
        let result = self.apply();
        self.created_files.clear();
        self.finish();
        result
    }

    /// Discard every change, remove files this operation created, release locks.
    pub fn rollback(mut self) {
        self.discard();
        self.finish();
    }

    fn apply(&mut self) -> Result<(), CacheError> {
        let cache = self.cache();
        let deleted = std::mem::take(&mut self.deleted_files);
        let written: BTreeSet<FileId> = self
            .filled_up_to
            .keys()
            .copied()
            .chain(self.changes.keys().map(|(file_id, _)| *file_id))
            .filter(|file_id| !deleted.contains(file_id))
            .collect();

        if let Err(e) = self.write_out(&written) {
            tracing::error!(
                "Operation {} failed partway through commit, poisoning files {written:?}: {e}",
                self.id
            );
            for file_id in &written {
                cache.poison_file(*file_id);
            }
            return Err(e);
        }

        for file_id in deleted {
            cache.delete_file(file_id)?;
        }
        Ok(())
    }

    /// Extend, write and sync every file in `written`.
    fn write_out(&mut self, written: &BTreeSet<FileId>) -> Result<(), CacheError> {
        let cache = self.cache();
        for (file_id, pages) in std::mem::take(&mut self.filled_up_to) {
            if written.contains(&file_id) {
                cache.extend(file_id, pages)?;
            }
        }

        for ((file_id, page_index), mut page) in std::mem::take(&mut self.changes) {
            if !written.contains(&file_id) {
                continue;
            }
            page.seal();
            cache.store_page(file_id, page_index, &page)?;
        }

        for file_id in written {
            cache.sync(*file_id)?;
        }
        Ok(())
    }

    fn discard(&mut self) {
        self.changes.clear();
        self.filled_up_to.clear();
        self.deleted_files.clear();
        let cache = self.cache();
        for file_id in std::mem::take(&mut self.created_files) {
            if let Err(e) = cache.delete_file(file_id) {
                tracing::error!(
                    "Operation {} failed to remove file {file_id} on rollback: {e}",
                    self.id
                );
            }
        }
    }

    fn finish(&mut self) {
        self.manager.release_exclusive_locks(&self.locks, self.id);
        self.locks.clear();
        self.finished = true;
    }
}

impl PageSource for AtomicOperation<'_> {
    fn read_page(
        &self,
        file_id: FileId,
        page_index: PageIndex,
    ) -> Result<PageReadGuard<'_>, CacheError> {
        if let Some(page) = self.changes.get(&(file_id, page_index)) {
            return Ok(PageReadGuard::Local(page));
        }
        if self.deleted_files.contains(&file_id) {
            return Err(CacheError::UnknownFile(file_id));
        }
        self.cache().read_page(file_id, page_index)
    }

    fn filled_up_to(&self, file_id: FileId) -> Result<u64, CacheError> {
        Self::filled_up_to(self, file_id)
    }
}

impl Drop for AtomicOperation<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                "Atomic operation {} dropped without commit or rollback, rolling back",
                self.id
            );
            self.discard();
            self.finish();
        }
    }
}
