//! Two-level free-space map.
//!
//! Page 0 of the map file is the root tree. Its leaf `g - 1` holds the max
//! bucket of leaf-group page `g`, and leaf `j` of group page `g` holds the
//! bucket of data page `j + (g - 1) * LEAF_COUNT`. Finding a page with enough
//! room therefore costs two page reads, and recording a page's free space two
//! page writes, however large the cluster grows.

#![allow(clippy::cast_possible_truncation)]

use super::page::{FreeSpacePage, LEAF_COUNT};
use super::{free_space_bucket, required_bucket};
use crate::storage::atomic::AtomicOperation;
use crate::storage::file_cache::{CacheError, FileCache, FileId, PageSource};
use crate::storage::page::PageIndex;

/// File extension of free-space map files.
pub const FREE_SPACE_MAP_EXTENSION: &str = ".fsm";

const ROOT_PAGE_INDEX: PageIndex = 0;

/// Free-space index for one cluster's data file.
pub struct FreeSpaceMap {
    file_id: FileId,
}

impl FreeSpaceMap {
    /// File name of the map belonging to cluster `name`.
    #[must_use]
    pub fn file_name(name: &str) -> String {
        format!("{name}{FREE_SPACE_MAP_EXTENSION}")
    }

    /// Create the map file with an empty root page.
    pub fn create(
        operation: &mut AtomicOperation<'_>,
        name: &str,
    ) -> Result<Self, FreeSpaceMapError> {
        let file_id = operation.add_file(&Self::file_name(name))?;
        let root = operation.add_page(file_id)?;
        debug_assert_eq!(root.page_index(), ROOT_PAGE_INDEX);
        FreeSpacePage::new(root).init();
        Ok(Self { file_id })
    }

    /// Open an existing map file.
    pub fn open(cache: &FileCache, name: &str) -> Result<Self, FreeSpaceMapError> {
        let file_id = cache.open_file(&Self::file_name(name))?;
        Ok(Self { file_id })
    }

    /// Whether a map file exists for cluster `name`.
    #[must_use]
    pub fn exists(cache: &FileCache, name: &str) -> bool {
        cache.exists(&Self::file_name(name))
    }

    #[must_use]
    pub const fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Schedule the map file for deletion when `operation` commits.
    pub fn delete(&self, operation: &mut AtomicOperation<'_>) -> Result<(), FreeSpaceMapError> {
        operation.delete_file(self.file_id)?;
        Ok(())
    }

    pub fn rename(&self, cache: &FileCache, new_name: &str) -> Result<(), FreeSpaceMapError> {
        cache.rename_file(self.file_id, &Self::file_name(new_name))?;
        Ok(())
    }

    pub fn close(&self, cache: &FileCache) -> Result<(), FreeSpaceMapError> {
        cache.close_file(self.file_id)?;
        Ok(())
    }

    /// Find a data page with more than `required_size` bytes free.
    ///
    /// `None` is a normal answer: the caller should allocate a new page.
    pub fn find_free_page(
        &self,
        source: &impl PageSource,
        required_size: usize,
    ) -> Result<Option<PageIndex>, FreeSpaceMapError> {
        let Some(required) = required_bucket(required_size) else {
            return Ok(None);
        };

        let group = {
            let root = FreeSpacePage::new(source.read_page(self.file_id, ROOT_PAGE_INDEX)?);
            match root.find_leaf(required) {
                Some(group) => group,
                None => return Ok(None),
            }
        };

        let group_page_index = group as PageIndex + 1;
        if group_page_index >= source.filled_up_to(self.file_id)? {
            return Ok(None);
        }
        let group_page = FreeSpacePage::new(source.read_page(self.file_id, group_page_index)?);
        Ok(group_page
            .find_leaf(required)
            .map(|local| (local + group * LEAF_COUNT) as PageIndex))
    }

    /// Record that data page `page_index` now has `free_bytes` free.
    ///
    /// Grows the map with fresh group pages as needed; never shrinks it.
    pub fn update_page_free_space(
        &self,
        operation: &mut AtomicOperation<'_>,
        page_index: PageIndex,
        free_bytes: usize,
    ) -> Result<(), FreeSpaceMapError> {
        let leaf_count = LEAF_COUNT as PageIndex;
        let group = page_index / leaf_count;
        if group >= leaf_count {
            return Err(FreeSpaceMapError::CapacityExceeded { page_index });
        }
        let group_page_index = group + 1;

        while operation.filled_up_to(self.file_id)? <= group_page_index {
            let page = operation.add_page(self.file_id)?;
            tracing::debug!(
                "Free-space map file {} grew to {} pages",
                self.file_id,
                page.page_index() + 1
            );
            FreeSpacePage::new(page).init();
        }

        // Both indexes are below LEAF_COUNT, checked above.
        let local = (page_index % leaf_count) as usize;
        let group_max =
            FreeSpacePage::new(operation.load_page_for_write(self.file_id, group_page_index)?)
                .update_leaf(local, free_space_bucket(free_bytes));
        FreeSpacePage::new(operation.load_page_for_write(self.file_id, ROOT_PAGE_INDEX)?)
            .update_leaf(group as usize, group_max);
        Ok(())
    }
}

/// Errors from the free-space map.
#[derive(Debug)]
pub enum FreeSpaceMapError {
    /// Page cache error.
    Cache(CacheError),
    /// Data page index beyond what the two-level tree can address.
    CapacityExceeded { page_index: PageIndex },
}

impl std::fmt::Display for FreeSpaceMapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cache(e) => write!(f, "cache error: {e}"),
            Self::CapacityExceeded { page_index } => {
                write!(
                    f,
                    "data page {page_index} exceeds free-space map capacity of {} pages",
                    LEAF_COUNT * LEAF_COUNT
                )
            }
        }
    }
}

impl std::error::Error for FreeSpaceMapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cache(e) => Some(e),
            Self::CapacityExceeded { .. } => None,
        }
    }
}

impl From<CacheError> for FreeSpaceMapError {
    fn from(e: CacheError) -> Self {
        Self::Cache(e)
    }
}
