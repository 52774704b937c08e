//! Maps logical record positions to the location of their head chunk.
//!
//! Page 0 holds the number of positions ever allocated. Every later page
//! holds a dense array of fixed-size entries, so position `p` is found on
//! page `1 + p / ENTRIES_PER_PAGE` without any search.

use super::chunk::ChunkPointer;
use crate::storage::atomic::AtomicOperation;
use crate::storage::file_cache::{CacheError, FileCache, FileId, PageReadGuard, PageSource};
use crate::storage::page::{PAGE_SIZE, PageHeader, PageIndex, PageType};

/// File extension of position map files.
pub const POSITION_MAP_EXTENSION: &str = ".cpm";

const HEADER_PAGE_INDEX: PageIndex = 0;
const SIZE_OFFSET: usize = PageHeader::SIZE;

const ENTRY_SIZE: usize = 16;
const ENTRIES_PER_PAGE: u64 = ((PAGE_SIZE - PageHeader::SIZE) / ENTRY_SIZE) as u64;

const STATUS_OFFSET: usize = 0;
const SLOT_OFFSET: usize = 2;
const PAGE_OFFSET: usize = 8;

/// Lifecycle state of a record position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordStatus {
    NotExistent = 0,
    Allocated = 1,
    Filled = 2,
    Removed = 3,
}

impl From<u8> for RecordStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Allocated,
            2 => Self::Filled,
            3 => Self::Removed,
            _ => Self::NotExistent,
        }
    }
}

// Entry offsets stay below PAGE_SIZE.
#[allow(clippy::cast_possible_truncation)]
const fn locate(position: u64) -> (PageIndex, usize) {
    let page_index = 1 + position / ENTRIES_PER_PAGE;
    let offset = PageHeader::SIZE + (position % ENTRIES_PER_PAGE) as usize * ENTRY_SIZE;
    (page_index, offset)
}

/// Position map of one cluster.
pub struct PositionMap {
    file_id: FileId,
}

impl PositionMap {
    #[must_use]
    pub fn file_name(name: &str) -> String {
        format!("{name}{POSITION_MAP_EXTENSION}")
    }

    /// Create the map file with an empty header page.
    pub fn create(operation: &mut AtomicOperation<'_>, name: &str) -> Result<Self, CacheError> {
        let file_id = operation.add_file(&Self::file_name(name))?;
        let mut header = operation.add_page(file_id)?;
        header.set_page_type(PageType::PositionMap);
        header.write_u64(SIZE_OFFSET, 0);
        Ok(Self { file_id })
    }

    pub fn open(cache: &FileCache, name: &str) -> Result<Self, CacheError> {
        let file_id = cache.open_file(&Self::file_name(name))?;
        Ok(Self { file_id })
    }

    #[must_use]
    pub const fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn delete(&self, operation: &mut AtomicOperation<'_>) -> Result<(), CacheError> {
        operation.delete_file(self.file_id)
    }

    pub fn rename(&self, cache: &FileCache, new_name: &str) -> Result<(), CacheError> {
        cache.rename_file(self.file_id, &Self::file_name(new_name))
    }

    pub fn close(&self, cache: &FileCache) -> Result<(), CacheError> {
        cache.close_file(self.file_id)
    }

    /// Number of positions ever allocated.
    pub fn size(&self, source: &impl PageSource) -> Result<u64, CacheError> {
        Ok(source
            .read_page(self.file_id, HEADER_PAGE_INDEX)?
            .read_u64(SIZE_OFFSET))
    }

    /// Reserve the next position without a record behind it.
    pub fn allocate(&self, operation: &mut AtomicOperation<'_>) -> Result<u64, CacheError> {
        self.append(operation, RecordStatus::Allocated, None)
    }

    /// Store a head locator at the next position.
    pub fn add(
        &self,
        operation: &mut AtomicOperation<'_>,
        head: ChunkPointer,
    ) -> Result<u64, CacheError> {
        self.append(operation, RecordStatus::Filled, Some(head))
    }

    /// Point an existing position at `head` and mark it filled.
    pub fn update(
        &self,
        operation: &mut AtomicOperation<'_>,
        position: u64,
        head: ChunkPointer,
    ) -> Result<(), CacheError> {
        self.write_entry(operation, position, RecordStatus::Filled, Some(head))
    }

    /// Mark a position removed. The locator is left in place.
    pub fn remove(
        &self,
        operation: &mut AtomicOperation<'_>,
        position: u64,
    ) -> Result<(), CacheError> {
        let (page_index, offset) = locate(position);
        operation
            .load_page_for_write(self.file_id, page_index)?
            .write_u8(offset + STATUS_OFFSET, RecordStatus::Removed as u8);
        Ok(())
    }

    /// Head locator of a filled position.
    pub fn get(
        &self,
        source: &impl PageSource,
        position: u64,
    ) -> Result<Option<ChunkPointer>, CacheError> {
        Ok(match self.entry(source, position)? {
            (RecordStatus::Filled, head) => head,
            _ => None,
        })
    }

    /// Status of a position, with the stored locator if it has one.
    pub fn entry(
        &self,
        source: &impl PageSource,
        position: u64,
    ) -> Result<(RecordStatus, Option<ChunkPointer>), CacheError> {
        if position >= self.size(source)? {
            return Ok((RecordStatus::NotExistent, None));
        }
        let (page_index, offset) = locate(position);
        let page = source.read_page(self.file_id, page_index)?;
        let status = RecordStatus::from(page.read_u8(offset + STATUS_OFFSET));
        let head = match status {
            RecordStatus::Filled | RecordStatus::Removed => Some(ChunkPointer::new(
                page.read_u64(offset + PAGE_OFFSET),
                page.read_u16(offset + SLOT_OFFSET),
            )),
            RecordStatus::NotExistent | RecordStatus::Allocated => None,
        };
        Ok((status, head))
    }

    pub fn status(
        &self,
        source: &impl PageSource,
        position: u64,
    ) -> Result<RecordStatus, CacheError> {
        Ok(self.entry(source, position)?.0)
    }

    /// Smallest filled position.
    pub fn first(&self, source: &impl PageSource) -> Result<Option<u64>, CacheError> {
        self.ceiling(source, 0)
    }

    /// Largest filled position.
    pub fn last(&self, source: &impl PageSource) -> Result<Option<u64>, CacheError> {
        self.floor(source, u64::MAX)
    }

    /// Smallest filled position strictly above `position`.
    pub fn higher(
        &self,
        source: &impl PageSource,
        position: u64,
    ) -> Result<Option<u64>, CacheError> {
        match position.checked_add(1) {
            Some(next) => self.ceiling(source, next),
            None => Ok(None),
        }
    }

    /// Smallest filled position at or above `position`.
    pub fn ceiling(
        &self,
        source: &impl PageSource,
        position: u64,
    ) -> Result<Option<u64>, CacheError> {
        let size = self.size(source)?;
        self.find_filled(source, position..size)
    }

    /// Largest filled position strictly below `position`.
    pub fn lower(
        &self,
        source: &impl PageSource,
        position: u64,
    ) -> Result<Option<u64>, CacheError> {
        match position.checked_sub(1) {
            Some(previous) => self.floor(source, previous),
            None => Ok(None),
        }
    }

    /// Largest filled position at or below `position`.
    pub fn floor(
        &self,
        source: &impl PageSource,
        position: u64,
    ) -> Result<Option<u64>, CacheError> {
        let size = self.size(source)?;
        let end = position.saturating_add(1).min(size);
        self.find_filled(source, (0..end).rev())
    }

    /// First filled position in `positions`, reading each entry page once.
    fn find_filled<S: PageSource>(
        &self,
        source: &S,
        positions: impl Iterator<Item = u64>,
    ) -> Result<Option<u64>, CacheError> {
        let mut current: Option<(PageIndex, PageReadGuard<'_>)> = None;
        for position in positions {
            let (page_index, offset) = locate(position);
            if current
                .as_ref()
                .is_none_or(|(loaded, _)| *loaded != page_index)
            {
                current = Some((page_index, source.read_page(self.file_id, page_index)?));
            }
            if let Some((_, page)) = &current
                && RecordStatus::from(page.read_u8(offset + STATUS_OFFSET)) == RecordStatus::Filled
            {
                return Ok(Some(position));
            }
        }
        Ok(None)
    }

    fn append(
        &self,
        operation: &mut AtomicOperation<'_>,
        status: RecordStatus,
        head: Option<ChunkPointer>,
    ) -> Result<u64, CacheError> {
        let position = self.size(&*operation)?;
        let (page_index, _) = locate(position);
        while operation.filled_up_to(self.file_id)? <= page_index {
            operation
                .add_page(self.file_id)?
                .set_page_type(PageType::PositionMap);
        }

        self.write_entry(operation, position, status, head)?;
        operation
            .load_page_for_write(self.file_id, HEADER_PAGE_INDEX)?
            .write_u64(SIZE_OFFSET, position + 1);
        Ok(position)
    }

    fn write_entry(
        &self,
        operation: &mut AtomicOperation<'_>,
        position: u64,
        status: RecordStatus,
        head: Option<ChunkPointer>,
    ) -> Result<(), CacheError> {
        let (page_index, offset) = locate(position);
        let mut page = operation.load_page_for_write(self.file_id, page_index)?;
        page.write_u8(offset + STATUS_OFFSET, status as u8);
        let (head_page, head_slot) = head.map_or((0, 0), |head| (head.page_index(), head.slot()));
        page.write_u16(offset + SLOT_OFFSET, head_slot);
        page.write_u64(offset + PAGE_OFFSET, head_page);
        Ok(())
    }
}
