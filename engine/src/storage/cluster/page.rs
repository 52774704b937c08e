//! Slotted page holding record chunks.
//!
//! Layout after the common page header:
//!
//! ```text
//! 8   free-list head   slot + 1 of the first reusable tombstone, 0 = none
//! 12  free position    start of the record area (grows down from PAGE_SIZE)
//! 16  free space       bytes not used by index items or live entries
//! 20  entries count    live entries
//! 24  indexes length   index items, live or tombstoned
//! 28  index items      [pointer u32][version u32] each
//! ..                   free space
//! ..  entries          [entry size i32][slot u32][len u32][bytes]
//! ```
//!
//! A tombstoned index item has the deleted flag set and keeps the next
//! free-list link (slot + 1) in its low bits. A deleted entry keeps its place
//! in the record area with a negated size until the page is defragmented.

use std::ops::{Deref, DerefMut};

use crate::storage::page::{PAGE_SIZE, Page, PageHeader, PageType};

const FREE_LIST_HEADER_OFFSET: usize = PageHeader::SIZE;
const FREE_POSITION_OFFSET: usize = FREE_LIST_HEADER_OFFSET + 4;
const FREE_SPACE_COUNTER_OFFSET: usize = FREE_POSITION_OFFSET + 4;
const ENTRIES_COUNT_OFFSET: usize = FREE_SPACE_COUNTER_OFFSET + 4;
const INDEXES_LENGTH_OFFSET: usize = ENTRIES_COUNT_OFFSET + 4;
const INDEXES_OFFSET: usize = INDEXES_LENGTH_OFFSET + 4;

const INDEX_ITEM_SIZE: usize = 4 + 4;
const ENTRY_HEADER_SIZE: usize = 3 * 4;

const DELETED_FLAG: u32 = 1 << 16;
const POSITION_MASK: u32 = 0xFFFF;

/// Largest record a single empty page can hold.
pub const MAX_RECORD_SIZE: usize = PAGE_SIZE - INDEXES_OFFSET - INDEX_ITEM_SIZE - ENTRY_HEADER_SIZE;

const fn index_offset(slot: usize) -> usize {
    INDEXES_OFFSET + slot * INDEX_ITEM_SIZE
}

// Entry positions, sizes and slot numbers are all bounded by PAGE_SIZE.
#[allow(clippy::cast_possible_truncation)]
const fn small(value: usize) -> u32 {
    value as u32
}

/// Typed view of a cluster data page.
pub struct ClusterPage<P> {
    page: P,
}

impl<P: Deref<Target = Page>> ClusterPage<P> {
    #[must_use]
    pub const fn new(page: P) -> Self {
        Self { page }
    }

    fn field(&self, offset: usize) -> usize {
        self.page.read_u32(offset) as usize
    }

    fn pointer(&self, slot: usize) -> u32 {
        self.page.read_u32(index_offset(slot))
    }

    /// Entry position of a live slot.
    fn entry_position(&self, slot: u16) -> Option<usize> {
        let slot = usize::from(slot);
        if slot >= self.indexes_length() {
            return None;
        }
        let pointer = self.pointer(slot);
        if pointer & DELETED_FLAG != 0 {
            return None;
        }
        Some((pointer & POSITION_MASK) as usize)
    }

    /// Bytes not used by index items or live entries.
    #[must_use]
    pub fn free_space(&self) -> usize {
        self.field(FREE_SPACE_COUNTER_OFFSET)
    }

    /// Largest record an append could store right now.
    #[must_use]
    pub fn max_record_size(&self) -> usize {
        let max_entry_size = if self.field(FREE_LIST_HEADER_OFFSET) > 0 {
            self.free_space()
        } else {
            self.free_space().saturating_sub(INDEX_ITEM_SIZE)
        };
        max_entry_size.saturating_sub(ENTRY_HEADER_SIZE)
    }

    /// Largest record `slot` could hold after being deleted with its tombstone
    /// kept and re-appended in place.
    #[must_use]
    pub fn reusable_record_size(&self, slot: u16) -> Option<usize> {
        let position = self.entry_position(slot)?;
        Some(self.free_space() + self.field(position) - ENTRY_HEADER_SIZE)
    }

    /// Number of live records.
    #[must_use]
    pub fn records_count(&self) -> usize {
        self.field(ENTRIES_COUNT_OFFSET)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records_count() == 0
    }

    /// Number of index items, including tombstones.
    #[must_use]
    pub fn indexes_length(&self) -> usize {
        self.field(INDEXES_LENGTH_OFFSET)
    }

    /// Whether `slot` holds no live record. Slots past the index array count as deleted.
    #[must_use]
    pub fn is_deleted(&self, slot: u16) -> bool {
        self.entry_position(slot).is_none()
    }

    /// Length of the record in `slot`.
    #[must_use]
    pub fn record_size(&self, slot: u16) -> Option<usize> {
        let position = self.entry_position(slot)?;
        Some(self.field(position + 8))
    }

    /// Bytes of the record in `slot`.
    #[must_use]
    pub fn record_bytes(&self, slot: u16) -> Option<&[u8]> {
        let position = self.entry_position(slot)?;
        let len = self.field(position + 8);
        Some(self.page.read_bytes(position + ENTRY_HEADER_SIZE, len))
    }

    /// Version stored in the index item of a live slot.
    #[must_use]
    pub fn record_version(&self, slot: u16) -> Option<u32> {
        self.entry_position(slot)?;
        Some(self.page.read_u32(index_offset(usize::from(slot)) + 4))
    }

    /// Live slots in ascending order.
    #[must_use]
    pub fn live_slots(&self) -> Vec<u16> {
        (0..self.indexes_length())
            .filter_map(|slot| u16::try_from(slot).ok())
            .filter(|slot| !self.is_deleted(*slot))
            .collect()
    }
}

impl<P: DerefMut<Target = Page>> ClusterPage<P> {
    fn set_field(&mut self, offset: usize, value: usize) {
        self.page.write_u32(offset, small(value));
    }

    /// Format an empty page.
    pub fn init(&mut self) {
        self.page.set_page_type(PageType::ClusterData);
        self.set_field(FREE_LIST_HEADER_OFFSET, 0);
        self.set_field(FREE_POSITION_OFFSET, PAGE_SIZE);
        self.set_field(FREE_SPACE_COUNTER_OFFSET, PAGE_SIZE - INDEXES_OFFSET);
        self.set_field(ENTRIES_COUNT_OFFSET, 0);
        self.set_field(INDEXES_LENGTH_OFFSET, 0);
    }

    /// Store a record and return its slot, or `None` if the page is too full.
    ///
    /// A tombstoned `hint_slot` is reused in preference to the free list, so a
    /// record deleted and re-appended on the same page keeps its slot.
    pub fn append_record(
        &mut self,
        version: u32,
        record: &[u8],
        hint_slot: Option<u16>,
    ) -> Option<u16> {
        let entry_size = record.len() + ENTRY_HEADER_SIZE;
        let indexes_length = self.indexes_length();

        let reused_slot = match hint_slot {
            Some(hint)
                if usize::from(hint) < indexes_length
                    && self.pointer(usize::from(hint)) & DELETED_FLAG != 0 =>
            {
                Some(usize::from(hint))
            }
            _ => self.field(FREE_LIST_HEADER_OFFSET).checked_sub(1),
        };

        let needed = match reused_slot {
            Some(_) => entry_size,
            None => entry_size + INDEX_ITEM_SIZE,
        };
        if self.free_space() < needed {
            return None;
        }

        let indexes_end = match reused_slot {
            Some(_) => index_offset(indexes_length),
            None => index_offset(indexes_length + 1),
        };
        if self.field(FREE_POSITION_OFFSET) < indexes_end + entry_size {
            self.defragment();
        }
        let free_position = self.field(FREE_POSITION_OFFSET) - entry_size;

        let slot = match reused_slot {
            Some(slot) => {
                self.unlink_free_slot(slot);
                slot
            }
            None => {
                self.set_field(INDEXES_LENGTH_OFFSET, indexes_length + 1);
                indexes_length
            }
        };
        let slot_number = u16::try_from(slot).ok()?;

        self.set_field(FREE_SPACE_COUNTER_OFFSET, self.free_space() - needed);
        self.set_field(index_offset(slot), free_position);
        self.page.write_u32(index_offset(slot) + 4, version);

        self.set_field(free_position, entry_size);
        self.set_field(free_position + 4, slot);
        self.set_field(free_position + 8, record.len());
        self.page.write_bytes(free_position + ENTRY_HEADER_SIZE, record);

        self.set_field(FREE_POSITION_OFFSET, free_position);
        self.set_field(ENTRIES_COUNT_OFFSET, self.records_count() + 1);
        Some(slot_number)
    }

    /// Overwrite the record in `slot` without moving it.
    ///
    /// Writes at most the record's current capacity and returns the number of
    /// bytes written. `version`, when given, replaces the stored version.
    pub fn replace_record(&mut self, slot: u16, record: &[u8], version: Option<u32>) -> usize {
        let Some(position) = self.entry_position(slot) else {
            return 0;
        };
        if let Some(version) = version {
            self.page.write_u32(index_offset(usize::from(slot)) + 4, version);
        }

        let capacity = self.field(position) - ENTRY_HEADER_SIZE;
        let written = record.len().min(capacity);
        self.set_field(position + 8, written);
        self.page.write_bytes(position + ENTRY_HEADER_SIZE, &record[..written]);
        written
    }

    /// Overwrite eight bytes inside the record in `slot`.
    pub fn set_record_u64(&mut self, slot: u16, offset: usize, value: u64) -> bool {
        match self.entry_position(slot) {
            Some(position) if offset + 8 <= self.field(position + 8) => {
                self.page.write_u64(position + ENTRY_HEADER_SIZE + offset, value);
                true
            }
            _ => false,
        }
    }

    /// Delete the record in `slot` and return its bytes.
    ///
    /// The index item normally stays behind as a reusable tombstone. Without
    /// `keep_tombstone`, an item at the end of the index array is dropped
    /// instead, returning its space to the page.
    pub fn delete_record(&mut self, slot: u16, keep_tombstone: bool) -> Option<Vec<u8>> {
        let position = self.entry_position(slot)?;
        let slot = usize::from(slot);

        let entry_size = self.field(position);
        let len = self.field(position + 8);
        let record = self
            .page
            .read_bytes(position + ENTRY_HEADER_SIZE, len)
            .to_vec();

        self.page.write_i32(position, -i32::try_from(entry_size).ok()?);
        self.set_field(FREE_SPACE_COUNTER_OFFSET, self.free_space() + entry_size);
        self.set_field(ENTRIES_COUNT_OFFSET, self.records_count() - 1);

        let indexes_length = self.indexes_length();
        if !keep_tombstone && slot + 1 == indexes_length {
            self.page.write_bytes(index_offset(slot), &[0u8; INDEX_ITEM_SIZE]);
            self.set_field(INDEXES_LENGTH_OFFSET, slot);
            self.set_field(
                FREE_SPACE_COUNTER_OFFSET,
                self.free_space() + INDEX_ITEM_SIZE,
            );
        } else {
            let head = self.page.read_u32(FREE_LIST_HEADER_OFFSET);
            self.page.write_u32(index_offset(slot), DELETED_FLAG | head);
            self.page.write_u32(index_offset(slot) + 4, 0);
            self.set_field(FREE_LIST_HEADER_OFFSET, slot + 1);
        }
        Some(record)
    }

    /// Remove a tombstoned slot from the free list.
    fn unlink_free_slot(&mut self, slot: usize) {
        let target = small(slot + 1);
        let after_target = self.pointer(slot) & POSITION_MASK;

        let head = self.page.read_u32(FREE_LIST_HEADER_OFFSET);
        if head == target {
            self.page.write_u32(FREE_LIST_HEADER_OFFSET, after_target);
            return;
        }

        let mut current = head;
        while current != 0 {
            let link_offset = index_offset(current as usize - 1);
            let next = self.page.read_u32(link_offset) & POSITION_MASK;
            if next == target {
                self.page.write_u32(link_offset, DELETED_FLAG | after_target);
                return;
            }
            current = next;
        }
    }

    /// Pack live entries against the end of the page, removing holes.
    fn defragment(&mut self) {
        let live: Vec<(usize, Vec<u8>)> = (0..self.indexes_length())
            .filter_map(|slot| {
                let pointer = self.pointer(slot);
                if pointer & DELETED_FLAG != 0 {
                    return None;
                }
                let position = (pointer & POSITION_MASK) as usize;
                let size = self.field(position);
                Some((slot, self.page.read_bytes(position, size).to_vec()))
            })
            .collect();

        let mut free_position = PAGE_SIZE;
        for (slot, entry) in live {
            free_position -= entry.len();
            self.page.write_bytes(free_position, &entry);
            self.set_field(index_offset(slot), free_position);
        }
        self.set_field(FREE_POSITION_OFFSET, free_position);
    }
}
