use std::ops::{Deref, DerefMut};

use crate::storage::page::{Page, PageHeader, PageType};

const RECORDS_COUNT_OFFSET: usize = PageHeader::SIZE;
const RECORDS_SIZE_OFFSET: usize = RECORDS_COUNT_OFFSET + 4;
const FILE_SIZE_OFFSET: usize = RECORDS_SIZE_OFFSET + 4;

/// Typed view of page 0 of a cluster data file.
///
/// `file_size` is the highest data page ever initialized; page 0 itself is
/// not counted.
pub struct ClusterState<P> {
    page: P,
}

impl<P: Deref<Target = Page>> ClusterState<P> {
    #[must_use]
    pub const fn new(page: P) -> Self {
        Self { page }
    }

    #[must_use]
    pub fn record_count(&self) -> u32 {
        self.page.read_u32(RECORDS_COUNT_OFFSET)
    }

    #[must_use]
    pub fn records_size(&self) -> u32 {
        self.page.read_u32(RECORDS_SIZE_OFFSET)
    }

    #[must_use]
    pub fn file_size(&self) -> u32 {
        self.page.read_u32(FILE_SIZE_OFFSET)
    }
}

impl<P: DerefMut<Target = Page>> ClusterState<P> {
    pub fn init(&mut self) {
        self.page.set_page_type(PageType::ClusterState);
        self.set_record_count(0);
        self.set_records_size(0);
        self.set_file_size(0);
    }

    pub fn set_record_count(&mut self, count: u32) {
        self.page.write_u32(RECORDS_COUNT_OFFSET, count);
    }

    pub fn set_records_size(&mut self, size: u32) {
        self.page.write_u32(RECORDS_SIZE_OFFSET, size);
    }

    pub fn set_file_size(&mut self, size: u32) {
        self.page.write_u32(FILE_SIZE_OFFSET, size);
    }
}
