//! Page types and constants for the storage engine.
//!
//! Every file the engine manages (cluster data, free-space map, position map)
//! is a sequence of 8KB pages. Each page starts with the same 8-byte header.

use std::sync::Arc;

use crate::storage::buffer_pool::BufferPool;

/// Page size in bytes (8KB).
pub const PAGE_SIZE: usize = 8192;

/// Page size as u64 for offset calculations.
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// A page index within one file (0-indexed).
pub type PageIndex = u64;

/// Page type identifiers stored in page headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Page added to a file but never initialized.
    Unused = 0x00,
    /// Cluster state (page 0 of a cluster data file)
    ClusterState = 0x01,
    /// Slotted page holding record chunks
    ClusterData = 0x02,
    /// Free-space tree page
    FreeSpaceMap = 0x03,
    /// Position map header or bucket page
    PositionMap = 0x04,
}

impl TryFrom<u8> for PageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Unused),
            0x01 => Ok(Self::ClusterState),
            0x02 => Ok(Self::ClusterData),
            0x03 => Ok(Self::FreeSpaceMap),
            0x04 => Ok(Self::PositionMap),
            _ => Err(value),
        }
    }
}

/// Common page header present at the start of every page.
///
/// Layout:
/// - `page_type`: 1 byte
/// - `flags`: 1 byte
/// - `checksum`: 4 bytes (CRC32)
/// - `reserved`: 2 bytes
///
/// Total: 8 bytes
#[derive(Debug, Copy, Clone)]
pub struct PageHeader {
    pub page_type: PageType,
    pub flags: u8,
    pub checksum: u32,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 8;

    /// Usable space in a page after the header.
    pub const USABLE_SPACE: usize = PAGE_SIZE - Self::SIZE;

    /// Serialize the header to bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.page_type as u8;
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Deserialize a header from bytes.
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Result<Self, PageError> {
        let page_type = PageType::try_from(bytes[0]).map_err(PageError::InvalidPageType)?;
        let flags = bytes[1];
        let checksum = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);

        Ok(Self {
            page_type,
            flags,
            checksum,
        })
    }
}

/// A raw page buffer.
///
/// Pages leased from a [`BufferPool`] hand their buffer back when dropped.
pub struct Page {
    data: Option<Box<[u8; PAGE_SIZE]>>,
    pool: Option<Arc<BufferPool>>,
}

impl Page {
    /// Create a new zeroed page that does not belong to any pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Some(Box::new([0u8; PAGE_SIZE])),
            pool: None,
        }
    }

    /// Wrap a buffer leased from `pool`; the buffer is returned on drop.
    #[must_use]
    pub(crate) const fn from_pool(buffer: Box<[u8; PAGE_SIZE]>, pool: Arc<BufferPool>) -> Self {
        Self {
            data: Some(buffer),
            pool: Some(pool),
        }
    }

    /// Create an unpooled copy of another page.
    #[must_use]
    pub fn copy_of(other: &Self) -> Self {
        let mut page = Self::new();
        page.as_bytes_mut().copy_from_slice(other.as_bytes());
        page
    }

    /// Get the raw page data.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        match &self.data {
            Some(data) => data,
            None => unreachable!("page buffer is only taken on drop"),
        }
    }

    /// Get mutable access to the raw page data.
    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        match &mut self.data {
            Some(data) => data,
            None => unreachable!("page buffer is only taken on drop"),
        }
    }

    /// Read the page header.
    pub fn header(&self) -> Result<PageHeader, PageError> {
        let mut bytes = [0u8; PageHeader::SIZE];
        bytes.copy_from_slice(self.read_bytes(0, PageHeader::SIZE));
        PageHeader::from_bytes(bytes)
    }

    /// Page type byte from the header.
    pub fn page_type(&self) -> Result<PageType, PageError> {
        PageType::try_from(self.read_u8(0)).map_err(PageError::InvalidPageType)
    }

    /// Set the page type byte in the header.
    pub fn set_page_type(&mut self, page_type: PageType) {
        self.write_u8(0, page_type as u8);
    }

    /// Read bytes at a specific offset.
    #[must_use]
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.as_bytes()[offset..offset + len]
    }

    /// Write bytes at a specific offset.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.as_bytes_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Read a u8 at the given offset.
    #[must_use]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.as_bytes()[offset]
    }

    /// Write a u8 at the given offset.
    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.as_bytes_mut()[offset] = value;
    }

    /// Read a u16 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u16(&self, offset: usize) -> u16 {
        let data = self.as_bytes();
        u16::from_le_bytes([data[offset], data[offset + 1]])
    }

    /// Write a u16 (little-endian) at the given offset.
    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// Read a u32 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        let data = self.as_bytes();
        u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ])
    }

    /// Write a u32 (little-endian) at the given offset.
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// Read an i32 (little-endian) at the given offset.
    #[must_use]
    pub fn read_i32(&self, offset: usize) -> i32 {
        i32::from_le_bytes(self.read_u32(offset).to_le_bytes())
    }

    /// Write an i32 (little-endian) at the given offset.
    pub fn write_i32(&mut self, offset: usize, value: i32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// Read a u64 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.read_bytes(offset, 8));
        u64::from_le_bytes(bytes)
    }

    /// Write a u64 (little-endian) at the given offset.
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// Move `len` bytes from `from` to `to` within the page. Ranges may overlap.
    pub fn move_bytes(&mut self, from: usize, to: usize, len: usize) {
        self.as_bytes_mut().copy_within(from..from + len, to);
    }

    /// Compute CRC32 checksum of the page data (excluding the checksum field itself).
    /// Assumes checksum is stored at bytes 2-5 of the header.
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        let data = self.as_bytes();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data[0..2]); // page_type + flags
        hasher.update(&[0u8; 4]); // zero out checksum field
        hasher.update(&data[6..]);
        hasher.finalize()
    }

    /// Store the current checksum in the header.
    pub fn seal(&mut self) {
        let checksum = self.compute_checksum();
        self.write_u32(2, checksum);
    }

    /// Verify the stored checksum.
    ///
    /// Pages that were never initialized (type `Unused`) carry no checksum.
    pub fn verify(&self) -> Result<(), PageError> {
        if self.page_type()? == PageType::Unused {
            return Ok(());
        }
        let expected = self.read_u32(2);
        let actual = self.compute_checksum();
        if expected != actual {
            return Err(PageError::ChecksumMismatch { expected, actual });
        }
        Ok(())
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if let (Some(pool), Some(buffer)) = (self.pool.take(), self.data.take()) {
            pool.return_buffer(buffer);
        }
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("first_16_bytes", &&self.as_bytes()[..16])
            .finish_non_exhaustive()
    }
}

/// Errors related to page operations.
#[derive(Debug)]
pub enum PageError {
    /// Invalid page type byte.
    InvalidPageType(u8),
    /// Checksum mismatch.
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for PageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPageType(v) => write!(f, "invalid page type: 0x{v:02x}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

impl std::error::Error for PageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_header_roundtrip() {
        let header = PageHeader {
            page_type: PageType::ClusterData,
            flags: 0x42,
            checksum: 0xDEAD_BEEF,
        };

        let bytes = header.to_bytes();
        let restored = PageHeader::from_bytes(bytes).expect("should parse");

        assert_eq!(restored.page_type, PageType::ClusterData);
        assert_eq!(restored.flags, 0x42);
        assert_eq!(restored.checksum, 0xDEAD_BEEF);
    }

    #[test]
    fn test_page_read_write() {
        let mut page = Page::new();

        page.write_u8(0, 0xFF);
        assert_eq!(page.read_u8(0), 0xFF);

        page.write_u16(50, 0xBEEF);
        assert_eq!(page.read_u16(50), 0xBEEF);

        page.write_u32(100, 0x1234_5678);
        assert_eq!(page.read_u32(100), 0x1234_5678);

        page.write_i32(150, -42);
        assert_eq!(page.read_i32(150), -42);

        page.write_u64(200, 0x0102_0304_0506_0708);
        assert_eq!(page.read_u64(200), 0x0102_0304_0506_0708);

        page.write_bytes(500, b"hello");
        assert_eq!(page.read_bytes(500, 5), b"hello");

        page.move_bytes(500, 502, 5);
        assert_eq!(page.read_bytes(502, 5), b"hello");
    }

    #[test]
    fn test_page_type_conversion() {
        assert_eq!(PageType::try_from(0x00), Ok(PageType::Unused));
        assert_eq!(PageType::try_from(0x03), Ok(PageType::FreeSpaceMap));
        assert!(PageType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_seal_and_verify() {
        let mut page = Page::new();
        page.set_page_type(PageType::ClusterData);
        page.write_bytes(1000, b"payload");
        page.seal();
        assert!(page.verify().is_ok());

        page.write_u8(1000, b'P');
        assert!(matches!(
            page.verify(),
            Err(PageError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_unused_page_skips_checksum() {
        let mut page = Page::new();
        page.write_u8(4000, 7);
        assert!(page.verify().is_ok());
    }

    #[test]
    fn test_copy_of_is_independent() {
        let mut original = Page::new();
        original.write_u32(64, 99);
        let mut copy = Page::copy_of(&original);
        copy.write_u32(64, 100);
        assert_eq!(original.read_u32(64), 99);
        assert_eq!(copy.read_u32(64), 100);
    }
}
