//! Record entries and the chunks they are split into.
//!
//! A record entry is `[record_type u8][payload_len u32][payload]`. It is cut
//! into chunks, each stored as one slotted-page record laid out as
//! `[entry slice][is_head u8][next u64]`.

use super::page::MAX_RECORD_SIZE;
use crate::storage::page::PageIndex;

/// Size of the entry header in front of the payload.
pub const ENTRY_HEADER_SIZE: usize = 1 + 4;

/// Size of the per-chunk trailer.
pub const CHUNK_TRAILER_SIZE: usize = 1 + 8;

/// Most entry bytes a single chunk can carry.
pub const MAX_CHUNK_CONTENT: usize = MAX_RECORD_SIZE - CHUNK_TRAILER_SIZE;

const NO_NEXT_CHUNK: u64 = u64::MAX;
const SLOT_BITS: u32 = 16;

/// Location of a chunk: data page and slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkPointer {
    page_index: PageIndex,
    slot: u16,
}

impl ChunkPointer {
    #[must_use]
    pub const fn new(page_index: PageIndex, slot: u16) -> Self {
        Self { page_index, slot }
    }

    #[must_use]
    pub const fn page_index(self) -> PageIndex {
        self.page_index
    }

    #[must_use]
    pub const fn slot(self) -> u16 {
        self.slot
    }

    fn pack(self) -> u64 {
        (self.page_index << SLOT_BITS) | u64::from(self.slot)
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn unpack(raw: u64) -> Option<Self> {
        if raw == NO_NEXT_CHUNK {
            return None;
        }
        Some(Self {
            page_index: raw >> SLOT_BITS,
            slot: raw as u16,
        })
    }
}

/// Encoded form of an optional next-chunk link.
#[must_use]
pub fn encode_next(next: Option<ChunkPointer>) -> u64 {
    match next {
        Some(pointer) => pointer.pack(),
        None => NO_NEXT_CHUNK,
    }
}

/// Byte offset of the `next` link inside a chunk of `chunk_len` bytes.
#[must_use]
pub const fn next_offset(chunk_len: usize) -> Option<usize> {
    chunk_len.checked_sub(8)
}

/// Serialize a record entry. `None` if the payload length overflows `u32`.
#[must_use]
pub fn encode_entry(record_type: u8, payload: &[u8]) -> Option<Vec<u8>> {
    let len = u32::try_from(payload.len()).ok()?;
    let mut entry = Vec::with_capacity(ENTRY_HEADER_SIZE + payload.len());
    entry.push(record_type);
    entry.extend_from_slice(&len.to_le_bytes());
    entry.extend_from_slice(payload);
    Some(entry)
}

/// Type and declared payload length from the start of an entry.
#[must_use]
pub fn decode_entry_header(bytes: &[u8]) -> Option<(u8, usize)> {
    let header = bytes.get(..ENTRY_HEADER_SIZE)?;
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
    Some((header[0], len as usize))
}

/// Split a complete entry into type and payload, checking the declared length.
#[must_use]
pub fn decode_entry(entry: &[u8]) -> Option<(u8, &[u8])> {
    let (record_type, len) = decode_entry_header(entry)?;
    let payload = &entry[ENTRY_HEADER_SIZE..];
    (payload.len() == len).then_some((record_type, payload))
}

/// Build the bytes of one chunk.
#[must_use]
pub fn encode_chunk(content: &[u8], is_head: bool, next: Option<ChunkPointer>) -> Vec<u8> {
    let mut chunk = Vec::with_capacity(content.len() + CHUNK_TRAILER_SIZE);
    chunk.extend_from_slice(content);
    chunk.push(u8::from(is_head));
    chunk.extend_from_slice(&encode_next(next).to_le_bytes());
    chunk
}

/// A chunk read back from a page.
#[derive(Debug, Clone, Copy)]
pub struct ChunkView<'a> {
    pub content: &'a [u8],
    pub is_head: bool,
    pub next: Option<ChunkPointer>,
}

/// Parse the bytes of one chunk. `None` if they are too short to hold a trailer.
#[must_use]
pub fn decode_chunk(bytes: &[u8]) -> Option<ChunkView<'_>> {
    let content_len = bytes.len().checked_sub(CHUNK_TRAILER_SIZE)?;
    let (content, trailer) = bytes.split_at(content_len);
    let mut next = [0u8; 8];
    next.copy_from_slice(&trailer[1..]);
    Some(ChunkView {
        content,
        is_head: trailer[0] != 0,
        next: ChunkPointer::unpack(u64::from_le_bytes(next)),
    })
}
