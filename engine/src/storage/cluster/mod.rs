//! Paginated record store.
//!
//! A cluster is three files sharing a base name:
//!
//! - `{name}.pcl`: data pages. Page 0 is the [`ClusterState`], the rest are
//!   slotted [`ClusterPage`]s holding record chunks
//! - `{name}.cpm`: the [`PositionMap`] from logical position to head chunk
//! - `{name}.fsm`: the free-space map used to pick pages for new chunks
//!
//! Records larger than one page are split into a singly linked chain of
//! chunks, written head first.

mod chunk;
mod page;
mod paginated;
mod position_map;
mod state;

pub use chunk::{ChunkPointer, MAX_CHUNK_CONTENT};
pub use page::{ClusterPage, MAX_RECORD_SIZE};
pub use paginated::{CLUSTER_EXTENSION, PaginatedCluster};
pub use position_map::{POSITION_MAP_EXTENSION, PositionMap, RecordStatus};
pub use state::ClusterState;

use crate::storage::file_cache::CacheError;
use crate::storage::free_space::FreeSpaceMapError;
use crate::storage::page::PageIndex;

/// A record's payload with its type and version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub payload: Vec<u8>,
    pub version: u32,
    pub record_type: u8,
}

/// Metadata of a stored record, read from its head chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalPosition {
    pub position: u64,
    pub record_type: u8,
    pub version: u32,
    pub size: usize,
}

/// One chunk of a record's chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDebug {
    pub pointer: ChunkPointer,
    pub content_size: usize,
    pub is_head: bool,
}

/// Chunk chain of a record, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDebug {
    pub position: u64,
    pub chunks: Vec<ChunkDebug>,
}

/// Errors from cluster operations.
#[derive(Debug)]
pub enum ClusterError {
    /// Page cache error.
    Cache(CacheError),
    /// Free-space map error.
    FreeSpaceMap(FreeSpaceMapError),
    /// A record's chunk chain is inconsistent.
    BrokenRecord { cluster: String, position: u64 },
    /// A chunk expected to be live is missing.
    BrokenChunk {
        cluster: String,
        page_index: PageIndex,
        slot: u16,
    },
    /// The cluster still holds records.
    NotEmpty { cluster: String },
    /// A chunk could not be placed with any content.
    ChunkingStalled { cluster: String },
    /// The payload length does not fit the entry header.
    RecordTooLarge { cluster: String, size: usize },
    /// A record was created at a position that was never allocated.
    PositionNotAllocated { cluster: String, position: u64 },
    /// A cluster with this name already exists.
    AlreadyExists { name: String },
    /// No cluster with this name exists.
    NotFound { name: String },
}

impl std::fmt::Display for ClusterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cache(e) => write!(f, "cache error: {e}"),
            Self::FreeSpaceMap(e) => write!(f, "free-space map error: {e}"),
            Self::BrokenRecord { cluster, position } => {
                write!(f, "record {position} in cluster {cluster} is broken")
            }
            Self::BrokenChunk {
                cluster,
                page_index,
                slot,
            } => write!(
                f,
                "chunk at page {page_index} slot {slot} in cluster {cluster} is missing"
            ),
            Self::NotEmpty { cluster } => write!(f, "cluster {cluster} is not empty"),
            Self::ChunkingStalled { cluster } => {
                write!(f, "no page of cluster {cluster} can take another chunk")
            }
            Self::RecordTooLarge { cluster, size } => {
                write!(f, "record of {size} bytes is too large for cluster {cluster}")
            }
            Self::PositionNotAllocated { cluster, position } => {
                write!(f, "position {position} in cluster {cluster} is not allocated")
            }
            Self::AlreadyExists { name } => write!(f, "cluster {name} already exists"),
            Self::NotFound { name } => write!(f, "cluster {name} not found"),
        }
    }
}

impl std::error::Error for ClusterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cache(e) => Some(e),
            Self::FreeSpaceMap(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CacheError> for ClusterError {
    fn from(e: CacheError) -> Self {
        Self::Cache(e)
    }
}

impl From<FreeSpaceMapError> for ClusterError {
    fn from(e: FreeSpaceMapError) -> Self {
        Self::FreeSpaceMap(e)
    }
}
