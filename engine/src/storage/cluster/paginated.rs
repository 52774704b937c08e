use std::sync::Arc;

use parking_lot::RwLock;

use super::chunk::{self, CHUNK_TRAILER_SIZE, ChunkPointer};
use super::page::{ClusterPage, MAX_RECORD_SIZE};
use super::position_map::{PositionMap, RecordStatus};
use super::state::ClusterState;
use super::{ChunkDebug, ClusterError, PhysicalPosition, RawRecord, RecordDebug};
use crate::storage::atomic::{AtomicOperation, AtomicOperationsManager, ComponentId};
use crate::storage::file_cache::{CacheError, FileCache, FileId, PageReadGuard, PageSource};
use crate::storage::free_space::{FreeSpaceMap, FreeSpaceMapError, NORMALIZATION_INTERVAL};
use crate::storage::page::{PAGE_SIZE, PageIndex};

/// File extension of cluster data files.
pub const CLUSTER_EXTENSION: &str = ".pcl";

const STATE_PAGE_INDEX: PageIndex = 0;
const REBUILD_PROGRESS_INTERVAL: PageIndex = 1000;

fn signed(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

fn apply_delta(value: u32, delta: i64) -> u32 {
    u32::try_from((i64::from(value) + delta).max(0)).unwrap_or(u32::MAX)
}

/// Chunk chain of one record as read from the data file.
struct Chain {
    chunks: Vec<ChunkDebug>,
    entry: Vec<u8>,
    version: u32,
}

/// The three files of a cluster and the chunk-level logic over them.
struct ClusterFiles {
    name: String,
    data_file: FileId,
    free_space_map: FreeSpaceMap,
    position_map: PositionMap,
}

impl ClusterFiles {
    fn broken(&self, position: u64) -> ClusterError {
        ClusterError::BrokenRecord {
            cluster: self.name.clone(),
            position,
        }
    }

    fn broken_chunk(&self, pointer: ChunkPointer) -> ClusterError {
        ClusterError::BrokenChunk {
            cluster: self.name.clone(),
            page_index: pointer.page_index(),
            slot: pointer.slot(),
        }
    }

    fn stalled(&self) -> ClusterError {
        ClusterError::ChunkingStalled {
            cluster: self.name.clone(),
        }
    }

    fn state<'s, S: PageSource>(
        &self,
        source: &'s S,
    ) -> Result<ClusterState<PageReadGuard<'s>>, CacheError> {
        Ok(ClusterState::new(
            source.read_page(self.data_file, STATE_PAGE_INDEX)?,
        ))
    }

    /// Follow a record's chain from its head.
    ///
    /// `None` when the head slot is gone or is not a head chunk; an
    /// inconsistency further down the chain is a broken record.
    fn walk_chain(
        &self,
        source: &impl PageSource,
        position: u64,
        head: ChunkPointer,
    ) -> Result<Option<Chain>, ClusterError> {
        let mut chain = Chain {
            chunks: Vec::new(),
            entry: Vec::new(),
            version: 0,
        };

        let mut next = Some(head);
        while let Some(pointer) = next {
            let page = ClusterPage::new(source.read_page(self.data_file, pointer.page_index())?);
            let Some(view) = page
                .record_bytes(pointer.slot())
                .and_then(chunk::decode_chunk)
            else {
                if chain.chunks.is_empty() {
                    return Ok(None);
                }
                return Err(self.broken(position));
            };

            if chain.chunks.is_empty() {
                if !view.is_head {
                    return Ok(None);
                }
                chain.version = page.record_version(pointer.slot()).unwrap_or(0);
            } else if view.is_head {
                return Err(self.broken(position));
            }

            chain.entry.extend_from_slice(view.content);
            chain.chunks.push(ChunkDebug {
                pointer,
                content_size: view.content.len(),
                is_head: view.is_head,
            });
            if let Some((_, len)) = chunk::decode_entry_header(&chain.entry)
                && chain.entry.len() > len + chunk::ENTRY_HEADER_SIZE
            {
                return Err(self.broken(position));
            }
            next = view.next;
        }
        Ok(Some(chain))
    }

    fn read_record(
        &self,
        source: &impl PageSource,
        position: u64,
    ) -> Result<Option<RawRecord>, ClusterError> {
        let Some(head) = self.position_map.get(source, position)? else {
            return Ok(None);
        };
        let Some(chain) = self.walk_chain(source, position, head)? else {
            return Ok(None);
        };
        let (record_type, payload) =
            chunk::decode_entry(&chain.entry).ok_or_else(|| self.broken(position))?;
        Ok(Some(RawRecord {
            payload: payload.to_vec(),
            version: chain.version,
            record_type,
        }))
    }

    fn physical_position(
        &self,
        source: &impl PageSource,
        position: u64,
    ) -> Result<Option<PhysicalPosition>, ClusterError> {
        let Some(head) = self.position_map.get(source, position)? else {
            return Ok(None);
        };
        let page = ClusterPage::new(source.read_page(self.data_file, head.page_index())?);
        let Some(view) = page
            .record_bytes(head.slot())
            .and_then(chunk::decode_chunk)
        else {
            return Ok(None);
        };
        if !view.is_head {
            return Ok(None);
        }
        let (record_type, size) =
            chunk::decode_entry_header(view.content).ok_or_else(|| self.broken(position))?;
        Ok(Some(PhysicalPosition {
            position,
            record_type,
            version: page.record_version(head.slot()).unwrap_or(0),
            size,
        }))
    }

    fn find_next_free_page_to_write(
        &self,
        source: &impl PageSource,
        bytes: usize,
    ) -> Result<Option<PageIndex>, FreeSpaceMapError> {
        let bytes = bytes.min(MAX_RECORD_SIZE);
        if bytes >= PAGE_SIZE - NORMALIZATION_INTERVAL {
            return self.free_space_map.find_free_page(source, bytes / 2);
        }
        let found = self.free_space_map.find_free_page(source, bytes)?;
        if found.is_none() && bytes > MAX_RECORD_SIZE / 2 {
            return self.free_space_map.find_free_page(source, bytes / 2);
        }
        Ok(found)
    }

    /// Initialize the next data page, adding it to the file if needed.
    fn allocate_new_page(
        &self,
        operation: &mut AtomicOperation<'_>,
    ) -> Result<PageIndex, ClusterError> {
        let file_size = self.state(&*operation)?.file_size();
        let page_index = PageIndex::from(file_size) + 1;
        let new_file_size = u32::try_from(page_index)
            .map_err(|_| FreeSpaceMapError::CapacityExceeded { page_index })?;

        let page = if page_index >= operation.filled_up_to(self.data_file)? {
            operation.add_page(self.data_file)?
        } else {
            operation.load_page_for_write(self.data_file, page_index)?
        };
        ClusterPage::new(page).init();
        ClusterState::new(operation.load_page_for_write(self.data_file, STATE_PAGE_INDEX)?)
            .set_file_size(new_file_size);

        tracing::debug!("Cluster {} initialized data page {page_index}", self.name);
        Ok(page_index)
    }

    /// Push a data page's current free space into the map.
    fn report_free_space(
        &self,
        operation: &mut AtomicOperation<'_>,
        page_index: PageIndex,
    ) -> Result<(), ClusterError> {
        let free = ClusterPage::new(operation.load_page_for_read(self.data_file, page_index)?)
            .max_record_size();
        self.free_space_map
            .update_page_free_space(operation, page_index, free)?;
        Ok(())
    }

    /// Place one chunk holding a prefix of `rest`.
    ///
    /// `same_page` is tried first, reusing its slot, when it has room for any
    /// content. Returns where the chunk went and how many bytes of `rest` it took.
    fn append_chunk(
        &self,
        operation: &mut AtomicOperation<'_>,
        rest: &[u8],
        is_head: bool,
        version: u32,
        same_page: Option<ChunkPointer>,
    ) -> Result<(ChunkPointer, usize), ClusterError> {
        let wanted = (rest.len() + CHUNK_TRAILER_SIZE).min(MAX_RECORD_SIZE);

        let mut target = None;
        if let Some(old) = same_page {
            let room =
                ClusterPage::new(operation.load_page_for_read(self.data_file, old.page_index())?)
                    .max_record_size();
            if room > CHUNK_TRAILER_SIZE {
                target = Some((old.page_index(), Some(old.slot())));
            }
        }
        let (page_index, hint_slot) = match target {
            Some(target) => target,
            None => match self.find_next_free_page_to_write(&*operation, wanted)? {
                Some(page_index) => (page_index, None),
                None => (self.allocate_new_page(operation)?, None),
            },
        };

        let (pointer, consumed) = {
            let mut page =
                ClusterPage::new(operation.load_page_for_write(self.data_file, page_index)?);
            let capacity = page.max_record_size().min(wanted);
            let content_len = capacity
                .saturating_sub(CHUNK_TRAILER_SIZE)
                .min(rest.len());
            if content_len == 0 {
                return Err(self.stalled());
            }

            let record = chunk::encode_chunk(&rest[..content_len], is_head, None);
            let version = if is_head { version } else { 0 };
            let slot = page
                .append_record(version, &record, hint_slot)
                .ok_or_else(|| self.stalled())?;
            (ChunkPointer::new(page_index, slot), content_len)
        };

        self.report_free_space(operation, page_index)?;
        Ok((pointer, consumed))
    }

    /// Point the chunk at `at` to `next`.
    fn link(
        &self,
        operation: &mut AtomicOperation<'_>,
        at: ChunkPointer,
        next: ChunkPointer,
    ) -> Result<(), ClusterError> {
        let mut page =
            ClusterPage::new(operation.load_page_for_write(self.data_file, at.page_index())?);
        let linked = page
            .record_size(at.slot())
            .and_then(chunk::next_offset)
            .is_some_and(|offset| {
                page.set_record_u64(at.slot(), offset, chunk::encode_next(Some(next)))
            });
        if linked {
            Ok(())
        } else {
            Err(self.broken_chunk(at))
        }
    }

    fn delete_chunk(
        &self,
        operation: &mut AtomicOperation<'_>,
        pointer: ChunkPointer,
        keep_tombstone: bool,
    ) -> Result<(), ClusterError> {
        ClusterPage::new(operation.load_page_for_write(self.data_file, pointer.page_index())?)
            .delete_record(pointer.slot(), keep_tombstone)
            .ok_or_else(|| self.broken_chunk(pointer))?;
        self.report_free_space(operation, pointer.page_index())
    }

    /// Write `entry` as a fresh chain and return its head.
    fn write_chain(
        &self,
        operation: &mut AtomicOperation<'_>,
        entry: &[u8],
        version: u32,
    ) -> Result<ChunkPointer, ClusterError> {
        let mut head = None;
        let mut previous = None;
        let mut from = 0;
        while from < entry.len() {
            let (pointer, consumed) =
                self.append_chunk(operation, &entry[from..], head.is_none(), version, None)?;
            if let Some(previous) = previous {
                self.link(operation, previous, pointer)?;
            }
            head.get_or_insert(pointer);
            previous = Some(pointer);
            from += consumed;
        }
        head.ok_or_else(|| self.stalled())
    }

    /// Lay `entry` over an existing chain and return the new head.
    ///
    /// Each old chunk's page takes as much of the rest as it can hold once that
    /// chunk is gone. A chunk whose size comes out unchanged is overwritten in
    /// place; any other is deleted and re-appended, keeping its slot when it
    /// stays on its page. Old chunks past the new end are released.
    fn rewrite_chain(
        &self,
        operation: &mut AtomicOperation<'_>,
        old_chunks: &[ChunkDebug],
        entry: &[u8],
        version: u32,
    ) -> Result<ChunkPointer, ClusterError> {
        let mut old_chunks = old_chunks.iter();
        let mut head = None;
        let mut previous = None;
        let mut from = 0;

        while from < entry.len() {
            let rest = &entry[from..];
            let is_head = head.is_none();
            let old = old_chunks.next();
            let reusable = match old {
                Some(old) => self.reusable_content_size(operation, old.pointer, rest.len())?,
                None => 0,
            };
            let (pointer, consumed) = match old {
                Some(old) if reusable == old.content_size => {
                    let record = chunk::encode_chunk(&rest[..old.content_size], is_head, None);
                    let version = if is_head { version } else { 0 };
                    ClusterPage::new(
                        operation.load_page_for_write(self.data_file, old.pointer.page_index())?,
                    )
                    .replace_record(old.pointer.slot(), &record, Some(version));
                    self.report_free_space(operation, old.pointer.page_index())?;
                    (old.pointer, old.content_size)
                }
                Some(old) => {
                    self.delete_chunk(operation, old.pointer, true)?;
                    self.append_chunk(operation, rest, is_head, version, Some(old.pointer))?
                }
                None => self.append_chunk(operation, rest, is_head, version, None)?,
            };

            if let Some(previous) = previous {
                self.link(operation, previous, pointer)?;
            }
            head.get_or_insert(pointer);
            previous = Some(pointer);
            from += consumed;
        }

        for old in old_chunks {
            self.delete_chunk(operation, old.pointer, false)?;
        }
        head.ok_or_else(|| self.stalled())
    }

    /// Content an old chunk's page could take from `remaining` bytes if the
    /// chunk at `pointer` were re-appended there.
    fn reusable_content_size(
        &self,
        operation: &AtomicOperation<'_>,
        pointer: ChunkPointer,
        remaining: usize,
    ) -> Result<usize, ClusterError> {
        let page = ClusterPage::new(
            operation.load_page_for_read(self.data_file, pointer.page_index())?,
        );
        let room = page
            .reusable_record_size(pointer.slot())
            .ok_or_else(|| self.broken_chunk(pointer))?;
        Ok(room
            .min(MAX_RECORD_SIZE)
            .saturating_sub(CHUNK_TRAILER_SIZE)
            .min(remaining))
    }

    fn update_state(
        &self,
        operation: &mut AtomicOperation<'_>,
        count_delta: i64,
        size_delta: i64,
    ) -> Result<(), ClusterError> {
        let mut state =
            ClusterState::new(operation.load_page_for_write(self.data_file, STATE_PAGE_INDEX)?);
        state.set_record_count(apply_delta(state.record_count(), count_delta));
        state.set_records_size(apply_delta(state.records_size(), size_delta));
        Ok(())
    }
}

/// A record store spread over fixed-size pages.
///
/// # Invariants
/// - Every filled position resolves to a head chunk whose chain decodes to
///   exactly the declared payload length
/// - Every data page's last reported free space is in the free-space map
/// - `entries()` and `records_size()` match the set of filled positions
///
/// # Locking
/// Mutations take the cluster's component lock in the caller's atomic
/// operation first, then the cluster's own `RwLock`. Reads outside an
/// operation take the component read lock, so they never see a half-applied
/// operation. Inside an operation that already holds the component, use
/// [`Self::read_record_in_operation`].
pub struct PaginatedCluster {
    id: ComponentId,
    manager: Arc<AtomicOperationsManager>,
    files: RwLock<ClusterFiles>,
}

impl PaginatedCluster {
    /// File name of the data file of cluster `name`.
    #[must_use]
    pub fn data_file_name(name: &str) -> String {
        format!("{name}{CLUSTER_EXTENSION}")
    }

    /// Whether cluster `name` exists on disk.
    #[must_use]
    pub fn exists(cache: &FileCache, name: &str) -> bool {
        cache.exists(&Self::data_file_name(name))
    }

    /// Create the cluster's files inside `operation`.
    pub fn create(
        manager: Arc<AtomicOperationsManager>,
        operation: &mut AtomicOperation<'_>,
        id: ComponentId,
        name: &str,
    ) -> Result<Self, ClusterError> {
        operation.acquire_exclusive_lock(id);
        let data_name = Self::data_file_name(name);
        if operation.is_file_exists(&data_name) {
            return Err(ClusterError::AlreadyExists {
                name: name.to_string(),
            });
        }

        let data_file = operation.add_file(&data_name)?;
        ClusterState::new(operation.add_page(data_file)?).init();
        let free_space_map = FreeSpaceMap::create(operation, name)?;
        let position_map = PositionMap::create(operation, name)?;

        tracing::info!("Created cluster {name} with id {id}");
        Ok(Self {
            id,
            manager,
            files: RwLock::new(ClusterFiles {
                name: name.to_string(),
                data_file,
                free_space_map,
                position_map,
            }),
        })
    }

    /// Open an existing cluster, rebuilding its free-space map if it is missing.
    pub fn open(
        manager: Arc<AtomicOperationsManager>,
        id: ComponentId,
        name: &str,
    ) -> Result<Self, ClusterError> {
        let cache = manager.cache();
        if !Self::exists(cache, name) {
            return Err(ClusterError::NotFound {
                name: name.to_string(),
            });
        }

        let data_file = cache.open_file(&Self::data_file_name(name))?;
        let position_map = PositionMap::open(cache, name)?;
        let free_space_map = if FreeSpaceMap::exists(cache, name) {
            FreeSpaceMap::open(cache, name)?
        } else {
            Self::rebuild_free_space_map(&manager, id, name, data_file)?
        };

        tracing::info!("Opened cluster {name} with id {id}");
        Ok(Self {
            id,
            manager,
            files: RwLock::new(ClusterFiles {
                name: name.to_string(),
                data_file,
                free_space_map,
                position_map,
            }),
        })
    }

    fn rebuild_free_space_map(
        manager: &AtomicOperationsManager,
        id: ComponentId,
        name: &str,
        data_file: FileId,
    ) -> Result<FreeSpaceMap, ClusterError> {
        tracing::info!("Free-space map of cluster {name} is missing, rebuilding");
        let map = manager.execute(|operation| {
            operation.acquire_exclusive_lock(id);
            let map = FreeSpaceMap::create(operation, name)?;

            let file_size =
                ClusterState::new(operation.load_page_for_read(data_file, STATE_PAGE_INDEX)?)
                    .file_size();
            let last_page = PageIndex::from(file_size)
                .min(operation.filled_up_to(data_file)?.saturating_sub(1));

            for page_index in 1..=last_page {
                let free = ClusterPage::new(operation.load_page_for_read(data_file, page_index)?)
                    .max_record_size();
                map.update_page_free_space(operation, page_index, free)?;
                if page_index % REBUILD_PROGRESS_INTERVAL == 0 {
                    tracing::info!(
                        "Rebuilding free-space map of cluster {name}: {page_index} of {last_page} pages processed"
                    );
                }
            }
            Ok::<_, ClusterError>(map)
        })?;
        tracing::info!("Free-space map of cluster {name} rebuilt");
        Ok(map)
    }

    #[must_use]
    pub const fn id(&self) -> ComponentId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.files.read().name.clone()
    }

    /// Sync and release the cluster's files.
    pub fn close(&self) -> Result<(), ClusterError> {
        let _component = self.manager.acquire_read_lock(self.id);
        let files = self.files.write();
        let cache = self.manager.cache();
        cache.close_file(files.data_file)?;
        files.free_space_map.close(cache)?;
        files.position_map.close(cache)?;
        tracing::info!("Closed cluster {}", files.name);
        Ok(())
    }

    /// Schedule the cluster's files for deletion when `operation` commits.
    pub fn delete(&self, operation: &mut AtomicOperation<'_>) -> Result<(), ClusterError> {
        operation.acquire_exclusive_lock(self.id);
        let files = self.files.write();
        if files.state(&*operation)?.record_count() > 0 {
            return Err(ClusterError::NotEmpty {
                cluster: files.name.clone(),
            });
        }

        operation.delete_file(files.data_file)?;
        files.free_space_map.delete(operation)?;
        files.position_map.delete(operation)?;
        tracing::info!("Deleted cluster {}", files.name);
        Ok(())
    }

    /// Rename all three files of the cluster.
    pub fn rename(&self, new_name: &str) -> Result<(), ClusterError> {
        let _component = self.manager.acquire_read_lock(self.id);
        let mut files = self.files.write();
        let cache = self.manager.cache();
        if Self::exists(cache, new_name) {
            return Err(ClusterError::AlreadyExists {
                name: new_name.to_string(),
            });
        }

        cache.rename_file(files.data_file, &Self::data_file_name(new_name))?;
        files.free_space_map.rename(cache, new_name)?;
        files.position_map.rename(cache, new_name)?;
        tracing::info!("Renamed cluster {} to {new_name}", files.name);
        files.name = new_name.to_string();
        Ok(())
    }

    /// Run `f` over committed state with the component read lock held.
    fn read<T>(
        &self,
        f: impl FnOnce(&ClusterFiles, &FileCache) -> Result<T, ClusterError>,
    ) -> Result<T, ClusterError> {
        let _component = self.manager.acquire_read_lock(self.id);
        let files = self.files.read();
        f(&files, self.manager.cache())
    }

    /// Reserve a position for a record created later in the operation.
    pub fn allocate_position(
        &self,
        operation: &mut AtomicOperation<'_>,
    ) -> Result<u64, ClusterError> {
        operation.acquire_exclusive_lock(self.id);
        let files = self.files.write();
        Ok(files.position_map.allocate(operation)?)
    }

    /// Store a new record.
    ///
    /// With `allocated_position`, the record fills a position reserved by
    /// [`Self::allocate_position`]; otherwise a fresh position is appended.
    pub fn create_record(
        &self,
        operation: &mut AtomicOperation<'_>,
        record_type: u8,
        payload: &[u8],
        version: u32,
        allocated_position: Option<u64>,
    ) -> Result<PhysicalPosition, ClusterError> {
        operation.acquire_exclusive_lock(self.id);
        let files = self.files.write();

        if let Some(position) = allocated_position
            && files.position_map.status(&*operation, position)? != RecordStatus::Allocated
        {
            return Err(ClusterError::PositionNotAllocated {
                cluster: files.name.clone(),
                position,
            });
        }
        let entry = chunk::encode_entry(record_type, payload).ok_or_else(|| {
            ClusterError::RecordTooLarge {
                cluster: files.name.clone(),
                size: payload.len(),
            }
        })?;

        let head = files.write_chain(operation, &entry, version)?;
        files.update_state(operation, 1, signed(payload.len()))?;
        let position = match allocated_position {
            Some(position) => {
                files.position_map.update(operation, position, head)?;
                position
            }
            None => files.position_map.add(operation, head)?,
        };

        Ok(PhysicalPosition {
            position,
            record_type,
            version,
            size: payload.len(),
        })
    }

    /// Read a committed record.
    ///
    /// `_prefetch_pages` is accepted for callers that pass a read-ahead hint;
    /// pages are always loaded on demand.
    pub fn read_record(
        &self,
        position: u64,
        _prefetch_pages: usize,
    ) -> Result<Option<RawRecord>, ClusterError> {
        self.read(|files, cache| files.read_record(cache, position))
    }

    /// Read a record as seen by `operation`, including its uncommitted changes.
    pub fn read_record_in_operation(
        &self,
        operation: &AtomicOperation<'_>,
        position: u64,
    ) -> Result<Option<RawRecord>, ClusterError> {
        let files = self.files.read();
        files.read_record(operation, position)
    }

    /// Read a record only if its stored version is newer than `version`.
    pub fn read_record_if_version_is_not_latest(
        &self,
        position: u64,
        version: u32,
    ) -> Result<Option<RawRecord>, ClusterError> {
        self.read(|files, cache| match files.physical_position(cache, position)? {
            Some(physical) if physical.version > version => files.read_record(cache, position),
            _ => Ok(None),
        })
    }

    /// Replace a record's payload, type and version.
    ///
    /// Returns `false` if no record is stored at `position`.
    pub fn update_record(
        &self,
        operation: &mut AtomicOperation<'_>,
        position: u64,
        payload: &[u8],
        version: u32,
        record_type: u8,
    ) -> Result<bool, ClusterError> {
        operation.acquire_exclusive_lock(self.id);
        let files = self.files.write();

        let Some(head) = files.position_map.get(&*operation, position)? else {
            return Ok(false);
        };
        let Some(old) = files.walk_chain(&*operation, position, head)? else {
            return Ok(false);
        };
        let (_, old_size) =
            chunk::decode_entry_header(&old.entry).ok_or_else(|| files.broken(position))?;
        let entry = chunk::encode_entry(record_type, payload).ok_or_else(|| {
            ClusterError::RecordTooLarge {
                cluster: files.name.clone(),
                size: payload.len(),
            }
        })?;

        let new_head = files.rewrite_chain(operation, &old.chunks, &entry, version)?;
        files.update_state(operation, 0, signed(payload.len()) - signed(old_size))?;
        if new_head != head {
            files.position_map.update(operation, position, new_head)?;
        }
        Ok(true)
    }

    /// Delete a record. Returns `false` if no record is stored at `position`.
    pub fn delete_record(
        &self,
        operation: &mut AtomicOperation<'_>,
        position: u64,
    ) -> Result<bool, ClusterError> {
        operation.acquire_exclusive_lock(self.id);
        let files = self.files.write();

        let Some(head) = files.position_map.get(&*operation, position)? else {
            return Ok(false);
        };
        let Some(chain) = files.walk_chain(&*operation, position, head)? else {
            return Ok(false);
        };
        let (_, size) =
            chunk::decode_entry_header(&chain.entry).ok_or_else(|| files.broken(position))?;

        for chunk in &chain.chunks {
            files.delete_chunk(operation, chunk.pointer, chunk.is_head)?;
        }
        files.update_state(operation, -1, -signed(size))?;
        files.position_map.remove(operation, position)?;
        Ok(true)
    }

    /// Type, version and size of a record, read from its head chunk only.
    pub fn get_physical_position(
        &self,
        position: u64,
    ) -> Result<Option<PhysicalPosition>, ClusterError> {
        self.read(|files, cache| files.physical_position(cache, position))
    }

    /// Whether the record at `position` has been deleted.
    pub fn is_deleted(&self, position: u64) -> Result<bool, ClusterError> {
        self.read(|files, cache| {
            Ok(match files.position_map.entry(cache, position)? {
                (RecordStatus::Removed, _) => true,
                (RecordStatus::Filled, Some(head)) => {
                    ClusterPage::new(cache.read_page(files.data_file, head.page_index())?)
                        .is_deleted(head.slot())
                }
                _ => false,
            })
        })
    }

    pub fn record_status(&self, position: u64) -> Result<RecordStatus, ClusterError> {
        self.read(|files, cache| Ok(files.position_map.status(cache, position)?))
    }

    /// Number of live records.
    pub fn entries(&self) -> Result<u64, ClusterError> {
        self.read(|files, cache| Ok(u64::from(files.state(cache)?.record_count())))
    }

    /// Sum of live payload lengths.
    pub fn records_size(&self) -> Result<u64, ClusterError> {
        self.read(|files, cache| Ok(u64::from(files.state(cache)?.records_size())))
    }

    pub fn first_position(&self) -> Result<Option<u64>, ClusterError> {
        self.read(|files, cache| Ok(files.position_map.first(cache)?))
    }

    pub fn last_position(&self) -> Result<Option<u64>, ClusterError> {
        self.read(|files, cache| Ok(files.position_map.last(cache)?))
    }

    pub fn higher_position(&self, position: u64) -> Result<Option<u64>, ClusterError> {
        self.read(|files, cache| Ok(files.position_map.higher(cache, position)?))
    }

    pub fn ceiling_position(&self, position: u64) -> Result<Option<u64>, ClusterError> {
        self.read(|files, cache| Ok(files.position_map.ceiling(cache, position)?))
    }

    pub fn lower_position(&self, position: u64) -> Result<Option<u64>, ClusterError> {
        self.read(|files, cache| Ok(files.position_map.lower(cache, position)?))
    }

    pub fn floor_position(&self, position: u64) -> Result<Option<u64>, ClusterError> {
        self.read(|files, cache| Ok(files.position_map.floor(cache, position)?))
    }

    /// Chunk chain of the record at `position`.
    pub fn read_debug(&self, position: u64) -> Result<Option<RecordDebug>, ClusterError> {
        self.read(|files, cache| {
            let Some(head) = files.position_map.get(cache, position)? else {
                return Ok(None);
            };
            Ok(files
                .walk_chain(cache, position, head)?
                .map(|chain| RecordDebug {
                    position,
                    chunks: chain.chunks,
                }))
        })
    }

    /// Data page that would receive a chunk of `bytes` bytes, if any has room.
    pub fn find_free_page(&self, bytes: usize) -> Result<Option<PageIndex>, ClusterError> {
        self.read(|files, cache| Ok(files.free_space_map.find_free_page(cache, bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};

    use rand::Rng;
    use tempfile::tempdir;

    use super::*;
    use crate::storage::buffer_pool::BufferPool;
    use crate::storage::cluster::MAX_CHUNK_CONTENT;
    use crate::storage::page::Page;

    fn manager(dir: &std::path::Path) -> Arc<AtomicOperationsManager> {
        let cache = FileCache::new(dir, BufferPool::new(256)).expect("cache");
        Arc::new(AtomicOperationsManager::new(Arc::new(cache)))
    }

    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    fn create_cluster(manager: &Arc<AtomicOperationsManager>, name: &str) -> PaginatedCluster {
        manager
            .execute(|operation| PaginatedCluster::create(Arc::clone(manager), operation, 1, name))
            .expect("create cluster")
    }

    fn payload(len: usize) -> Vec<u8> {
        let mut rng = rand::rng();
        (0..len).map(|_| rng.random()).collect()
    }

    fn create(cluster: &PaginatedCluster, manager: &AtomicOperationsManager, data: &[u8]) -> u64 {
        manager
            .execute(|operation| cluster.create_record(operation, 7, data, 1, None))
            .expect("create record")
            .position
    }

    fn update(
        cluster: &PaginatedCluster,
        manager: &AtomicOperationsManager,
        position: u64,
        data: &[u8],
        version: u32,
    ) -> bool {
        manager
            .execute(|operation| cluster.update_record(operation, position, data, version, 9))
            .expect("update record")
    }

    fn delete(
        cluster: &PaginatedCluster,
        manager: &AtomicOperationsManager,
        position: u64,
    ) -> bool {
        manager
            .execute(|operation| cluster.delete_record(operation, position))
            .expect("delete record")
    }

    fn read(cluster: &PaginatedCluster, position: u64) -> Option<RawRecord> {
        cluster.read_record(position, 0).expect("read record")
    }

    fn chunk_count(cluster: &PaginatedCluster, position: u64) -> usize {
        cluster
            .read_debug(position)
            .expect("read debug")
            .map_or(0, |debug| debug.chunks.len())
    }

    /// Rewrite a committed data page behind the cluster's back.
    fn tamper(
        cluster: &PaginatedCluster,
        manager: &AtomicOperationsManager,
        page_index: PageIndex,
        f: impl FnOnce(&mut ClusterPage<&mut Page>),
    ) {
        let data_file = cluster.files.read().data_file;
        manager
            .execute(|operation| {
                let mut page = operation.load_page_for_write(data_file, page_index)?;
                f(&mut ClusterPage::new(&mut *page));
                Ok::<_, CacheError>(())
            })
            .expect("tamper");
    }

    fn chunks(cluster: &PaginatedCluster, position: u64) -> Vec<ChunkDebug> {
        cluster
            .read_debug(position)
            .expect("read debug")
            .expect("exists")
            .chunks
    }

    /// Every live slot on every data page belongs to some record's chain.
    fn assert_no_orphans(cluster: &PaginatedCluster) {
        let files = cluster.files.read();
        let cache = cluster.manager.cache();
        let file_size = files.state(cache).expect("state").file_size();

        let mut live = BTreeSet::new();
        for page_index in 1..=PageIndex::from(file_size) {
            let page =
                ClusterPage::new(cache.read_page(files.data_file, page_index).expect("read"));
            for slot in page.live_slots() {
                live.insert(ChunkPointer::new(page_index, slot));
            }
        }

        let mut reachable = BTreeSet::new();
        let mut position = files.position_map.first(cache).expect("first");
        while let Some(current) = position {
            let head = files
                .position_map
                .get(cache, current)
                .expect("get")
                .expect("filled");
            let chain = files
                .walk_chain(cache, current, head)
                .expect("walk")
                .expect("chain");
            reachable.extend(chain.chunks.iter().map(|chunk| chunk.pointer));
            position = files.position_map.higher(cache, current).expect("higher");
        }

        assert_eq!(live, reachable);
    }

    #[test]
    fn test_round_trip_sizes() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "people");

        let sizes = [
            0,
            1,
            100,
            MAX_CHUNK_CONTENT - 5,
            MAX_CHUNK_CONTENT - 4,
            MAX_CHUNK_CONTENT,
            2 * MAX_CHUNK_CONTENT + 17,
            5 * MAX_CHUNK_CONTENT,
        ];
        for size in sizes {
            let data = payload(size);
            let created = manager
                .execute(|operation| cluster.create_record(operation, 3, &data, 42, None))
                .expect("create record");
            assert_eq!(created.size, size);

            let record = read(&cluster, created.position).expect("record exists");
            assert_eq!(record.payload, data, "size {size}");
            assert_eq!(record.record_type, 3);
            assert_eq!(record.version, 42);

            let physical = cluster
                .get_physical_position(created.position)
                .expect("physical position")
                .expect("exists");
            assert_eq!(physical, created);
        }

        assert_eq!(cluster.entries().expect("entries"), sizes.len() as u64);
        assert_eq!(
            cluster.records_size().expect("records size"),
            sizes.iter().sum::<usize>() as u64
        );
        assert_no_orphans(&cluster);
    }

    #[test]
    fn test_chunk_counts() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "c");

        // Entry header takes five bytes of the first chunk.
        let fits = create(&cluster, &manager, &payload(MAX_CHUNK_CONTENT - 5));
        let spills = create(&cluster, &manager, &payload(MAX_CHUNK_CONTENT - 4));
        assert_eq!(chunk_count(&cluster, fits), 1);
        assert_eq!(chunk_count(&cluster, spills), 2);

        let debug = cluster
            .read_debug(spills)
            .expect("read debug")
            .expect("exists");
        assert!(debug.chunks[0].is_head);
        assert!(!debug.chunks[1].is_head);
        assert_eq!(
            debug.chunks.iter().map(|c| c.content_size).sum::<usize>(),
            MAX_CHUNK_CONTENT + 1
        );
    }

    #[test]
    fn test_update_round_trip_without_orphans() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "c");

        let transitions = [
            (10, 20),
            (20, 10),
            (100, 100),
            (50, 3 * MAX_CHUNK_CONTENT),
            (3 * MAX_CHUNK_CONTENT, 50),
            (2 * MAX_CHUNK_CONTENT - 5, MAX_CHUNK_CONTENT - 5),
            (2 * MAX_CHUNK_CONTENT, 2 * MAX_CHUNK_CONTENT + 1),
            (4 * MAX_CHUNK_CONTENT + 3, 2 * MAX_CHUNK_CONTENT + 700),
            (0, MAX_CHUNK_CONTENT),
            (MAX_CHUNK_CONTENT, 0),
        ];
        for (before, after) in transitions {
            let position = create(&cluster, &manager, &payload(before));
            let data = payload(after);
            assert!(update(&cluster, &manager, position, &data, 2));

            let record = read(&cluster, position).expect("record exists");
            assert_eq!(record.payload, data, "{before} -> {after}");
            assert_eq!(record.version, 2);
            assert_eq!(record.record_type, 9);
            assert_no_orphans(&cluster);
        }
    }

    #[test]
    fn test_growing_update_fills_pages() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "c");

        let position = create(&cluster, &manager, &payload(10));
        let head = chunks(&cluster, position)[0].pointer;
        for size in (20..=100).step_by(10) {
            let data = payload(size);
            assert!(update(&cluster, &manager, position, &data, 2));
            assert_eq!(chunk_count(&cluster, position), 1, "size {size}");
            assert_eq!(read(&cluster, position).expect("record").payload, data);
        }
        assert_eq!(chunks(&cluster, position)[0].pointer, head);

        let data = payload(8000);
        assert!(update(&cluster, &manager, position, &data, 3));
        assert_eq!(chunk_count(&cluster, position), 1);
        assert_eq!(read(&cluster, position).expect("record").payload, data);

        // Two full chunks plus the five header bytes spilling into a third.
        let data = payload(2 * MAX_CHUNK_CONTENT);
        assert!(update(&cluster, &manager, position, &data, 4));
        assert_eq!(chunk_count(&cluster, position), 3);
        assert_eq!(read(&cluster, position).expect("record").payload, data);
        assert_no_orphans(&cluster);
    }

    #[test]
    fn test_update_same_size_keeps_chunks_in_place() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "c");

        let position = create(&cluster, &manager, &payload(2 * MAX_CHUNK_CONTENT + 10));
        let before = cluster.read_debug(position).expect("debug");
        assert!(update(&cluster, &manager, position, &payload(2 * MAX_CHUNK_CONTENT + 10), 5));
        assert_eq!(cluster.read_debug(position).expect("debug"), before);
    }

    #[test]
    fn test_shrink_keeps_head_position() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "c");

        let position = create(&cluster, &manager, &payload(500));
        let head = cluster.read_debug(position).expect("debug").expect("exists").chunks[0];
        assert!(update(&cluster, &manager, position, &payload(20), 2));
        let relocated = cluster.read_debug(position).expect("debug").expect("exists").chunks[0];
        assert_eq!(relocated.pointer, head.pointer);
        assert_eq!(relocated.content_size, 25);
    }

    #[test]
    fn test_update_and_delete_absent() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "c");

        assert!(!update(&cluster, &manager, 0, b"x", 1));
        assert!(!delete(&cluster, &manager, 0));
        assert!(read(&cluster, 0).is_none());
        assert_eq!(cluster.record_status(0).expect("status"), RecordStatus::NotExistent);
    }

    #[test]
    fn test_delete_record() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "c");

        let kept = create(&cluster, &manager, b"kept");
        let position = create(&cluster, &manager, &payload(3 * MAX_CHUNK_CONTENT));
        assert!(!cluster.is_deleted(position).expect("is deleted"));

        assert!(delete(&cluster, &manager, position));
        assert!(read(&cluster, position).is_none());
        assert!(cluster.is_deleted(position).expect("is deleted"));
        assert_eq!(cluster.record_status(position).expect("status"), RecordStatus::Removed);
        assert!(cluster.get_physical_position(position).expect("physical").is_none());
        assert!(!delete(&cluster, &manager, position));
        assert!(!update(&cluster, &manager, position, b"again", 2));

        assert_eq!(cluster.entries().expect("entries"), 1);
        assert_eq!(cluster.records_size().expect("records size"), 4);
        assert_eq!(read(&cluster, kept).expect("kept").payload, b"kept");
        assert_no_orphans(&cluster);
    }

    #[test]
    fn test_allocated_position() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "c");

        let position = manager
            .execute(|operation| cluster.allocate_position(operation))
            .expect("allocate");
        assert_eq!(cluster.record_status(position).expect("status"), RecordStatus::Allocated);
        assert!(read(&cluster, position).is_none());
        assert!(!cluster.is_deleted(position).expect("is deleted"));

        let created = manager
            .execute(|operation| cluster.create_record(operation, 1, b"late", 3, Some(position)))
            .expect("create");
        assert_eq!(created.position, position);
        assert_eq!(cluster.record_status(position).expect("status"), RecordStatus::Filled);
        assert_eq!(read(&cluster, position).expect("record").payload, b"late");

        let result = manager
            .execute(|operation| cluster.create_record(operation, 1, b"x", 1, Some(position)));
        assert!(matches!(result, Err(ClusterError::PositionNotAllocated { .. })));
        let result =
            manager.execute(|operation| cluster.create_record(operation, 1, b"x", 1, Some(99)));
        assert!(matches!(result, Err(ClusterError::PositionNotAllocated { .. })));
    }

    #[test]
    fn test_read_if_newer() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "c");

        let position = manager
            .execute(|operation| cluster.create_record(operation, 1, b"v5", 5, None))
            .expect("create")
            .position;
        assert!(
            cluster
                .read_record_if_version_is_not_latest(position, 5)
                .expect("read")
                .is_none()
        );
        assert!(
            cluster
                .read_record_if_version_is_not_latest(position, 6)
                .expect("read")
                .is_none()
        );
        let record = cluster
            .read_record_if_version_is_not_latest(position, 4)
            .expect("read")
            .expect("newer");
        assert_eq!(record.payload, b"v5");
        assert!(
            cluster
                .read_record_if_version_is_not_latest(position + 1, 0)
                .expect("read")
                .is_none()
        );
    }

    #[test]
    fn test_rollback_leaves_no_trace() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "c");

        let mut operation = manager.start();
        let created = cluster
            .create_record(&mut operation, 1, &payload(2 * MAX_CHUNK_CONTENT), 1, None)
            .expect("create");
        let seen = cluster
            .read_record_in_operation(&operation, created.position)
            .expect("read");
        assert!(seen.is_some());
        operation.rollback();

        assert!(read(&cluster, created.position).is_none());
        assert_eq!(cluster.entries().expect("entries"), 0);
        assert_eq!(cluster.find_free_page(10).expect("find"), None);
    }

    #[test]
    fn test_navigation() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "c");

        let positions: Vec<u64> = (0..5).map(|i| create(&cluster, &manager, &[i])).collect();
        delete(&cluster, &manager, positions[0]);
        delete(&cluster, &manager, positions[2]);

        assert_eq!(cluster.first_position().expect("first"), Some(positions[1]));
        assert_eq!(cluster.last_position().expect("last"), Some(positions[4]));
        assert_eq!(cluster.higher_position(positions[1]).expect("higher"), Some(positions[3]));
        assert_eq!(cluster.ceiling_position(positions[2]).expect("ceiling"), Some(positions[3]));
        assert_eq!(cluster.lower_position(positions[3]).expect("lower"), Some(positions[1]));
        assert_eq!(cluster.floor_position(positions[2]).expect("floor"), Some(positions[1]));
        assert_eq!(cluster.lower_position(positions[1]).expect("lower"), None);
    }

    #[test]
    fn test_random_operations_keep_accounting() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "c");
        let mut rng = rand::rng();
        let mut expected: HashMap<u64, Vec<u8>> = HashMap::new();

        for round in 0..300u32 {
            let size = match rng.random_range(0..10) {
                0 => rng.random_range(MAX_CHUNK_CONTENT..3 * MAX_CHUNK_CONTENT),
                1..=3 => rng.random_range(1000..MAX_CHUNK_CONTENT),
                _ => rng.random_range(0..400),
            };
            let live: Vec<u64> = expected.keys().copied().collect();
            match rng.random_range(0..3) {
                0 if !live.is_empty() => {
                    let position = live[rng.random_range(0..live.len())];
                    let data = payload(size);
                    assert!(update(&cluster, &manager, position, &data, round));
                    expected.insert(position, data);
                }
                1 if !live.is_empty() => {
                    let position = live[rng.random_range(0..live.len())];
                    assert!(delete(&cluster, &manager, position));
                    expected.remove(&position);
                }
                _ => {
                    let data = payload(size);
                    let position = create(&cluster, &manager, &data);
                    expected.insert(position, data);
                }
            }

            assert_eq!(cluster.entries().expect("entries"), expected.len() as u64);
            assert_eq!(
                cluster.records_size().expect("records size"),
                expected.values().map(Vec::len).sum::<usize>() as u64
            );
        }

        for (position, data) in &expected {
            assert_eq!(&read(&cluster, *position).expect("record").payload, data);
        }
        assert_no_orphans(&cluster);
    }

    #[test]
    fn test_three_chunk_record_lifecycle() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "c");

        let big = payload(2 * MAX_CHUNK_CONTENT + MAX_CHUNK_CONTENT / 2);
        let position = create(&cluster, &manager, &big);
        assert_eq!(read(&cluster, position).expect("record").payload, big);

        let chain = cluster.read_debug(position).expect("debug").expect("exists");
        assert_eq!(chain.chunks.len(), 3);
        let pages: Vec<PageIndex> = chain.chunks.iter().map(|c| c.pointer.page_index()).collect();
        assert_eq!(pages, vec![1, 2, 3]);

        let free_before: Vec<usize> = {
            let files = cluster.files.read();
            let cache = manager.cache();
            pages[1..]
                .iter()
                .map(|page| {
                    ClusterPage::new(cache.read_page(files.data_file, *page).expect("read"))
                        .max_record_size()
                })
                .collect()
        };

        let small = payload(50);
        assert!(update(&cluster, &manager, position, &small, 2));
        assert_eq!(chunk_count(&cluster, position), 1);
        assert_eq!(read(&cluster, position).expect("record").payload, small);
        assert_eq!(cluster.records_size().expect("records size"), 50);
        assert_no_orphans(&cluster);

        // The two orphaned pages are empty again and the map knows it.
        {
            let files = cluster.files.read();
            let cache = manager.cache();
            for (page, before) in pages[1..].iter().zip(&free_before) {
                let free = ClusterPage::new(cache.read_page(files.data_file, *page).expect("read"))
                    .max_record_size();
                assert!(free > *before);
                assert_eq!(free, MAX_RECORD_SIZE);
            }
        }
        // Only an empty page qualifies for a near-full-page request.
        let near_full = MAX_RECORD_SIZE - 40;
        assert_eq!(cluster.find_free_page(near_full).expect("find"), Some(2));

        assert!(delete(&cluster, &manager, position));
        assert_eq!(cluster.entries().expect("entries"), 0);
        assert_eq!(cluster.find_free_page(near_full).expect("find"), Some(1));
    }

    #[test]
    fn test_deleted_continuation_chunk_is_broken() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "c");

        let position = create(&cluster, &manager, &payload(MAX_CHUNK_CONTENT + 100));
        let tail = chunks(&cluster, position)[1].pointer;
        tamper(&cluster, &manager, tail.page_index(), |page| {
            page.delete_record(tail.slot(), true).expect("live chunk");
        });

        assert!(matches!(
            cluster.read_record(position, 0),
            Err(ClusterError::BrokenRecord { position: broken, .. }) if broken == position
        ));
        let result = manager.execute(|operation| cluster.delete_record(operation, position));
        assert!(matches!(result, Err(ClusterError::BrokenRecord { .. })));
        let result = manager
            .execute(|operation| cluster.update_record(operation, position, b"x", 2, 1));
        assert!(matches!(result, Err(ClusterError::BrokenRecord { .. })));
        assert_eq!(cluster.entries().expect("entries"), 1);
    }

    #[test]
    fn test_declared_length_mismatch_is_broken() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "c");

        for declared in [9u8, 11] {
            let position = create(&cluster, &manager, &payload(10));
            let head = chunks(&cluster, position)[0].pointer;
            tamper(&cluster, &manager, head.page_index(), |page| {
                let mut chunk = page.record_bytes(head.slot()).expect("live chunk").to_vec();
                // Byte 0 is the record type, bytes 1..5 the payload length.
                chunk[1] = declared;
                page.replace_record(head.slot(), &chunk, None);
            });

            assert!(
                matches!(
                    cluster.read_record(position, 0),
                    Err(ClusterError::BrokenRecord { .. })
                ),
                "declared {declared}"
            );
        }
    }

    #[test]
    fn test_dangling_link_is_broken() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "c");

        let position = create(&cluster, &manager, &payload(MAX_CHUNK_CONTENT + 100));
        let chain = chunks(&cluster, position);
        let (head, tail) = (chain[0].pointer, chain[1].pointer);
        let missing = ChunkPointer::new(tail.page_index(), tail.slot() + 5);
        tamper(&cluster, &manager, head.page_index(), |page| {
            let offset = page
                .record_size(head.slot())
                .and_then(chunk::next_offset)
                .expect("live chunk");
            assert!(page.set_record_u64(head.slot(), offset, chunk::encode_next(Some(missing))));
        });
        assert!(matches!(
            cluster.read_record(position, 0),
            Err(ClusterError::BrokenRecord { .. })
        ));

        // Chunk-level writes through a missing slot name the slot.
        let result = manager.execute(|operation| {
            let files = cluster.files.read();
            files.link(operation, missing, head)
        });
        assert!(matches!(
            result,
            Err(ClusterError::BrokenChunk { page_index, slot, .. })
                if page_index == missing.page_index() && slot == missing.slot()
        ));
        let result = manager.execute(|operation| {
            let files = cluster.files.read();
            files.delete_chunk(operation, missing, false)
        });
        assert!(matches!(result, Err(ClusterError::BrokenChunk { .. })));
    }

    #[test]
    fn test_stale_free_space_entry_stalls_chunking() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "c");

        // Exactly fills data page 1.
        let full = create(&cluster, &manager, &payload(MAX_CHUNK_CONTENT - 5));
        assert_eq!(chunks(&cluster, full)[0].pointer.page_index(), 1);
        assert_eq!(cluster.find_free_page(1).expect("find"), None);

        manager
            .execute(|operation| {
                let files = cluster.files.read();
                files
                    .free_space_map
                    .update_page_free_space(operation, 1, MAX_RECORD_SIZE)
            })
            .expect("update map");

        let data = payload(100);
        let result =
            manager.execute(|operation| cluster.create_record(operation, 1, &data, 1, None));
        assert!(matches!(result, Err(ClusterError::ChunkingStalled { .. })));
        assert_eq!(cluster.entries().expect("entries"), 1);
    }

    #[test]
    fn test_reopen_rebuilds_missing_free_space_map() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "c");

        let positions: Vec<u64> = (0..40)
            .map(|i| create(&cluster, &manager, &payload(300 * i + 17)))
            .collect();
        for position in positions.iter().step_by(3) {
            delete(&cluster, &manager, *position);
        }

        let probes = [0, 100, 1000, 4000, 8000];
        let answers: Vec<Option<PageIndex>> = probes
            .iter()
            .map(|bytes| cluster.find_free_page(*bytes).expect("find"))
            .collect();
        cluster.close().expect("close");
        drop(cluster);

        std::fs::remove_file(dir.path().join(FreeSpaceMap::file_name("c"))).expect("remove map");
        #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
        let cluster = PaginatedCluster::open(Arc::clone(&manager), 1, "c").expect("reopen");

        let rebuilt: Vec<Option<PageIndex>> = probes
            .iter()
            .map(|bytes| cluster.find_free_page(*bytes).expect("find"))
            .collect();
        assert_eq!(rebuilt, answers);
        assert!(FreeSpaceMap::exists(manager.cache(), "c"));
        assert_eq!(cluster.entries().expect("entries"), 26);
    }

    #[test]
    fn test_delete_cluster_requires_empty() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "c");

        let position = create(&cluster, &manager, b"busy");
        let result = manager.execute(|operation| cluster.delete(operation));
        assert!(matches!(result, Err(ClusterError::NotEmpty { .. })));

        delete(&cluster, &manager, position);
        manager
            .execute(|operation| cluster.delete(operation))
            .expect("delete cluster");
        assert!(!PaginatedCluster::exists(manager.cache(), "c"));
        assert!(!dir.path().join("c.cpm").exists());
        assert!(!dir.path().join("c.fsm").exists());
    }

    #[test]
    fn test_create_existing_cluster_fails() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let _cluster = create_cluster(&manager, "c");

        #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
        let result = manager.execute(|operation| {
            PaginatedCluster::create(Arc::clone(&manager), operation, 2, "c")
        });
        assert!(matches!(result, Err(ClusterError::AlreadyExists { .. })));
    }

    #[test]
    fn test_rename() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        let cluster = create_cluster(&manager, "old");
        let position = create(&cluster, &manager, b"moved");

        cluster.rename("new").expect("rename");
        assert_eq!(cluster.name(), "new");
        assert!(PaginatedCluster::exists(manager.cache(), "new"));
        assert!(!PaginatedCluster::exists(manager.cache(), "old"));
        for extension in [".pcl", ".cpm", ".fsm"] {
            assert!(dir.path().join(format!("new{extension}")).exists());
        }
        assert_eq!(read(&cluster, position).expect("record").payload, b"moved");

        let _other = create_cluster(&manager, "other");
        assert!(matches!(
            cluster.rename("other"),
            Err(ClusterError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_open_missing_cluster() {
        let dir = tempdir().expect("create temp dir");
        let manager = manager(dir.path());
        #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
        let result = PaginatedCluster::open(Arc::clone(&manager), 1, "ghost");
        assert!(matches!(result, Err(ClusterError::NotFound { .. })));
    }
}
