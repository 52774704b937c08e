//! Page cache over the engine's data files.
//!
//! Files are registered by name and addressed by a small [`FileId`]. Pages
//! are loaded into shared frames (`Arc<RwLock<Page>>`); a frame stays pinned
//! while any guard on it is alive. The cache is write-through: committed pages
//! are written to disk and to the resident frame in the same call, so evicting
//! an unpinned frame never loses data.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::storage::buffer_pool::BufferPool;
use crate::storage::page::{PAGE_SIZE_U64, Page, PageError, PageIndex};

/// Identifier of a file registered with the cache.
pub type FileId = u32;

/// A resident page frame.
pub type Frame = Arc<RwLock<Page>>;

/// A pinned page borrowed for reading.
///
/// Either a shared frame from the cache or a page from an atomic operation's
/// private overlay. The pin is released when the guard goes out of scope.
pub enum PageReadGuard<'a> {
    Pinned(ArcRwLockReadGuard<RawRwLock, Page>),
    Local(&'a Page),
}

impl Deref for PageReadGuard<'_> {
    type Target = Page;

    fn deref(&self) -> &Page {
        match self {
            Self::Pinned(guard) => guard,
            Self::Local(page) => page,
        }
    }
}

/// Read access to pages, either committed state or an operation's view of it.
pub trait PageSource {
    /// Load a page for reading.
    fn read_page(
        &self,
        file_id: FileId,
        page_index: PageIndex,
    ) -> Result<PageReadGuard<'_>, CacheError>;

    /// Number of pages in the file.
    fn filled_up_to(&self, file_id: FileId) -> Result<u64, CacheError>;
}

struct CachedFile {
    name: String,
    file: File,
    filled_up_to: u64,
    frames: HashMap<PageIndex, Frame>,
    poisoned: bool,
}

impl CachedFile {
    fn check_bounds(&self, file_id: FileId, page_index: PageIndex) -> Result<(), CacheError> {
        if page_index >= self.filled_up_to {
            return Err(CacheError::PageOutOfBounds {
                file_id,
                page_index,
                filled_up_to: self.filled_up_to,
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct CacheState {
    files: HashMap<FileId, CachedFile>,
    names: HashMap<String, FileId>,
    next_file_id: FileId,
}

impl CacheState {
    fn file(&self, file_id: FileId) -> Result<&CachedFile, CacheError> {
        match self.files.get(&file_id) {
            Some(file) if file.poisoned => Err(CacheError::Poisoned(file_id)),
            Some(file) => Ok(file),
            None => Err(CacheError::UnknownFile(file_id)),
        }
    }

    fn file_mut(&mut self, file_id: FileId) -> Result<&mut CachedFile, CacheError> {
        match self.files.get_mut(&file_id) {
            Some(file) if file.poisoned => Err(CacheError::Poisoned(file_id)),
            Some(file) => Ok(file),
            None => Err(CacheError::UnknownFile(file_id)),
        }
    }

    /// Drop one frame nobody holds a guard on. Returns false if all are pinned.
    fn evict_one(&mut self) -> bool {
        for file in self.files.values_mut() {
            let victim = file
                .frames
                .iter()
                .find(|(_, frame)| Arc::strong_count(frame) == 1)
                .map(|(index, _)| *index);
            if let Some(index) = victim {
                file.frames.remove(&index);
                return true;
            }
        }
        false
    }

    fn register(&mut self, name: &str, file: File, filled_up_to: u64) -> FileId {
        let file_id = self.next_file_id;
        self.next_file_id += 1;
        self.files.insert(
            file_id,
            CachedFile {
                name: name.to_string(),
                file,
                filled_up_to,
                frames: HashMap::new(),
                poisoned: false,
            },
        );
        self.names.insert(name.to_string(), file_id);
        file_id
    }
}

/// The page cache shared by every component of a database.
pub struct FileCache {
    directory: PathBuf,
    pool: Arc<BufferPool>,
    state: Mutex<CacheState>,
}

impl FileCache {
    /// Create a cache over `directory`, creating the directory if needed.
    pub fn new(directory: &Path, pool: Arc<BufferPool>) -> Result<Self, CacheError> {
        std::fs::create_dir_all(directory).map_err(CacheError::Io)?;
        Ok(Self {
            directory: directory.to_path_buf(),
            pool,
            state: Mutex::new(CacheState::default()),
        })
    }

    /// Directory holding the cache's files.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Create a new, empty file.
    pub fn add_file(&self, name: &str) -> Result<FileId, CacheError> {
        let path = self.directory.join(name);
        let mut state = self.state.lock();
        if state.names.contains_key(name) || path.exists() {
            return Err(CacheError::AlreadyExists(path));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(CacheError::Io)?;

        tracing::debug!("Created file {}", path.display());
        Ok(state.register(name, file, 0))
    }

    /// Open an existing file, or return its id if it is already open.
    pub fn open_file(&self, name: &str) -> Result<FileId, CacheError> {
        let mut state = self.state.lock();
        if let Some(file_id) = state.names.get(name) {
            return Ok(*file_id);
        }

        let path = self.directory.join(name);
        if !path.exists() {
            return Err(CacheError::FileNotFound(path));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(CacheError::Io)?;
        let length = file.metadata().map_err(CacheError::Io)?.len();

        Ok(state.register(name, file, length / PAGE_SIZE_U64))
    }

    /// Id of an open file.
    #[must_use]
    pub fn file_id(&self, name: &str) -> Option<FileId> {
        self.state.lock().names.get(name).copied()
    }

    /// Name of an open file.
    pub fn file_name(&self, file_id: FileId) -> Result<String, CacheError> {
        Ok(self.state.lock().file(file_id)?.name.clone())
    }

    /// Whether a file with this name is open or present on disk.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.state.lock().names.contains_key(name) || self.directory.join(name).exists()
    }

    /// Number of pages in the file.
    pub fn filled_up_to(&self, file_id: FileId) -> Result<u64, CacheError> {
        Ok(self.state.lock().file(file_id)?.filled_up_to)
    }

    /// Grow the file to at least `pages` pages. New pages read as zeroes.
    pub fn extend(&self, file_id: FileId, pages: u64) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        let file = state.file_mut(file_id)?;
        if pages <= file.filled_up_to {
            return Ok(());
        }
        file.file
            .set_len(pages * PAGE_SIZE_U64)
            .map_err(CacheError::Io)?;
        tracing::debug!(
            "Extended {} from {} to {} pages",
            file.name,
            file.filled_up_to,
            pages
        );
        file.filled_up_to = pages;
        Ok(())
    }

    /// Load a page into a frame and return the frame.
    ///
    /// The frame stays resident at least as long as the returned `Arc` lives.
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn load_page(&self, file_id: FileId, page_index: PageIndex) -> Result<Frame, CacheError> {
        let mut state = self.state.lock();
        {
            let file = state.file(file_id)?;
            if let Some(frame) = file.frames.get(&page_index) {
                return Ok(Arc::clone(frame));
            }
            file.check_bounds(file_id, page_index)?;
        }

        let mut page = loop {
            if let Some(page) = self.pool.lease_page() {
                break page;
            }
            if !state.evict_one() {
                return Err(CacheError::BufferPoolExhausted);
            }
        };

        let file = state.file_mut(file_id)?;
        file.file
            .seek(SeekFrom::Start(page_index * PAGE_SIZE_U64))
            .map_err(CacheError::Io)?;
        file.file
            .read_exact(page.as_bytes_mut())
            .map_err(CacheError::Io)?;
        page.verify().map_err(CacheError::Page)?;

        let frame = Arc::new(RwLock::new(page));
        file.frames.insert(page_index, Arc::clone(&frame));
        Ok(frame)
    }

    /// Write a committed page to disk and to its resident frame, if any.
    ///
    /// # Pre-conditions
    /// - `page` is sealed (its checksum is current)
    /// - `page_index` is below `filled_up_to`
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn store_page(
        &self,
        file_id: FileId,
        page_index: PageIndex,
        page: &Page,
    ) -> Result<(), CacheError> {
        let frame = {
            let mut state = self.state.lock();
            let file = state.file_mut(file_id)?;
            file.check_bounds(file_id, page_index)?;
            file.file
                .seek(SeekFrom::Start(page_index * PAGE_SIZE_U64))
                .map_err(CacheError::Io)?;
            file.file
                .write_all(page.as_bytes())
                .map_err(CacheError::Io)?;
            file.frames.get(&page_index).map(Arc::clone)
        };

        if let Some(frame) = frame {
            frame.write().as_bytes_mut().copy_from_slice(page.as_bytes());
        }
        Ok(())
    }

    /// Flush a file to stable storage.
    pub fn sync(&self, file_id: FileId) -> Result<(), CacheError> {
        self.state
            .lock()
            .file(file_id)?
            .file
            .sync_all()
            .map_err(CacheError::Io)
    }

    /// Refuse every further page access to a file.
    ///
    /// Used when a commit stopped partway, leaving the file with only some of
    /// an operation's pages. The file can still be closed or deleted.
    pub fn poison_file(&self, file_id: FileId) {
        let mut state = self.state.lock();
        if let Some(file) = state.files.get_mut(&file_id) {
            file.poisoned = true;
            file.frames.clear();
            tracing::error!("File {} is poisoned and will refuse page access", file.name);
        }
    }

    /// Sync and forget a file. Its frames are dropped.
    pub fn close_file(&self, file_id: FileId) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        let file = state
            .files
            .remove(&file_id)
            .ok_or(CacheError::UnknownFile(file_id))?;
        state.names.remove(&file.name);
        file.file.sync_all().map_err(CacheError::Io)
    }

    /// Forget a file and remove it from disk.
    pub fn delete_file(&self, file_id: FileId) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        let file = state
            .files
            .remove(&file_id)
            .ok_or(CacheError::UnknownFile(file_id))?;
        state.names.remove(&file.name);
        drop(file.file);
        let path = self.directory.join(&file.name);
        std::fs::remove_file(&path).map_err(CacheError::Io)?;
        tracing::debug!("Deleted file {}", path.display());
        Ok(())
    }

    /// Rename an open file on disk. The id stays valid.
    pub fn rename_file(&self, file_id: FileId, new_name: &str) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        let new_path = self.directory.join(new_name);
        if state.names.contains_key(new_name) || new_path.exists() {
            return Err(CacheError::AlreadyExists(new_path));
        }
        let file = state.file_mut(file_id)?;
        std::fs::rename(self.directory.join(&file.name), &new_path).map_err(CacheError::Io)?;
        let old_name = std::mem::replace(&mut file.name, new_name.to_string());
        state.names.remove(&old_name);
        state.names.insert(new_name.to_string(), file_id);
        Ok(())
    }
}

impl PageSource for FileCache {
    fn read_page(
        &self,
        file_id: FileId,
        page_index: PageIndex,
    ) -> Result<PageReadGuard<'_>, CacheError> {
        let frame = self.load_page(file_id, page_index)?;
        Ok(PageReadGuard::Pinned(frame.read_arc()))
    }

    fn filled_up_to(&self, file_id: FileId) -> Result<u64, CacheError> {
        Self::filled_up_to(self, file_id)
    }
}

/// Errors that can occur in the page cache.
#[derive(Debug)]
pub enum CacheError {
    /// I/O error.
    Io(std::io::Error),
    /// File already exists.
    AlreadyExists(PathBuf),
    /// File does not exist on disk.
    FileNotFound(PathBuf),
    /// File id is not registered with the cache.
    UnknownFile(FileId),
    /// Page index past the end of the file.
    PageOutOfBounds {
        file_id: FileId,
        page_index: PageIndex,
        filled_up_to: u64,
    },
    /// Every frame is pinned and no buffer is free.
    BufferPoolExhausted,
    /// Page failed validation when loaded.
    Page(PageError),
    /// A commit to the file failed partway; its contents are not trusted.
    Poisoned(FileId),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::AlreadyExists(p) => write!(f, "file already exists: {}", p.display()),
            Self::FileNotFound(p) => write!(f, "file not found: {}", p.display()),
            Self::UnknownFile(id) => write!(f, "file {id} is not open"),
            Self::PageOutOfBounds {
                file_id,
                page_index,
                filled_up_to,
            } => {
                write!(
                    f,
                    "page {page_index} of file {file_id} out of bounds (filled up to {filled_up_to})"
                )
            }
            Self::BufferPoolExhausted => write!(f, "buffer pool exhausted"),
            Self::Page(e) => write!(f, "page error: {e}"),
            Self::Poisoned(id) => write!(f, "file {id} holds a partial commit"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Page(e) => Some(e),
            Self::AlreadyExists(_)
            | Self::FileNotFound(_)
            | Self::UnknownFile(_)
            | Self::PageOutOfBounds { .. }
            | Self::BufferPoolExhausted
            | Self::Poisoned(_) => None,
        }
    }
}
