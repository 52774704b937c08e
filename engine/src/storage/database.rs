//! High-level database interface.
//!
//! A database is a directory of clusters sharing one buffer pool, one page
//! cache and one atomic operations manager.
//!
//! # Invariants
//!
//! - Each cluster name maps to exactly one open `PaginatedCluster`
//! - Cluster ids are unique for the lifetime of the `Database`

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::config::EngineConfig;
use crate::storage::atomic::{AtomicOperation, AtomicOperationsManager, ComponentId};
use crate::storage::buffer_pool::BufferPool;
use crate::storage::cluster::{CLUSTER_EXTENSION, ClusterError, PaginatedCluster};
use crate::storage::file_cache::{CacheError, FileCache};
use crate::storage::free_space::FreeSpaceMap;

/// A database instance.
///
/// This is the main entry point for working with the storage engine.
pub struct Database {
    manager: Arc<AtomicOperationsManager>,
    clusters: RwLock<HashMap<String, Arc<PaginatedCluster>>>,
    next_cluster_id: AtomicU32,
}

impl Database {
    /// Open the database in `config.data_directory`, creating the directory if needed.
    ///
    /// Every `*.pcl` file found becomes an open cluster. With
    /// `rebuild_free_space_map`, each cluster's free-space map is deleted first
    /// and rebuilt from its data pages.
    pub fn open(config: &EngineConfig) -> Result<Self, DatabaseError> {
        let pool = BufferPool::new(config.buffer_pool_pages);
        let cache = FileCache::new(&config.data_directory, pool)?;

        let mut names: Vec<String> = std::fs::read_dir(cache.directory())
            .map_err(DatabaseError::Io)?
            .filter_map(|entry| {
                let file_name = entry.ok()?.file_name().into_string().ok()?;
                file_name
                    .strip_suffix(CLUSTER_EXTENSION)
                    .map(str::to_string)
            })
            .collect();
        names.sort();

        if config.rebuild_free_space_map {
            for name in &names {
                let path = cache.directory().join(FreeSpaceMap::file_name(name));
                if path.exists() {
                    std::fs::remove_file(&path).map_err(DatabaseError::Io)?;
                    tracing::info!("Removed free-space map {} for rebuild", path.display());
                }
            }
        }

        let database = Self {
            manager: Arc::new(AtomicOperationsManager::new(Arc::new(cache))),
            clusters: RwLock::new(HashMap::new()),
            next_cluster_id: AtomicU32::new(1),
        };
        for name in names {
            #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
            let cluster = PaginatedCluster::open(
                Arc::clone(&database.manager),
                database.allocate_cluster_id(),
                &name,
            )?;
            database.clusters.write().insert(name, Arc::new(cluster));
        }

        tracing::info!(
            "Opened database in {} with {} clusters",
            config.data_directory.display(),
            database.clusters.read().len()
        );
        Ok(database)
    }

    fn allocate_cluster_id(&self) -> ComponentId {
        self.next_cluster_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The atomic operations manager shared by every cluster.
    #[must_use]
    pub const fn manager(&self) -> &Arc<AtomicOperationsManager> {
        &self.manager
    }

    #[must_use]
    pub fn cache(&self) -> &FileCache {
        self.manager.cache()
    }

    /// Begin an atomic operation.
    pub fn start(&self) -> AtomicOperation<'_> {
        self.manager.start()
    }

    /// Run `f` inside one atomic operation, committing on `Ok`.
    pub fn execute<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut AtomicOperation<'_>) -> Result<T, E>,
        E: From<CacheError>,
    {
        self.manager.execute(f)
    }

    /// Create a new, empty cluster.
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn add_cluster(&self, name: &str) -> Result<Arc<PaginatedCluster>, DatabaseError> {
        let mut clusters = self.clusters.write();
        if clusters.contains_key(name) {
            return Err(DatabaseError::ClusterExists(name.to_string()));
        }

        let id = self.allocate_cluster_id();
        let cluster = self.manager.execute(|operation| {
            PaginatedCluster::create(Arc::clone(&self.manager), operation, id, name)
        })?;
        let cluster = Arc::new(cluster);
        clusters.insert(name.to_string(), Arc::clone(&cluster));
        Ok(cluster)
    }

    /// Look up an open cluster by name.
    #[must_use]
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn cluster(&self, name: &str) -> Option<Arc<PaginatedCluster>> {
        self.clusters.read().get(name).map(Arc::clone)
    }

    /// Names of every open cluster, sorted.
    #[must_use]
    pub fn cluster_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Delete an empty cluster and its files.
    pub fn drop_cluster(&self, name: &str) -> Result<(), DatabaseError> {
        let mut clusters = self.clusters.write();
        let cluster = clusters
            .get(name)
            .ok_or_else(|| DatabaseError::ClusterNotFound(name.to_string()))?;
        self.manager
            .execute(|operation| cluster.delete(operation))?;
        clusters.remove(name);
        Ok(())
    }

    /// Rename a cluster and its files.
    pub fn rename_cluster(&self, old_name: &str, new_name: &str) -> Result<(), DatabaseError> {
        let mut clusters = self.clusters.write();
        if clusters.contains_key(new_name) {
            return Err(DatabaseError::ClusterExists(new_name.to_string()));
        }
        let cluster = clusters
            .remove(old_name)
            .ok_or_else(|| DatabaseError::ClusterNotFound(old_name.to_string()))?;

        if let Err(e) = cluster.rename(new_name) {
            clusters.insert(old_name.to_string(), cluster);
            return Err(e.into());
        }
        clusters.insert(new_name.to_string(), cluster);
        Ok(())
    }

    /// Close every cluster.
    pub fn close(self) -> Result<(), DatabaseError> {
        let clusters = self.clusters.into_inner();
        for cluster in clusters.values() {
            cluster.close()?;
        }
        tracing::info!("Closed database with {} clusters", clusters.len());
        Ok(())
    }
}

/// Errors that can occur during database operations.
#[derive(Debug)]
pub enum DatabaseError {
    /// Page cache error.
    Cache(CacheError),
    /// Cluster error.
    Cluster(ClusterError),
    /// No cluster with this name is open.
    ClusterNotFound(String),
    /// A cluster with this name is already open.
    ClusterExists(String),
    /// Directory I/O error.
    Io(std::io::Error),
}

impl std::fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cache(e) => write!(f, "cache error: {e}"),
            Self::Cluster(e) => write!(f, "cluster error: {e}"),
            Self::ClusterNotFound(name) => write!(f, "cluster not found: {name}"),
            Self::ClusterExists(name) => write!(f, "cluster already exists: {name}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for DatabaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cache(e) => Some(e),
            Self::Cluster(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::ClusterNotFound(_) | Self::ClusterExists(_) => None,
        }
    }
}

impl From<CacheError> for DatabaseError {
    fn from(e: CacheError) -> Self {
        Self::Cache(e)
    }
}

impl From<ClusterError> for DatabaseError {
    fn from(e: ClusterError) -> Self {
        Self::Cluster(e)
    }
}
