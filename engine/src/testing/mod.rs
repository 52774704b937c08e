use tempfile::TempDir;

use crate::config::EngineConfig;
use crate::storage::{Database, DatabaseError};

/// Buffer pool size for test databases, small enough to exercise eviction.
const TEST_POOL_PAGES: usize = 64;

/// Create a new test database in a fresh temporary directory.
///
/// The directory is deleted when the returned `TempDir` is dropped, so keep it
/// alive for as long as the database is in use.
pub fn new_test_database() -> Result<(TempDir, Database), DatabaseError> {
    let dir = tempfile::tempdir().map_err(DatabaseError::Io)?;
    let mut config = EngineConfig::new(dir.path());
    config.buffer_pool_pages = TEST_POOL_PAGES;
    let database = Database::open(&config)?;
    Ok((dir, database))
}
