//! Paginated record storage engine.
//!
//! Records live in clusters. Each cluster is a set of fixed-size-page files:
//! slotted data pages holding record chunks, a position map from logical
//! position to head chunk, and a two-level free-space map that finds a page
//! with room for the next chunk in two page reads.
//!
//! # File Format
//!
//! Every file is a sequence of 8KB pages, each starting with the common
//! [`PageHeader`]:
//!
//! - `{name}.pcl`: page 0 is the cluster state, pages 1-N are data pages
//! - `{name}.cpm`: page 0 holds the position count, pages 1-N hold entries
//! - `{name}.fsm`: page 0 is the root tree, pages 1-N are leaf-group trees
//!
//! # Usage
//!
//! ```ignore
//! use engine::config::EngineConfig;
//! use engine::storage::Database;
//!
//! let database = Database::open(&EngineConfig::new(path))?;
//! let people = database.add_cluster("people")?;
//!
//! let created = database.execute(|operation| {
//!     people.create_record(operation, 1, b"hello", 1, None)
//! })?;
//! let record = people.read_record(created.position, 0)?;
//!
//! database.close()?;
//! ```

pub mod atomic;
pub mod buffer_pool;
pub mod cluster;
mod database;
pub mod file_cache;
pub mod free_space;
pub mod page;

pub use database::{Database, DatabaseError};
pub use page::{PAGE_SIZE, Page, PageError, PageHeader, PageIndex, PageType};
