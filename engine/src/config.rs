//! Engine configuration module.
//!
//! This module provides configuration loading for the storage engine from
//! environment variables.
//!
//! # Environment Variables
//!
//! - `ENGINE_DATA_DIRECTORY`: Directory holding cluster files (default: `./data`)
//! - `ENGINE_BUFFER_POOL_PAGES`: Page buffers in the shared pool (default: `16384`)
//! - `ENGINE_REBUILD_FREE_SPACE_MAP`: Drop and rebuild every free-space map on open
//!   (default: `false`)
//!
//! # Invariants
//!
//! - `data_directory` is always a valid path (may not exist yet)
//! - `buffer_pool_pages` is always positive

use std::path::{Path, PathBuf};

use crate::storage::buffer_pool::DEFAULT_POOL_CAPACITY;

const DATA_DIRECTORY_VAR: &str = "ENGINE_DATA_DIRECTORY";
const BUFFER_POOL_PAGES_VAR: &str = "ENGINE_BUFFER_POOL_PAGES";
const REBUILD_FREE_SPACE_MAP_VAR: &str = "ENGINE_REBUILD_FREE_SPACE_MAP";

/// Engine configuration.
///
/// # Post-conditions
///
/// When constructed via `from_env()`:
/// - `buffer_pool_pages` is at least 1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Directory where cluster files are stored.
    pub data_directory: PathBuf,
    /// Capacity of the shared buffer pool, in pages.
    pub buffer_pool_pages: usize,
    /// Delete every free-space map before opening, forcing a rebuild.
    pub rebuild_free_space_map: bool,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl EngineConfig {
    /// Default data directory.
    pub const DEFAULT_DATA_DIRECTORY: &'static str = "./data";
    /// Default buffer pool capacity (128MB of pages).
    pub const DEFAULT_BUFFER_POOL_PAGES: usize = DEFAULT_POOL_CAPACITY;

    /// Configuration with default settings over `data_directory`.
    #[must_use]
    pub fn new(data_directory: &Path) -> Self {
        Self {
            data_directory: data_directory.to_path_buf(),
            buffer_pool_pages: Self::DEFAULT_BUFFER_POOL_PAGES,
            rebuild_free_space_map: false,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `ENGINE_BUFFER_POOL_PAGES` is set but not a positive integer
    /// - `ENGINE_REBUILD_FREE_SPACE_MAP` is set but not `true` or `false`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_directory = lookup(DATA_DIRECTORY_VAR)
            .map_or_else(|| PathBuf::from(Self::DEFAULT_DATA_DIRECTORY), PathBuf::from);
        let buffer_pool_pages = Self::parse_buffer_pool_pages(lookup(BUFFER_POOL_PAGES_VAR))?;
        let rebuild_free_space_map =
            Self::parse_rebuild_free_space_map(lookup(REBUILD_FREE_SPACE_MAP_VAR))?;

        Ok(Self {
            data_directory,
            buffer_pool_pages,
            rebuild_free_space_map,
        })
    }

    fn parse_buffer_pool_pages(value: Option<String>) -> Result<usize, ConfigError> {
        let Some(value) = value else {
            return Ok(Self::DEFAULT_BUFFER_POOL_PAGES);
        };
        match value.parse::<usize>() {
            Ok(pages) if pages > 0 => Ok(pages),
            _ => Err(ConfigError::InvalidValue {
                name: BUFFER_POOL_PAGES_VAR.to_string(),
                message: format!("'{value}' is not a positive integer"),
            }),
        }
    }

    fn parse_rebuild_free_space_map(value: Option<String>) -> Result<bool, ConfigError> {
        match value.as_deref() {
            None => Ok(false),
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => Err(ConfigError::InvalidValue {
                name: REBUILD_FREE_SPACE_MAP_VAR.to_string(),
                message: format!("'{other}' is not 'true' or 'false'"),
            }),
        }
    }
}
