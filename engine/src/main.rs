#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
// Test code is allowed to use unwrap() for convenience.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

use engine::config::EngineConfig;
use engine::storage::Database;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment variables
    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Loaded configuration: data_directory={}, buffer_pool_pages={}, rebuild_free_space_map={}",
        config.data_directory.display(),
        config.buffer_pool_pages,
        config.rebuild_free_space_map
    );

    // Opening rebuilds any missing free-space map, so this doubles as a repair tool.
    let database = match Database::open(&config) {
        Ok(database) => database,
        Err(e) => {
            tracing::error!("Failed to open database: {e}");
            std::process::exit(1);
        }
    };

    for name in database.cluster_names() {
        let Some(cluster) = database.cluster(&name) else {
            continue;
        };
        match (cluster.entries(), cluster.records_size()) {
            (Ok(entries), Ok(records_size)) => tracing::info!(
                "Cluster {name}: id={}, entries={entries}, records_size={records_size}",
                cluster.id()
            ),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!("Failed to read state of cluster {name}: {e}");
            }
        }
    }

    if let Err(e) = database.close() {
        tracing::error!("Failed to close database: {e}");
        std::process::exit(1);
    }
}
