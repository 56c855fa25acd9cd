use crate::sql_migration::execute_migration;
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;

/// Connection to the embedded metadata store.
///
/// History and checkpoint updates go through `write_pool`, a single
/// connection, so that writers are serialized; readers use a separate pool.
#[derive(Debug, Clone)]
pub struct MetadataDb {
    pub write_pool: SqlitePool,
    pub read_pool: SqlitePool,
}

/// Opens (creating if needed) the metadata store at `db_path` and brings its
/// schema up to date.
pub async fn connect_to_metadata_db(db_path: &Path) -> Result<MetadataDb> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true);
    let write_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options.clone())
        .await
        .with_context(|| format!("opening metadata store {}", db_path.display()))?;
    let read_pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .with_context(|| format!("opening metadata store {} for reads", db_path.display()))?;
    execute_migration(&write_pool).await?;
    Ok(MetadataDb {
        write_pool,
        read_pool,
    })
}

impl MetadataDb {
    /// In-memory store over a single shared connection. Used by tests.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(":memory:")
                    .foreign_keys(true),
            )
            .await
            .with_context(|| "opening in-memory metadata store")?;
        execute_migration(&pool).await?;
        Ok(Self {
            write_pool: pool.clone(),
            read_pool: pool,
        })
    }
}
