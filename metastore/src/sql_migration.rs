use anyhow::{Context, Result};
use sqlx::Row;

/// The latest schema version for the metadata store.
pub const LATEST_SCHEMA_VERSION: i32 = 1;

/// Reads the current schema version; a missing table means an empty store.
pub async fn read_schema_version(tr: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> i32 {
    match sqlx::query(
        "SELECT version
         FROM schema_migration;",
    )
    .fetch_one(&mut **tr)
    .await
    {
        Ok(row) => row.get("version"),
        Err(_) => 0,
    }
}

async fn create_profiles_table(tr: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
    sqlx::query(
        "CREATE TABLE profiles(
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  name TEXT NOT NULL UNIQUE,
                  description TEXT NOT NULL DEFAULT '',
                  source_config TEXT NOT NULL,
                  source_secret BLOB NOT NULL,
                  target_config TEXT NOT NULL,
                  target_secret BLOB NOT NULL,
                  compat_mode TEXT NOT NULL,
                  created_at TEXT NOT NULL,
                  updated_at TEXT NOT NULL);",
    )
    .execute(&mut **tr)
    .await
    .with_context(|| "creating table profiles")?;
    Ok(())
}

async fn create_runs_table(tr: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
    sqlx::query(
        "CREATE TABLE migration_runs(
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  profile_id INTEGER NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
                  session_id TEXT NOT NULL UNIQUE,
                  engine TEXT NOT NULL,
                  status TEXT NOT NULL,
                  started_at TEXT NOT NULL,
                  ended_at TEXT,
                  total_partitions INTEGER NOT NULL DEFAULT 0,
                  completed_partitions INTEGER NOT NULL DEFAULT 0,
                  total_rows INTEGER NOT NULL DEFAULT 0,
                  error TEXT);",
    )
    .execute(&mut **tr)
    .await
    .with_context(|| "creating table migration_runs")?;
    sqlx::query("CREATE INDEX runs_by_profile ON migration_runs(profile_id, id);")
        .execute(&mut **tr)
        .await
        .with_context(|| "creating index runs_by_profile")?;
    Ok(())
}

async fn create_checkpoints_table(tr: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
    sqlx::query(
        "CREATE TABLE checkpoints(
                  run_id INTEGER NOT NULL REFERENCES migration_runs(id) ON DELETE CASCADE,
                  partition_name TEXT NOT NULL,
                  seq INTEGER NOT NULL,
                  table_type TEXT NOT NULL,
                  from_date INTEGER NOT NULL,
                  to_date INTEGER NOT NULL,
                  cluster_index INTEGER NOT NULL DEFAULT 0,
                  status TEXT NOT NULL DEFAULT 'pending',
                  rows_copied INTEGER NOT NULL DEFAULT 0,
                  last_offset INTEGER NOT NULL DEFAULT 0,
                  updated_at TEXT NOT NULL,
                  error TEXT,
                  PRIMARY KEY(run_id, partition_name));",
    )
    .execute(&mut **tr)
    .await
    .with_context(|| "creating table checkpoints")?;
    sqlx::query("CREATE INDEX checkpoints_by_run ON checkpoints(run_id, seq);")
        .execute(&mut **tr)
        .await
        .with_context(|| "creating index checkpoints_by_run")?;
    Ok(())
}

async fn create_logs_table(tr: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
    sqlx::query(
        "CREATE TABLE logs(
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  run_session_id TEXT NOT NULL
                      REFERENCES migration_runs(session_id) ON DELETE CASCADE,
                  ts TEXT NOT NULL,
                  level TEXT NOT NULL,
                  component TEXT NOT NULL,
                  message TEXT NOT NULL,
                  context TEXT);",
    )
    .execute(&mut **tr)
    .await
    .with_context(|| "creating table logs")?;
    sqlx::query("CREATE INDEX logs_by_session ON logs(run_session_id, id);")
        .execute(&mut **tr)
        .await
        .with_context(|| "creating index logs_by_session")?;
    Ok(())
}

async fn create_migration_table(tr: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
    sqlx::query("CREATE TABLE schema_migration(version INTEGER);")
        .execute(&mut **tr)
        .await
        .with_context(|| "creating table schema_migration")?;
    sqlx::query("INSERT INTO schema_migration VALUES(1);")
        .execute(&mut **tr)
        .await
        .with_context(|| "recording the initial schema version")?;
    Ok(())
}

async fn create_tables(tr: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<()> {
    create_profiles_table(tr).await?;
    create_runs_table(tr).await?;
    create_checkpoints_table(tr).await?;
    create_logs_table(tr).await?;
    create_migration_table(tr).await?;
    Ok(())
}

/// Brings the metadata store schema up to [`LATEST_SCHEMA_VERSION`].
pub async fn execute_migration(pool: &sqlx::SqlitePool) -> Result<()> {
    let mut tr = pool.begin().await?;
    let mut current_version = read_schema_version(&mut tr).await;
    if 0 == current_version {
        create_tables(&mut tr).await?;
        current_version = read_schema_version(&mut tr).await;
    }
    tr.commit().await?;
    anyhow::ensure!(
        current_version == LATEST_SCHEMA_VERSION,
        "unexpected metadata store schema version {current_version}"
    );
    Ok(())
}
