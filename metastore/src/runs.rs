use crate::metadata_db::MetadataDb;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

/// Terminal and non-terminal states of a run as persisted in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => bail!("unknown run status '{other}'"),
        }
    }
}

/// One activation of the engine against a profile.
#[derive(Debug, Clone)]
pub struct MigrationRun {
    pub id: i64,
    pub profile_id: i64,
    pub session_id: Uuid,
    pub engine: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_partitions: i64,
    pub completed_partitions: i64,
    pub total_rows: i64,
    pub error: Option<String>,
}

fn run_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<MigrationRun> {
    let session: String = row.try_get("session_id")?;
    let status: String = row.try_get("status")?;
    Ok(MigrationRun {
        id: row.try_get("id")?,
        profile_id: row.try_get("profile_id")?,
        session_id: Uuid::parse_str(&session).with_context(|| "parsing run session id")?,
        engine: row.try_get("engine")?,
        status: RunStatus::parse(&status)?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        total_partitions: row.try_get("total_partitions")?,
        completed_partitions: row.try_get("completed_partitions")?,
        total_rows: row.try_get("total_rows")?,
        error: row.try_get("error")?,
    })
}

pub async fn insert_run(
    db: &MetadataDb,
    profile_id: i64,
    session_id: Uuid,
    engine: &str,
    total_partitions: i64,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO migration_runs(profile_id, session_id, engine, status,
                                    started_at, total_partitions)
         VALUES($1,$2,$3,'running',$4,$5);",
    )
    .bind(profile_id)
    .bind(session_id.to_string())
    .bind(engine)
    .bind(Utc::now())
    .bind(total_partitions)
    .execute(&db.write_pool)
    .await
    .with_context(|| "inserting migration run")?;
    Ok(result.last_insert_rowid())
}

pub async fn get_run(db: &MetadataDb, run_id: i64) -> Result<Option<MigrationRun>> {
    let row = sqlx::query("SELECT * FROM migration_runs WHERE id = $1;")
        .bind(run_id)
        .fetch_optional(&db.read_pool)
        .await
        .with_context(|| "loading migration run")?;
    match row {
        Some(row) => Ok(Some(run_from_row(&row)?)),
        None => Ok(None),
    }
}

pub async fn set_run_status(db: &MetadataDb, run_id: i64, status: RunStatus) -> Result<()> {
    sqlx::query("UPDATE migration_runs SET status = $1 WHERE id = $2;")
        .bind(status.as_str())
        .bind(run_id)
        .execute(&db.write_pool)
        .await
        .with_context(|| "updating run status")?;
    Ok(())
}

/// Records the partition count once discovery has run.
pub async fn set_run_totals(db: &MetadataDb, run_id: i64, total_partitions: i64) -> Result<()> {
    sqlx::query("UPDATE migration_runs SET total_partitions = $1 WHERE id = $2;")
        .bind(total_partitions)
        .bind(run_id)
        .execute(&db.write_pool)
        .await
        .with_context(|| "updating run totals")?;
    Ok(())
}

pub async fn update_run_counters(
    db: &MetadataDb,
    run_id: i64,
    completed_partitions: i64,
    total_rows: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE migration_runs
         SET completed_partitions = $1, total_rows = $2
         WHERE id = $3;",
    )
    .bind(completed_partitions)
    .bind(total_rows)
    .bind(run_id)
    .execute(&db.write_pool)
    .await
    .with_context(|| "updating run counters")?;
    Ok(())
}

/// Closes a run: terminal status, end time and error text.
pub async fn finish_run(
    db: &MetadataDb,
    run_id: i64,
    status: RunStatus,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE migration_runs
         SET status = $1, ended_at = $2, error = $3
         WHERE id = $4;",
    )
    .bind(status.as_str())
    .bind(Utc::now())
    .bind(error)
    .bind(run_id)
    .execute(&db.write_pool)
    .await
    .with_context(|| "finishing run")?;
    Ok(())
}

/// The latest run for `profile_id` that can be resumed, if any.
pub async fn incomplete_for(db: &MetadataDb, profile_id: i64) -> Result<Option<MigrationRun>> {
    let row = sqlx::query(
        "SELECT * FROM migration_runs
         WHERE profile_id = $1 AND status IN ('running','paused','failed')
         ORDER BY id DESC
         LIMIT 1;",
    )
    .bind(profile_id)
    .fetch_optional(&db.read_pool)
    .await
    .with_context(|| "looking up incomplete runs")?;
    match row {
        Some(row) => Ok(Some(run_from_row(&row)?)),
        None => Ok(None),
    }
}

pub async fn list_recent_runs(db: &MetadataDb, limit: i64) -> Result<Vec<MigrationRun>> {
    let rows = sqlx::query(
        "SELECT * FROM migration_runs
         ORDER BY id DESC
         LIMIT $1;",
    )
    .bind(limit)
    .fetch_all(&db.read_pool)
    .await
    .with_context(|| "listing runs")?;
    rows.iter().map(run_from_row).collect()
}

/// Removes a run; checkpoints and log entries cascade with it.
pub async fn delete_run(db: &MetadataDb, run_id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM migration_runs WHERE id = $1;")
        .bind(run_id)
        .execute(&db.write_pool)
        .await
        .with_context(|| "deleting run")?;
    Ok(result.rows_affected() > 0)
}
