use crate::metadata_db::MetadataDb;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => bail!("unknown checkpoint status '{other}'"),
        }
    }
}

/// Per-partition progress record. `last_offset` is only meaningful for the
/// row-batch engine; the COPY engine restarts a partition from zero.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub run_id: i64,
    pub partition_name: String,
    pub seq: i64,
    pub table_type: String,
    pub from_date: i64,
    pub to_date: i64,
    pub cluster_index: bool,
    pub status: CheckpointStatus,
    pub rows_copied: i64,
    pub last_offset: i64,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Partition identity seeded into a fresh run, in discovery order.
#[derive(Debug, Clone)]
pub struct CheckpointSeed {
    pub partition_name: String,
    pub table_type: String,
    pub from_date: i64,
    pub to_date: i64,
    pub cluster_index: bool,
}

fn checkpoint_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Checkpoint> {
    let status: String = row.try_get("status")?;
    Ok(Checkpoint {
        run_id: row.try_get("run_id")?,
        partition_name: row.try_get("partition_name")?,
        seq: row.try_get("seq")?,
        table_type: row.try_get("table_type")?,
        from_date: row.try_get("from_date")?,
        to_date: row.try_get("to_date")?,
        cluster_index: row.try_get("cluster_index")?,
        status: CheckpointStatus::parse(&status)?,
        rows_copied: row.try_get("rows_copied")?,
        last_offset: row.try_get("last_offset")?,
        updated_at: row.try_get("updated_at")?,
        error: row.try_get("error")?,
    })
}

/// Seeds one pending checkpoint per partition inside a single transaction,
/// preserving discovery order.
pub async fn seed_checkpoints(db: &MetadataDb, run_id: i64, seeds: &[CheckpointSeed]) -> Result<()> {
    let mut tr = db.write_pool.begin().await?;
    let now = Utc::now();
    for (index, seed) in seeds.iter().enumerate() {
        sqlx::query(
            "INSERT INTO checkpoints(run_id, partition_name, seq, table_type,
                                     from_date, to_date, cluster_index, updated_at)
             VALUES($1,$2,$3,$4,$5,$6,$7,$8);",
        )
        .bind(run_id)
        .bind(&seed.partition_name)
        .bind(index as i64)
        .bind(&seed.table_type)
        .bind(seed.from_date)
        .bind(seed.to_date)
        .bind(seed.cluster_index)
        .bind(now)
        .execute(&mut *tr)
        .await
        .with_context(|| format!("seeding checkpoint for {}", seed.partition_name))?;
    }
    tr.commit().await?;
    Ok(())
}

pub async fn get_checkpoint(
    db: &MetadataDb,
    run_id: i64,
    partition_name: &str,
) -> Result<Option<Checkpoint>> {
    let row = sqlx::query(
        "SELECT * FROM checkpoints
         WHERE run_id = $1 AND partition_name = $2;",
    )
    .bind(run_id)
    .bind(partition_name)
    .fetch_optional(&db.read_pool)
    .await
    .with_context(|| format!("loading checkpoint for {partition_name}"))?;
    match row {
        Some(row) => Ok(Some(checkpoint_from_row(&row)?)),
        None => Ok(None),
    }
}

pub async fn mark_in_progress(db: &MetadataDb, run_id: i64, partition_name: &str) -> Result<()> {
    sqlx::query(
        "UPDATE checkpoints
         SET status = 'in_progress', error = NULL, updated_at = $1
         WHERE run_id = $2 AND partition_name = $3;",
    )
    .bind(Utc::now())
    .bind(run_id)
    .bind(partition_name)
    .execute(&db.write_pool)
    .await
    .with_context(|| format!("marking {partition_name} in progress"))?;
    Ok(())
}

/// Commits one batch worth of progress for the row-batch engine.
pub async fn record_batch(
    db: &MetadataDb,
    run_id: i64,
    partition_name: &str,
    rows_copied: i64,
    last_offset: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE checkpoints
         SET rows_copied = $1, last_offset = $2, updated_at = $3
         WHERE run_id = $4 AND partition_name = $5;",
    )
    .bind(rows_copied)
    .bind(last_offset)
    .bind(Utc::now())
    .bind(run_id)
    .bind(partition_name)
    .execute(&db.write_pool)
    .await
    .with_context(|| format!("recording batch for {partition_name}"))?;
    Ok(())
}

/// Completed checkpoints are never reopened within the same run.
pub async fn mark_completed(
    db: &MetadataDb,
    run_id: i64,
    partition_name: &str,
    rows_copied: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE checkpoints
         SET status = 'completed', rows_copied = $1, error = NULL, updated_at = $2
         WHERE run_id = $3 AND partition_name = $4;",
    )
    .bind(rows_copied)
    .bind(Utc::now())
    .bind(run_id)
    .bind(partition_name)
    .execute(&db.write_pool)
    .await
    .with_context(|| format!("marking {partition_name} completed"))?;
    Ok(())
}

pub async fn mark_failed(
    db: &MetadataDb,
    run_id: i64,
    partition_name: &str,
    error: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE checkpoints
         SET status = 'failed', error = $1, updated_at = $2
         WHERE run_id = $3 AND partition_name = $4;",
    )
    .bind(error)
    .bind(Utc::now())
    .bind(run_id)
    .bind(partition_name)
    .execute(&db.write_pool)
    .await
    .with_context(|| format!("marking {partition_name} failed"))?;
    Ok(())
}

/// Partitions still to process for a resumed run, in original order.
pub async fn pending_for(db: &MetadataDb, run_id: i64) -> Result<Vec<Checkpoint>> {
    let rows = sqlx::query(
        "SELECT * FROM checkpoints
         WHERE run_id = $1 AND status != 'completed'
         ORDER BY seq;",
    )
    .bind(run_id)
    .fetch_all(&db.read_pool)
    .await
    .with_context(|| "listing pending checkpoints")?;
    rows.iter().map(checkpoint_from_row).collect()
}

/// Completed partition count and their summed rows, used to re-base run
/// counters on resume.
pub async fn completed_totals(db: &MetadataDb, run_id: i64) -> Result<(i64, i64)> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS done, COALESCE(SUM(rows_copied), 0) AS rows
         FROM checkpoints
         WHERE run_id = $1 AND status = 'completed';",
    )
    .bind(run_id)
    .fetch_one(&db.read_pool)
    .await
    .with_context(|| "summing completed checkpoints")?;
    Ok((row.try_get("done")?, row.try_get("rows")?))
}

pub async fn completed_names(db: &MetadataDb, run_id: i64) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT partition_name FROM checkpoints
         WHERE run_id = $1 AND status = 'completed'
         ORDER BY seq;",
    )
    .bind(run_id)
    .fetch_all(&db.read_pool)
    .await
    .with_context(|| "listing completed checkpoints")?;
    rows.iter()
        .map(|row| row.try_get("partition_name").map_err(Into::into))
        .collect()
}
