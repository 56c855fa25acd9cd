use crate::metadata_db::MetadataDb;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;

/// A structured log line as persisted in the `logs` table. The message and
/// context are masked before they reach this type.
#[derive(Debug, Clone)]
pub struct StoredLogEntry {
    pub run_session_id: String,
    pub ts: DateTime<Utc>,
    pub level: String,
    pub component: String,
    pub message: String,
    pub context: Option<String>,
}

/// Bulk append inside one transaction. Callers batch through the background
/// writer; a failure here degrades to stderr rather than interrupting a run.
pub async fn append_batch(db: &MetadataDb, entries: &[StoredLogEntry]) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let mut tr = db.write_pool.begin().await?;
    for entry in entries {
        sqlx::query(
            "INSERT INTO logs(run_session_id, ts, level, component, message, context)
             VALUES($1,$2,$3,$4,$5,$6);",
        )
        .bind(&entry.run_session_id)
        .bind(entry.ts)
        .bind(&entry.level)
        .bind(&entry.component)
        .bind(&entry.message)
        .bind(&entry.context)
        .execute(&mut *tr)
        .await
        .with_context(|| "appending log entry")?;
    }
    tr.commit().await?;
    Ok(())
}

pub async fn entries_for_session(
    db: &MetadataDb,
    run_session_id: &str,
    limit: i64,
) -> Result<Vec<StoredLogEntry>> {
    let rows = sqlx::query(
        "SELECT run_session_id, ts, level, component, message, context
         FROM logs
         WHERE run_session_id = $1
         ORDER BY id
         LIMIT $2;",
    )
    .bind(run_session_id)
    .bind(limit)
    .fetch_all(&db.read_pool)
    .await
    .with_context(|| "listing log entries")?;
    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        entries.push(StoredLogEntry {
            run_session_id: row.try_get("run_session_id")?,
            ts: row.try_get("ts")?,
            level: row.try_get("level")?,
            component: row.try_get("component")?,
            message: row.try_get("message")?,
            context: row.try_get("context")?,
        });
    }
    Ok(entries)
}
