use crate::error::{transient_backoff, transient_db_error};
use crate::logging::SessionLogger;
use anyhow::{bail, Context, Result};
use partmig_metastore::profiles::{CompatMode, ConnectionConfig};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{Executor, PgPool};
use std::sync::Arc;
use tokio_retry2::{Retry, RetryError};

/// Timeout for counts and DDL. COPY statements run unbounded.
pub const STATEMENT_TIMEOUT_MS: i64 = 60_000;

fn parse_ssl_mode(value: &str) -> Result<PgSslMode> {
    Ok(match value.to_ascii_lowercase().as_str() {
        "disable" => PgSslMode::Disable,
        "allow" => PgSslMode::Allow,
        "prefer" => PgSslMode::Prefer,
        "require" => PgSslMode::Require,
        "verify-ca" => PgSslMode::VerifyCa,
        "verify-full" => PgSslMode::VerifyFull,
        other => bail!("unknown sslmode '{other}'"),
    })
}

fn pg_options(cfg: &ConnectionConfig) -> Result<PgConnectOptions> {
    Ok(PgConnectOptions::new()
        .host(&cfg.host)
        .port(cfg.port)
        .database(&cfg.dbname)
        .username(&cfg.user)
        .password(&cfg.password)
        .ssl_mode(parse_ssl_mode(&cfg.sslmode)?))
}

/// Short human-readable endpoint for connection-status events and logs.
pub fn endpoint_desc(cfg: &ConnectionConfig) -> String {
    format!("{}:{}/{}", cfg.host, cfg.port, cfg.dbname)
}

/// Plain pool without session tuning; used for the source side and for
/// version detection.
pub async fn connect(cfg: &ConnectionConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(2)
        .connect_with(pg_options(cfg)?)
        .await
        .with_context(|| format!("connecting to {}", endpoint_desc(cfg)))
}

/// Resolves `auto` against the server actually reached.
pub async fn detect_compat_mode(pool: &PgPool) -> Result<CompatMode> {
    let version: String = sqlx::query_scalar("SHOW server_version_num;")
        .fetch_one(pool)
        .await
        .with_context(|| "reading server_version_num")?;
    let num: i64 = version
        .trim()
        .parse()
        .with_context(|| format!("parsing server_version_num '{version}'"))?;
    Ok(if num < 100_000 {
        CompatMode::V9_3
    } else {
        CompatMode::V16
    })
}

fn tuning_statements(mode: CompatMode) -> &'static [&'static str] {
    match mode {
        CompatMode::V9_3 => &["SET synchronous_commit = off", "SET work_mem = '128MB'"],
        CompatMode::V16 => &["SET work_mem = '256MB'", "SET max_wal_size = '4GB'"],
        CompatMode::Auto => &[],
    }
}

/// Target pool whose connections receive the bulk-load session tuning as
/// they are opened. `mode` must already be resolved; settings the server
/// rejects are logged and skipped.
pub async fn connect_target(
    cfg: &ConnectionConfig,
    mode: CompatMode,
    logger: Arc<SessionLogger>,
) -> Result<PgPool> {
    let endpoint = endpoint_desc(cfg);
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .after_connect(move |conn, _meta| {
            let logger = logger.clone();
            Box::pin(async move {
                for statement in tuning_statements(mode) {
                    if let Err(e) = conn.execute(*statement).await {
                        logger.warning(
                            "session",
                            format!("session setting skipped ({statement}): {e}"),
                        );
                    }
                }
                Ok(())
            })
        })
        .connect_with(pg_options(cfg)?)
        .await
        .with_context(|| format!("connecting to {endpoint}"))?;
    Ok(pool)
}

async fn run_count(pool: &PgPool, sql: &str) -> Result<i64, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    conn.execute(format!("SET statement_timeout = {STATEMENT_TIMEOUT_MS};").as_str())
        .await?;
    sqlx::query_scalar(sql).fetch_one(&mut *conn).await
}

/// Exact row count with a bounded statement timeout, retried on transient
/// failures.
pub async fn count_rows(pool: &PgPool, table: &str) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {table};");
    Retry::spawn(transient_backoff(), || async {
        run_count(pool, &sql).await.map_err(|e| {
            if transient_db_error(&e) {
                RetryError::transient(e)
            } else {
                RetryError::permanent(e)
            }
        })
    })
    .await
    .with_context(|| format!("counting rows in {table}"))
}
