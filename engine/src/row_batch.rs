use crate::connect::count_rows;
use crate::error::{is_memory_pressure, is_transient, store_fatal, transient_backoff};
use crate::schema::{ensure_partition_ready, ensure_target_schema, ReadyMode};
use crate::table_types::{spec_for, CellValue, TableTypeSpec};
use crate::worker::{PartitionContext, PartitionPlan};
use anyhow::{Context, Result};
use partmig_metastore::checkpoints;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::time::{Duration, Instant};

pub const INITIAL_BATCH_SIZE: i64 = 100_000;
pub const MIN_BATCH_SIZE: i64 = 10_000;
pub const MAX_BATCH_SIZE: i64 = 500_000;
const GROW_THRESHOLD: Duration = Duration::from_secs(1);
const SHRINK_THRESHOLD: Duration = Duration::from_secs(10);

// Postgres caps bind parameters per statement at 65535; inserts are chunked
// below this budget inside the batch transaction.
const MAX_BIND_PARAMS: usize = 60_000;

/// Adapts the batch size to observed batch latency: fast batches grow ×1.5
/// up to the cap, slow ones halve down to the floor.
#[derive(Debug, Clone, Copy)]
pub struct BatchSizer {
    current: i64,
}

impl BatchSizer {
    pub fn new() -> Self {
        Self {
            current: INITIAL_BATCH_SIZE,
        }
    }

    pub fn current(&self) -> i64 {
        self.current
    }

    pub fn observe(&mut self, elapsed: Duration) {
        if elapsed < GROW_THRESHOLD {
            self.current = ((self.current as f64 * 1.5) as i64).min(MAX_BATCH_SIZE);
        } else if elapsed > SHRINK_THRESHOLD {
            self.current = (self.current / 2).max(MIN_BATCH_SIZE);
        }
    }

    /// Memory-pressure response; the caller retries the batch once.
    pub fn halve(&mut self) {
        self.current = (self.current / 2).max(MIN_BATCH_SIZE);
    }
}

impl Default for BatchSizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetches one page and rewrites it into the target child inside a single
/// transaction. Returns rows moved and their approximate wire size.
async fn copy_one_batch(
    source: &PgPool,
    target: &PgPool,
    spec: &TableTypeSpec,
    child: &str,
    select_sql: &str,
    offset: i64,
    limit: i64,
) -> Result<(usize, i64)> {
    let rows = sqlx::query(select_sql)
        .bind(limit)
        .bind(offset)
        .fetch_all(source)
        .await
        .with_context(|| format!("fetching batch from {child} at offset {offset}"))?;
    if rows.is_empty() {
        return Ok((0, 0));
    }
    let mut bytes: i64 = 0;
    let mut decoded: Vec<Vec<CellValue>> = Vec::with_capacity(rows.len());
    for row in &rows {
        let mut cells = Vec::with_capacity(spec.columns.len());
        for (index, column) in spec.columns.iter().enumerate() {
            let cell = column.kind.decode(row, index)?;
            bytes += cell.approx_size() as i64;
            cells.push(cell);
        }
        decoded.push(cells);
    }
    let fetched = decoded.len();

    let insert_prefix = format!("INSERT INTO {} ({}) ", child, spec.column_list());
    let rows_per_statement = (MAX_BIND_PARAMS / spec.columns.len()).max(1);
    let mut tr = target.begin().await?;
    let mut remaining = decoded.into_iter();
    loop {
        let chunk: Vec<Vec<CellValue>> = remaining.by_ref().take(rows_per_statement).collect();
        if chunk.is_empty() {
            break;
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(insert_prefix.as_str());
        builder.push_values(chunk, |mut b, row| {
            for cell in row {
                match cell {
                    CellValue::Int8(v) => {
                        b.push_bind(v);
                    }
                    CellValue::Int4(v) => {
                        b.push_bind(v);
                    }
                    CellValue::Text(v) => {
                        b.push_bind(v);
                    }
                    CellValue::Bool(v) => {
                        b.push_bind(v);
                    }
                    CellValue::Float8(v) => {
                        b.push_bind(v);
                    }
                    CellValue::Timestamp(v) => {
                        b.push_bind(v);
                    }
                }
            }
        });
        builder
            .build()
            .execute(&mut *tr)
            .await
            .with_context(|| format!("inserting batch into {child}"))?;
    }
    tr.commit()
        .await
        .with_context(|| format!("committing batch into {child}"))?;
    Ok((fetched, bytes))
}

/// Transient failures back off 1 s / 4 s / 16 s; a memory-pressure error
/// halves the batch and retries once.
async fn run_batch_with_retry(
    ctx: &mut PartitionContext<'_>,
    spec: &TableTypeSpec,
    select_sql: &str,
    offset: i64,
    sizer: &mut BatchSizer,
) -> Result<(usize, i64)> {
    let mut backoff = transient_backoff();
    let mut halved = false;
    loop {
        let attempt = copy_one_batch(
            ctx.source,
            ctx.target,
            spec,
            &ctx.desc.child,
            select_sql,
            offset,
            sizer.current(),
        )
        .await;
        match attempt {
            Ok(result) => return Ok(result),
            Err(e) if is_memory_pressure(&e) && !halved => {
                halved = true;
                sizer.halve();
                ctx.logger.warning(
                    "row-batch",
                    format!(
                        "memory pressure on {}, halving batch to {}",
                        ctx.desc.child,
                        sizer.current()
                    ),
                );
            }
            Err(e) if is_transient(&e) => match backoff.next() {
                Some(delay) => {
                    ctx.logger.warning(
                        "row-batch",
                        format!(
                            "transient failure on {}, retrying in {delay:?}: {e:#}",
                            ctx.desc.child
                        ),
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}

/// Moves one partition with batched SELECT + parameterized INSERT,
/// checkpointing offset and row count after every committed batch.
///
/// Offsets are only stable when the source is quiescent during the
/// migration; the ORDER BY key guarantees a repeatable page sequence for
/// resumed runs under that assumption.
pub async fn copy_partition_rows(ctx: &mut PartitionContext<'_>) -> Result<i64> {
    let spec = spec_for(ctx.desc.code);
    let child = ctx.desc.child.clone();
    ctx.control.checkpoint().await?;
    let total = count_rows(ctx.source, &child).await?;
    ensure_target_schema(ctx.target, ctx.desc).await?;

    let mut offset = match ctx.plan {
        PartitionPlan::ResumeAt(at) => at,
        _ => 0,
    };
    if offset == 0 {
        // a resumed partition was already emptied when it first started
        ensure_partition_ready(ctx.target, ctx.control, ctx.logger, &child, ReadyMode::Confirm)
            .await?;
    }
    checkpoints::mark_in_progress(ctx.db, ctx.run_id, &child)
        .await
        .map_err(store_fatal)?;

    // cached once per partition
    let select_sql = format!(
        "SELECT {columns} FROM {child} ORDER BY {order} LIMIT $1 OFFSET $2;",
        columns = spec.column_list(),
        order = spec.order_key_list(),
    );
    let mut sizer = BatchSizer::new();
    let mut rows_copied = offset;
    ctx.logger.info(
        "row-batch",
        format!("{child}: {total} source rows, starting at offset {offset}"),
    );

    while offset < total {
        ctx.control.checkpoint().await?;
        let started = Instant::now();
        let (fetched, bytes) =
            run_batch_with_retry(ctx, spec, &select_sql, offset, &mut sizer).await?;
        if fetched == 0 {
            break;
        }
        let elapsed = started.elapsed();
        sizer.observe(elapsed);
        offset += fetched as i64;
        rows_copied = offset;
        ctx.logger.debug(
            "row-batch",
            format!("{child}: {fetched} rows in {elapsed:?}, offset now {offset}"),
        );
        checkpoints::record_batch(ctx.db, ctx.run_id, &child, rows_copied, offset)
            .await
            .map_err(store_fatal)?;
        ctx.progress.record(fetched as i64, bytes);
    }

    checkpoints::mark_completed(ctx.db, ctx.run_id, &child, rows_copied)
        .await
        .map_err(store_fatal)?;
    ctx.logger
        .success("row-batch", format!("{child}: {rows_copied} rows copied"));
    Ok(rows_copied)
}
