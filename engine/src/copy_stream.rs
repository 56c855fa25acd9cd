use crate::connect::count_rows;
use crate::error::{store_fatal, MigrationError};
use crate::schema::{ensure_partition_ready, ensure_target_schema, ReadyMode};
use crate::table_types::spec_for;
use crate::worker::PartitionContext;
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use futures::future::OptionFuture;
use futures::TryStreamExt;
use partmig_metastore::checkpoints;
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;

// Spool between COPY OUT and COPY IN: with protocol chunks of up to 64 KiB
// this bounds the in-flight window around 10 MB.
const SPOOL_CHUNKS: usize = 160;

/// How long a stopped copy may take to unwind before its tasks are aborted.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

async fn produce(
    mut conn: PoolConnection<Postgres>,
    sql: String,
    spool: mpsc::Sender<Bytes>,
    bytes_out: Arc<AtomicI64>,
    finished: Arc<AtomicBool>,
    mut cancel: watch::Receiver<bool>,
) -> Result<()> {
    let mut stream = conn
        .copy_out_raw(&sql)
        .await
        .with_context(|| "starting COPY TO STDOUT")?;
    loop {
        tokio::select! {
            chunk = stream.try_next() => {
                match chunk.with_context(|| "reading COPY stream")? {
                    Some(bytes) => {
                        bytes_out.fetch_add(bytes.len() as i64, Ordering::Relaxed);
                        if spool.send(bytes).await.is_err() {
                            // consumer went away; its error wins
                            return Ok(());
                        }
                    }
                    None => {
                        finished.store(true, Ordering::SeqCst);
                        return Ok(());
                    }
                }
            }
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return Err(MigrationError::Canceled.into());
                }
            }
        }
    }
}

async fn consume(
    mut conn: PoolConnection<Postgres>,
    sql: String,
    mut spool: mpsc::Receiver<Bytes>,
    producer_finished: Arc<AtomicBool>,
    mut cancel: watch::Receiver<bool>,
) -> Result<u64> {
    let mut copy_in = conn
        .copy_in_raw(&sql)
        .await
        .with_context(|| "starting COPY FROM STDIN")?;
    loop {
        tokio::select! {
            chunk = spool.recv() => {
                match chunk {
                    Some(bytes) => {
                        if let Err(e) = copy_in.send(bytes).await {
                            let _ = copy_in.abort("copy-in write failed").await;
                            return Err(anyhow::Error::from(e).context("writing COPY data"));
                        }
                    }
                    None => break,
                }
            }
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    let _ = copy_in.abort("canceled").await;
                    return Err(MigrationError::Canceled.into());
                }
            }
        }
    }
    if !producer_finished.load(Ordering::SeqCst) {
        // the source side died mid-stream; do not commit a partial copy
        let _ = copy_in.abort("source copy did not complete").await;
        bail!("source copy ended before completion");
    }
    copy_in
        .finish()
        .await
        .with_context(|| "finishing COPY FROM STDIN")
}

fn flatten<T>(joined: Result<Result<T>, JoinError>) -> Result<T> {
    match joined {
        Ok(inner) => inner,
        Err(e) => Err(anyhow!("copy task failed: {e}")),
    }
}

/// Moves one partition through a COPY-to-STDOUT → COPY-from-STDIN pipeline.
///
/// Producer and consumer run concurrently over a bounded spool; either side
/// failing cancels the other, and a stop request cancels both. The copy is
/// atomic per partition: there is no offset to resume, and the row counts
/// of both sides are reconciled before the checkpoint completes.
pub async fn copy_partition_stream(ctx: &mut PartitionContext<'_>) -> Result<i64> {
    let spec = spec_for(ctx.desc.code);
    let child = ctx.desc.child.clone();
    ctx.control.checkpoint().await?;
    let source_count = count_rows(ctx.source, &child).await?;
    ensure_target_schema(ctx.target, ctx.desc).await?;
    ensure_partition_ready(ctx.target, ctx.control, ctx.logger, &child, ReadyMode::Auto).await?;
    checkpoints::mark_in_progress(ctx.db, ctx.run_id, &child)
        .await
        .map_err(store_fatal)?;

    let columns = spec.column_list();
    let copy_out_sql = format!(
        "COPY (SELECT {columns} FROM {child} ORDER BY {order}) TO STDOUT \
         WITH (FORMAT CSV, HEADER FALSE, NULL 'NULL')",
        order = spec.order_key_list(),
    );
    let copy_in_sql =
        format!("COPY {child} ({columns}) FROM STDIN WITH (FORMAT CSV, NULL 'NULL')");

    let mut source_conn = ctx
        .source
        .acquire()
        .await
        .with_context(|| "acquiring source connection for COPY")?;
    let mut target_conn = ctx
        .target
        .acquire()
        .await
        .with_context(|| "acquiring target connection for COPY")?;
    // COPY runs unbounded; counts and DDL stay on the 60 s budget
    sqlx::query("SET statement_timeout = 0;")
        .execute(&mut *source_conn)
        .await
        .with_context(|| "clearing source statement timeout")?;
    sqlx::query("SET statement_timeout = 0;")
        .execute(&mut *target_conn)
        .await
        .with_context(|| "clearing target statement timeout")?;

    let bytes_out = Arc::new(AtomicI64::new(0));
    let producer_finished = Arc::new(AtomicBool::new(false));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (spool_tx, spool_rx) = mpsc::channel::<Bytes>(SPOOL_CHUNKS);

    ctx.logger.info(
        "copy-stream",
        format!("{child}: streaming {source_count} rows"),
    );
    let mut producer = Some(tokio::spawn(produce(
        source_conn,
        copy_out_sql,
        spool_tx,
        bytes_out.clone(),
        producer_finished.clone(),
        cancel_rx.clone(),
    )));
    let mut consumer = Some(tokio::spawn(consume(
        target_conn,
        copy_in_sql,
        spool_rx,
        producer_finished.clone(),
        cancel_rx,
    )));

    let mut producer_result: Option<Result<()>> = None;
    let mut consumer_result: Option<Result<u64>> = None;
    let mut stop_error: Option<anyhow::Error> = None;
    let mut stop_deadline: Option<tokio::time::Instant> = None;
    let mut sampled_bytes: i64 = 0;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while producer.is_some() || consumer.is_some() {
        tokio::select! {
            Some(joined) = OptionFuture::from(producer.as_mut()) => {
                producer = None;
                let result = flatten(joined);
                if result.is_err() {
                    let _ = cancel_tx.send(true);
                }
                producer_result = Some(result);
            }
            Some(joined) = OptionFuture::from(consumer.as_mut()) => {
                consumer = None;
                let result = flatten(joined);
                if result.is_err() {
                    let _ = cancel_tx.send(true);
                }
                consumer_result = Some(result);
            }
            _ = ticker.tick() => {
                let seen = bytes_out.load(Ordering::Relaxed);
                if !ctx.control.is_paused() && seen > sampled_bytes {
                    ctx.progress.record(0, seen - sampled_bytes);
                    sampled_bytes = seen;
                }
                if stop_error.is_none() {
                    if let Err(e) = ctx.control.poll() {
                        let _ = cancel_tx.send(true);
                        stop_error = Some(e);
                        stop_deadline = Some(tokio::time::Instant::now() + CANCEL_GRACE);
                    }
                }
                if let Some(deadline) = stop_deadline {
                    if tokio::time::Instant::now() >= deadline {
                        if let Some(handle) = producer.take() {
                            handle.abort();
                        }
                        if let Some(handle) = consumer.take() {
                            handle.abort();
                        }
                    }
                }
            }
        }
    }

    if let Some(e) = stop_error {
        return Err(e);
    }
    if let Some(Err(e)) = producer_result {
        return Err(e.context(format!("COPY out of {child}")));
    }
    match consumer_result {
        Some(Ok(_)) => {}
        Some(Err(e)) => return Err(e.context(format!("COPY into {child}"))),
        None => bail!("copy-in task was aborted"),
    }

    let target_count = count_rows(ctx.target, &child).await?;
    if target_count != source_count {
        bail!(
            "row count mismatch on {child}: source {source_count}, target {target_count}"
        );
    }
    checkpoints::mark_completed(ctx.db, ctx.run_id, &child, target_count)
        .await
        .map_err(store_fatal)?;
    ctx.progress.record(target_count, 0);
    ctx.logger.success(
        "copy-stream",
        format!("{child}: {target_count} rows copied and reconciled"),
    );
    Ok(target_count)
}
