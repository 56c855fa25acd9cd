use crate::bus::{EngineBus, EngineEvent};
use crate::connect::{connect, connect_target, detect_compat_mode, endpoint_desc};
use crate::copy_stream::copy_partition_stream;
use crate::discovery::{
    attach_row_estimates, discover_partitions, DiscoveryRequest, PartitionDescriptor,
};
use crate::error::{
    is_canceled, is_confirmation_denied, is_fatal, is_transient, store_fatal, transient_backoff,
};
use crate::logging::{BusSink, FileSink, LogLevel, SessionLogger, StoreSink};
use crate::progress::ProgressTracker;
use crate::row_batch::copy_partition_rows;
use crate::table_types::{spec_for, TableTypeCode};
use crate::worker::{plan_partition, PartitionContext, PartitionPlan, WorkerControl, WorkerState};
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use partmig_metastore::app_paths::AppPaths;
use partmig_metastore::checkpoints::{self, CheckpointSeed};
use partmig_metastore::log_writer::LogWriter;
use partmig_metastore::metadata_db::MetadataDb;
use partmig_metastore::profiles::{CompatMode, ConnectionProfile};
use partmig_metastore::runs::{self, RunStatus};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const LOG_QUEUE_CAPACITY: usize = 4096;
const LOG_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Which per-partition routine the worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    RowBatch,
    StreamingCopy,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RowBatch => "row_batch",
            Self::StreamingCopy => "streaming_copy",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "row_batch" | "row-batch" => Ok(Self::RowBatch),
            "streaming_copy" | "streaming-copy" | "copy" => Ok(Self::StreamingCopy),
            other => bail!("unknown engine '{other}'"),
        }
    }

    /// Only the row-batch engine can resume a partition mid-way.
    fn supports_offsets(self) -> bool {
        self == Self::RowBatch
    }
}

/// Everything needed to start a fresh run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub profile: ConnectionProfile,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub types: Vec<TableTypeCode>,
    pub engine: EngineKind,
    pub continue_on_error: bool,
}

/// Final report of one activation.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: i64,
    pub session_id: Uuid,
    pub status: RunStatus,
    pub completed_partitions: i64,
    pub total_rows: i64,
    pub error: Option<String>,
}

fn build_logger(
    db: &MetadataDb,
    paths: &AppPaths,
    bus: &EngineBus,
    session_id: Uuid,
) -> (Arc<SessionLogger>, Arc<LogWriter>) {
    let writer = Arc::new(LogWriter::spawn(db.clone(), LOG_QUEUE_CAPACITY));
    let logger = Arc::new(SessionLogger::new(
        session_id,
        vec![
            Arc::new(FileSink::new(paths.log_dir())),
            Arc::new(StoreSink::new(writer.clone())),
            Arc::new(BusSink::new(bus.events.clone())),
        ],
    ));
    (logger, writer)
}

fn descriptor_from_checkpoint(cp: &checkpoints::Checkpoint) -> Result<PartitionDescriptor> {
    let code = TableTypeCode::parse(&cp.table_type)?;
    Ok(PartitionDescriptor {
        parent: spec_for(code).parent.to_string(),
        child: cp.partition_name.clone(),
        code,
        from_date: cp.from_date,
        to_date: cp.to_date,
        cluster_index: cp.cluster_index,
        estimated_rows: None,
    })
}

/// Runs one partition through the selected engine. Streaming COPY is atomic
/// per partition, so its transient failures retry the whole partition.
#[allow(clippy::too_many_arguments)]
async fn run_engine(
    db: &MetadataDb,
    logger: &SessionLogger,
    control: &mut WorkerControl,
    progress: &mut ProgressTracker,
    source: &PgPool,
    target: &PgPool,
    run_id: i64,
    engine: EngineKind,
    desc: &PartitionDescriptor,
    plan: PartitionPlan,
) -> Result<i64> {
    match engine {
        EngineKind::RowBatch => {
            let mut ctx = PartitionContext {
                source,
                target,
                db,
                logger,
                control,
                progress,
                run_id,
                desc,
                plan,
            };
            copy_partition_rows(&mut ctx).await
        }
        EngineKind::StreamingCopy => {
            let mut backoff = transient_backoff();
            loop {
                let mut ctx = PartitionContext {
                    source,
                    target,
                    db,
                    logger,
                    control: &mut *control,
                    progress: &mut *progress,
                    run_id,
                    desc,
                    plan,
                };
                match copy_partition_stream(&mut ctx).await {
                    Ok(rows) => return Ok(rows),
                    Err(e) if is_transient(&e) => match backoff.next() {
                        Some(delay) => {
                            logger.warning(
                                "copy-stream",
                                format!(
                                    "transient failure on {}, retrying in {delay:?}: {e:#}",
                                    desc.child
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
    }
}

/// The partition loop: plan, dispatch, classify failures, keep counters.
#[allow(clippy::too_many_arguments)]
async fn drive_partitions(
    db: &MetadataDb,
    logger: &SessionLogger,
    control: &mut WorkerControl,
    progress: &mut ProgressTracker,
    source: &PgPool,
    target: &PgPool,
    run_id: i64,
    engine: EngineKind,
    continue_on_error: bool,
    work: &[(usize, PartitionDescriptor)],
    mut completed_count: i64,
    mut total_rows: i64,
) -> Result<(i64, i64)> {
    for (index, desc) in work {
        control.checkpoint().await?;
        let checkpoint = checkpoints::get_checkpoint(db, run_id, &desc.child)
            .await
            .map_err(store_fatal)?;
        let plan = plan_partition(checkpoint.as_ref(), engine.supports_offsets());
        if plan == PartitionPlan::Skip {
            logger.info(
                "run",
                format!("{} already completed, skipping", desc.child),
            );
            continue;
        }
        progress.begin_partition(*index, &desc.child);
        let result = run_engine(
            db, logger, control, progress, source, target, run_id, engine, desc, plan,
        )
        .await;
        match result {
            Ok(rows) => {
                completed_count += 1;
                total_rows += rows;
                progress.finish_partition();
                runs::update_run_counters(db, run_id, completed_count, total_rows)
                    .await
                    .map_err(store_fatal)?;
            }
            Err(e) => {
                let reason = if is_canceled(&e) {
                    "canceled".to_string()
                } else if is_confirmation_denied(&e) {
                    "user declined truncate".to_string()
                } else {
                    format!("{e:#}")
                };
                if let Err(store_err) =
                    checkpoints::mark_failed(db, run_id, &desc.child, &reason).await
                {
                    logger.error(
                        "run",
                        format!("recording failure for {}: {store_err:#}", desc.child),
                    );
                }
                if is_canceled(&e) || is_fatal(&e) {
                    return Err(e);
                }
                if is_confirmation_denied(&e) {
                    logger.warning(
                        "run",
                        format!("{}: user declined truncate, moving on", desc.child),
                    );
                    continue;
                }
                logger.log_with_context(
                    LogLevel::Error,
                    "run",
                    format!("{} failed: {reason}", desc.child),
                    Some(format!("partition={}", desc.child)),
                );
                if continue_on_error {
                    continue;
                }
                return Err(e);
            }
        }
    }
    Ok((completed_count, total_rows))
}

struct Activation {
    run_id: i64,
    session_id: Uuid,
    engine: EngineKind,
    work: Vec<(usize, PartitionDescriptor)>,
    partition_count: usize,
    completed_count: i64,
    total_rows: i64,
}

/// Connects both sides, runs the partition loop and finalizes run state,
/// worker state and the log pipeline. Every exit path lands here.
async fn drive_activation(
    db: &MetadataDb,
    bus: EngineBus,
    logger: Arc<SessionLogger>,
    writer: Arc<LogWriter>,
    profile: &ConnectionProfile,
    continue_on_error: bool,
    activation: Activation,
) -> Result<RunOutcome> {
    let mut control = WorkerControl::new(bus.commands, bus.events);
    let expected_total: i64 = activation
        .work
        .iter()
        .filter_map(|(_, d)| d.estimated_rows)
        .sum::<i64>()
        + activation.total_rows;
    let mut progress = ProgressTracker::new(
        bus.progress,
        activation.partition_count,
        expected_total,
    );

    control.start()?;
    runs::set_run_status(db, activation.run_id, RunStatus::Running)
        .await
        .map_err(store_fatal)?;

    let drive_result = async {
        let source = connect(&profile.source).await?;
        let _ = control.events().send(EngineEvent::ConnectionStatus {
            endpoint: endpoint_desc(&profile.source),
            connected: true,
        });
        let compat = match profile.compat_mode {
            CompatMode::Auto => {
                let probe = connect(&profile.target).await?;
                let detected = detect_compat_mode(&probe).await?;
                probe.close().await;
                logger.info(
                    "session",
                    format!("target compatibility resolved to {}", detected.as_str()),
                );
                detected
            }
            fixed => fixed,
        };
        let target = connect_target(&profile.target, compat, logger.clone()).await?;
        let _ = control.events().send(EngineEvent::ConnectionStatus {
            endpoint: endpoint_desc(&profile.target),
            connected: true,
        });
        drive_partitions(
            db,
            &logger,
            &mut control,
            &mut progress,
            &source,
            &target,
            activation.run_id,
            activation.engine,
            continue_on_error,
            &activation.work,
            activation.completed_count,
            activation.total_rows,
        )
        .await
    }
    .await;

    let (status, final_state, error_text, counters) = match &drive_result {
        Ok((completed, rows)) => (
            RunStatus::Completed,
            WorkerState::Completed,
            None,
            (*completed, *rows),
        ),
        Err(e) if is_canceled(e) => (
            RunStatus::Canceled,
            WorkerState::Canceled,
            Some("canceled".to_string()),
            (activation.completed_count, activation.total_rows),
        ),
        Err(e) => (
            RunStatus::Failed,
            WorkerState::Failed,
            Some(format!("{e:#}")),
            (activation.completed_count, activation.total_rows),
        ),
    };
    if control.state() != final_state {
        let _ = control.transition(final_state);
    }
    if let Err(e) = runs::finish_run(db, activation.run_id, status, error_text.as_deref()).await {
        logger.error("run", format!("finalizing run history: {e:#}"));
    }
    match status {
        RunStatus::Completed => logger.success(
            "run",
            format!(
                "run finished: {} partitions, {} rows",
                counters.0, counters.1
            ),
        ),
        RunStatus::Canceled => logger.warning("run", "run canceled"),
        _ => logger.error(
            "run",
            format!(
                "run failed: {}",
                error_text.as_deref().unwrap_or("unknown error")
            ),
        ),
    }
    writer.shutdown(LOG_FLUSH_TIMEOUT).await;

    Ok(RunOutcome {
        run_id: activation.run_id,
        session_id: activation.session_id,
        status,
        completed_partitions: counters.0,
        total_rows: counters.1,
        error: error_text,
    })
}

/// Starts a fresh run: discovery, history row, checkpoint seeding, then the
/// partition loop. A range with no matching partitions completes with zero
/// partitions and never touches the target.
pub async fn execute_run(
    db: &MetadataDb,
    paths: &AppPaths,
    bus: EngineBus,
    request: RunRequest,
) -> Result<RunOutcome> {
    let session_id = Uuid::new_v4();
    let run_id = runs::insert_run(
        db,
        request.profile.id,
        session_id,
        request.engine.as_str(),
        0,
    )
    .await
    .map_err(store_fatal)?;
    let (logger, writer) = build_logger(db, paths, &bus, session_id);
    logger.info(
        "run",
        format!(
            "starting {} run for profile '{}' over [{}, {}], types {}",
            request.engine.as_str(),
            request.profile.name,
            request.start,
            request.end,
            request
                .types
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(",")
        ),
    );

    let fail_early = |e: &anyhow::Error| format!("{e:#}");
    let source = match connect(&request.profile.source).await {
        Ok(pool) => pool,
        Err(e) => {
            logger.error("run", format!("connecting to source: {e:#}"));
            if let Err(fe) = runs::finish_run(db, run_id, RunStatus::Failed, Some(&fail_early(&e))).await {
                logger.error("run", format!("finalizing run history: {fe:#}"));
            }
            writer.shutdown(LOG_FLUSH_TIMEOUT).await;
            return Err(e);
        }
    };
    let discovery = DiscoveryRequest {
        start: request.start,
        end: request.end,
        types: request.types.clone(),
    };
    let partitions = match discover_partitions(&source, &discovery).await {
        Ok(mut partitions) => {
            attach_row_estimates(&source, &mut partitions).await;
            partitions
        }
        Err(e) => {
            logger.error("run", format!("discovery failed: {e:#}"));
            if let Err(fe) = runs::finish_run(db, run_id, RunStatus::Failed, Some(&fail_early(&e))).await {
                logger.error("run", format!("finalizing run history: {fe:#}"));
            }
            writer.shutdown(LOG_FLUSH_TIMEOUT).await;
            return Err(e);
        }
    };
    source.close().await;
    logger.info(
        "run",
        format!("discovered {} partitions", partitions.len()),
    );

    let seeds: Vec<CheckpointSeed> = partitions
        .iter()
        .map(|d| CheckpointSeed {
            partition_name: d.child.clone(),
            table_type: d.code.as_str().to_string(),
            from_date: d.from_date,
            to_date: d.to_date,
            cluster_index: d.cluster_index,
        })
        .collect();
    checkpoints::seed_checkpoints(db, run_id, &seeds)
        .await
        .map_err(store_fatal)?;
    runs::set_run_totals(db, run_id, partitions.len() as i64)
        .await
        .map_err(store_fatal)?;

    if partitions.is_empty() {
        let finished = runs::finish_run(db, run_id, RunStatus::Completed, None).await;
        logger.success("run", "no partitions matched the range; nothing to do");
        writer.shutdown(LOG_FLUSH_TIMEOUT).await;
        finished.map_err(store_fatal)?;
        return Ok(RunOutcome {
            run_id,
            session_id,
            status: RunStatus::Completed,
            completed_partitions: 0,
            total_rows: 0,
            error: None,
        });
    }

    let work: Vec<(usize, PartitionDescriptor)> =
        partitions.into_iter().enumerate().collect();
    let partition_count = work.len();
    let activation = Activation {
        run_id,
        session_id,
        engine: request.engine,
        work,
        partition_count,
        completed_count: 0,
        total_rows: 0,
    };
    drive_activation(
        db,
        bus,
        logger,
        writer,
        &request.profile,
        request.continue_on_error,
        activation,
    )
    .await
}

/// Picks up the latest incomplete run for the profile and finishes what its
/// checkpoints say is still to do. The set of completed partitions only ever
/// grows across activations.
pub async fn resume_run(
    db: &MetadataDb,
    paths: &AppPaths,
    bus: EngineBus,
    profile: ConnectionProfile,
    continue_on_error: bool,
) -> Result<RunOutcome> {
    let run = runs::incomplete_for(db, profile.id)
        .await
        .map_err(store_fatal)?
        .with_context(|| format!("no incomplete run for profile '{}'", profile.name))?;
    let engine = EngineKind::parse(&run.engine)?;
    let (logger, writer) = build_logger(db, paths, &bus, run.session_id);

    let pending = checkpoints::pending_for(db, run.id)
        .await
        .map_err(store_fatal)?;
    let (completed_count, completed_rows) = checkpoints::completed_totals(db, run.id)
        .await
        .map_err(store_fatal)?;
    logger.info(
        "run",
        format!(
            "resuming run {} ({}): {} partitions done, {} to go",
            run.id,
            run.engine,
            completed_count,
            pending.len()
        ),
    );
    let already_done = checkpoints::completed_names(db, run.id)
        .await
        .map_err(store_fatal)?;
    if !already_done.is_empty() {
        logger.debug(
            "run",
            format!("completed in earlier activations: {}", already_done.join(", ")),
        );
    }

    let mut work = Vec::with_capacity(pending.len());
    for cp in &pending {
        work.push((cp.seq as usize, descriptor_from_checkpoint(cp)?));
    }
    let activation = Activation {
        run_id: run.id,
        session_id: run.session_id,
        engine,
        partition_count: run.total_partitions as usize,
        work,
        completed_count,
        total_rows: completed_rows,
    };
    drive_activation(
        db,
        bus,
        logger,
        writer,
        &profile,
        continue_on_error,
        activation,
    )
    .await
}
