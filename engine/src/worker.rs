use crate::bus::{Command, EngineEvent, TruncateDecision};
use crate::discovery::PartitionDescriptor;
use crate::error::MigrationError;
use crate::logging::SessionLogger;
use crate::progress::ProgressTracker;
use anyhow::Result;
use partmig_metastore::checkpoints::{Checkpoint, CheckpointStatus};
use partmig_metastore::metadata_db::MetadataDb;
use sqlx::PgPool;
use tokio::sync::mpsc;

/// Lifecycle of one engine activation. Transitions are monotone and the
/// three terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Canceled)
                | (Paused, Canceled)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Failed)
        )
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// The single cancellation gate shared by everything a worker does.
///
/// Every blocking call sits behind a suspension point: [`WorkerControl::checkpoint`]
/// for sequential code, [`WorkerControl::poll`] for the COPY monitor loop.
/// Those are the only places pause and stop are observed.
pub struct WorkerControl {
    state: WorkerState,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl WorkerControl {
    pub fn new(
        commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            state: WorkerState::Idle,
            commands,
            events,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Reliable event channel, shared with the log sinks.
    pub fn events(&self) -> &mpsc::UnboundedSender<EngineEvent> {
        &self.events
    }

    pub fn is_paused(&self) -> bool {
        self.state == WorkerState::Paused
    }

    /// Valid only in `idle`.
    pub fn start(&mut self) -> Result<()> {
        self.transition(WorkerState::Running)
    }

    /// Moves to `next`, emitting a reliable state event. Illegal transitions
    /// are a programming error and surface as Fatal.
    pub fn transition(&mut self, next: WorkerState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(MigrationError::Fatal(format!(
                "illegal worker transition {} -> {next}",
                self.state
            ))
            .into());
        }
        self.state = next;
        let _ = self.events.send(EngineEvent::State(next));
        Ok(())
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Pause => {
                if self.state == WorkerState::Running {
                    let _ = self.transition(WorkerState::Paused);
                }
            }
            Command::Resume => {
                if self.state == WorkerState::Paused {
                    let _ = self.transition(WorkerState::Running);
                }
            }
            Command::Stop => {
                if matches!(self.state, WorkerState::Running | WorkerState::Paused) {
                    let _ = self.transition(WorkerState::Canceled);
                }
            }
            // A response with no outstanding request is stale.
            Command::TruncateResponse(_) => {}
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state == WorkerState::Canceled {
            return Err(MigrationError::Canceled.into());
        }
        Ok(())
    }

    /// Suspension point: applies queued commands, blocks while paused and
    /// unwinds with `Canceled` after a stop.
    pub async fn checkpoint(&mut self) -> Result<()> {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.apply(command),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(
                        MigrationError::Fatal("control channel closed".to_string()).into(),
                    );
                }
            }
        }
        while self.state == WorkerState::Paused {
            match self.commands.recv().await {
                Some(command) => self.apply(command),
                None => {
                    return Err(
                        MigrationError::Fatal("control channel closed".to_string()).into(),
                    );
                }
            }
        }
        self.ensure_live()
    }

    /// Non-blocking variant used while a COPY is in flight: commands are
    /// applied but pause does not block (the copy cannot be suspended
    /// midway, only canceled).
    pub fn poll(&mut self) -> Result<()> {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.apply(command),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(
                        MigrationError::Fatal("control channel closed".to_string()).into(),
                    );
                }
            }
        }
        self.ensure_live()
    }

    /// Emits a confirmation request and blocks until the observer answers.
    /// Pause and stop are still honored while waiting.
    pub async fn request_truncate(
        &mut self,
        partition: &str,
        target_rows: i64,
    ) -> Result<TruncateDecision> {
        let _ = self.events.send(EngineEvent::TruncateRequest {
            partition: partition.to_string(),
            target_rows,
        });
        loop {
            match self.commands.recv().await {
                Some(Command::TruncateResponse(decision)) => return Ok(decision),
                Some(command) => {
                    self.apply(command);
                    self.ensure_live()?;
                }
                None => {
                    return Err(
                        MigrationError::Fatal("control channel closed".to_string()).into(),
                    );
                }
            }
        }
    }
}

/// Everything a per-partition engine routine needs, borrowed from the run.
pub struct PartitionContext<'a> {
    pub source: &'a PgPool,
    pub target: &'a PgPool,
    pub db: &'a MetadataDb,
    pub logger: &'a SessionLogger,
    pub control: &'a mut WorkerControl,
    pub progress: &'a mut ProgressTracker,
    pub run_id: i64,
    pub desc: &'a PartitionDescriptor,
    pub plan: PartitionPlan,
}

/// What to do with a partition, derived from its checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionPlan {
    /// Completed in a previous attempt of this run; never reopened.
    Skip,
    /// Resume a partially copied partition at this row offset.
    ResumeAt(i64),
    /// Start from zero.
    Fresh,
}

/// `completed` partitions are skipped; `in_progress` resumes at the recorded
/// offset when the engine tracks offsets, otherwise restarts from zero;
/// `pending` and `failed` start fresh.
pub fn plan_partition(checkpoint: Option<&Checkpoint>, supports_offsets: bool) -> PartitionPlan {
    match checkpoint {
        None => PartitionPlan::Fresh,
        Some(cp) => match cp.status {
            CheckpointStatus::Completed => PartitionPlan::Skip,
            CheckpointStatus::InProgress => {
                if supports_offsets && cp.last_offset > 0 {
                    PartitionPlan::ResumeAt(cp.last_offset)
                } else {
                    PartitionPlan::Fresh
                }
            }
            CheckpointStatus::Pending | CheckpointStatus::Failed => PartitionPlan::Fresh,
        },
    }
}
