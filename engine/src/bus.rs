use crate::logging::LogLine;
use crate::worker::WorkerState;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

/// Answer to a truncate confirmation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncateDecision {
    Approve,
    Deny,
}

/// Observer → engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Pause,
    Resume,
    Stop,
    TruncateResponse(TruncateDecision),
}

/// Engine → observer, delivered reliably and in order.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Log(LogLine),
    State(WorkerState),
    ConnectionStatus { endpoint: String, connected: bool },
    /// The worker blocks until a `TruncateResponse` command arrives.
    TruncateRequest { partition: String, target_rows: i64 },
}

/// Progress snapshot. Delivered lossy-but-latest: observers only ever see
/// the most recent one.
#[derive(Debug, Clone)]
pub struct Progress {
    pub partition_index: usize,
    pub partition_count: usize,
    pub partition_name: String,
    pub partition_rows: i64,
    pub total_rows: i64,
    pub rows_per_sec: f64,
    pub mb_per_sec: f64,
    pub eta_seconds: i64,
    pub timestamp: DateTime<Utc>,
}

/// Engine-side endpoints.
pub struct EngineBus {
    pub events: mpsc::UnboundedSender<EngineEvent>,
    pub progress: watch::Sender<Option<Progress>>,
    pub commands: mpsc::UnboundedReceiver<Command>,
}

/// Observer-side endpoints.
pub struct ObserverHandle {
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    pub progress: watch::Receiver<Option<Progress>>,
    pub commands: mpsc::UnboundedSender<Command>,
}

/// Builds the two typed channels between one engine and one observer.
pub fn channel() -> (EngineBus, ObserverHandle) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (progress_tx, progress_rx) = watch::channel(None);
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    (
        EngineBus {
            events: events_tx,
            progress: progress_tx,
            commands: commands_rx,
        },
        ObserverHandle {
            events: events_rx,
            progress: progress_rx,
            commands: commands_tx,
        },
    )
}
