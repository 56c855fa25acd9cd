use chrono::Utc;
use partmig_engine::bus::{channel, Command, EngineEvent, Progress, TruncateDecision};
use partmig_engine::worker::WorkerState;

fn snapshot(total_rows: i64) -> Progress {
    Progress {
        partition_index: 0,
        partition_count: 1,
        partition_name: "point_history_240921".to_string(),
        partition_rows: total_rows,
        total_rows,
        rows_per_sec: 0.0,
        mb_per_sec: 0.0,
        eta_seconds: 0,
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn test_progress_is_lossy_latest() {
    let (engine, observer) = channel();
    for rows in [10, 20, 30] {
        engine.progress.send(Some(snapshot(rows))).unwrap();
    }
    // only the most recent snapshot is observable
    let seen = observer.progress.borrow().clone().unwrap();
    assert_eq!(seen.total_rows, 30);
}

#[tokio::test]
async fn test_state_events_are_reliable_and_ordered() {
    let (engine, mut observer) = channel();
    for state in [
        WorkerState::Running,
        WorkerState::Paused,
        WorkerState::Running,
        WorkerState::Completed,
    ] {
        engine.events.send(EngineEvent::State(state)).unwrap();
    }
    let mut received = Vec::new();
    while let Ok(event) = observer.events.try_recv() {
        if let EngineEvent::State(state) = event {
            received.push(state);
        }
    }
    assert_eq!(
        received,
        vec![
            WorkerState::Running,
            WorkerState::Paused,
            WorkerState::Running,
            WorkerState::Completed
        ]
    );
}

#[tokio::test]
async fn test_commands_flow_to_engine() {
    let (mut engine, observer) = channel();
    observer.commands.send(Command::Pause).unwrap();
    observer
        .commands
        .send(Command::TruncateResponse(TruncateDecision::Deny))
        .unwrap();
    observer.commands.send(Command::Stop).unwrap();

    assert_eq!(engine.commands.try_recv().unwrap(), Command::Pause);
    assert_eq!(
        engine.commands.try_recv().unwrap(),
        Command::TruncateResponse(TruncateDecision::Deny)
    );
    assert_eq!(engine.commands.try_recv().unwrap(), Command::Stop);
}
