use partmig_engine::bus::EngineEvent;
use partmig_engine::logging::{
    BusSink, FileSink, LogLevel, LogLine, LogSink, SessionLogger,
};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Default)]
struct CollectingSink {
    lines: Mutex<Vec<LogLine>>,
}

impl LogSink for CollectingSink {
    fn append(&self, line: &LogLine) {
        self.lines.lock().unwrap().push(line.clone());
    }
}

#[test]
fn test_logger_masks_before_fanout() {
    let sink = Arc::new(CollectingSink::default());
    let session = Uuid::new_v4();
    let logger = SessionLogger::new(session, vec![sink.clone()]);

    logger.info("connect", "connecting with password=hunter2");
    let lines = sink.lines.lock().unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].session_id, session);
    assert_eq!(lines[0].level, LogLevel::Info);
    assert_eq!(lines[0].component, "connect");
    assert_eq!(lines[0].message, "connecting with password=***");
}

#[test]
fn test_logger_fans_out_to_every_sink() {
    let first = Arc::new(CollectingSink::default());
    let second = Arc::new(CollectingSink::default());
    let logger = SessionLogger::new(Uuid::new_v4(), vec![first.clone(), second.clone()]);
    logger.success("run", "all partitions copied");
    assert_eq!(first.lines.lock().unwrap().len(), 1);
    assert_eq!(second.lines.lock().unwrap().len(), 1);
    assert_eq!(
        first.lines.lock().unwrap()[0].level,
        LogLevel::Success
    );
}

#[test]
fn test_render_shape() {
    let line = LogLine {
        session_id: Uuid::new_v4(),
        ts: chrono::Utc::now(),
        level: LogLevel::Warning,
        component: "schema".to_string(),
        message: "session setting skipped".to_string(),
        context: None,
    };
    let rendered = line.render();
    assert!(rendered.contains("[WARNING]"));
    assert!(rendered.contains("[schema]"));
    assert!(rendered.ends_with("session setting skipped"));
}

#[tokio::test]
async fn test_bus_sink_forwards_log_events() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let logger = SessionLogger::new(Uuid::new_v4(), vec![Arc::new(BusSink::new(tx))]);
    logger.error("run", "partition failed");
    match rx.try_recv().unwrap() {
        EngineEvent::Log(line) => {
            assert_eq!(line.level, LogLevel::Error);
            assert_eq!(line.message, "partition failed");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn test_file_sink_writes_daily_file() {
    let dir = tempfile::tempdir().unwrap();
    let logger = SessionLogger::new(
        Uuid::new_v4(),
        vec![Arc::new(FileSink::new(dir.path().to_path_buf()))],
    );
    logger.info("run", "first line");
    logger.info("run", "second line");

    let today = chrono::Utc::now().format("%Y%m%d");
    let path = dir.path().join(format!("migration_{today}.log"));
    let content = std::fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().count(), 2);
    assert!(content.contains("first line"));
    assert!(content.contains("second line"));
}
