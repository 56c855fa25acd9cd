use chrono::Utc;
use partmig_metastore::log_writer::LogWriter;
use partmig_metastore::logs::{entries_for_session, StoredLogEntry};
use partmig_metastore::metadata_db::MetadataDb;
use partmig_metastore::profiles::{insert_profile, CompatMode, ConnectionConfig, NewProfile};
use partmig_metastore::runs;
use partmig_metastore::vault::Vault;
use std::time::Duration;
use uuid::Uuid;

fn entry(session: Uuid, message: &str) -> StoredLogEntry {
    StoredLogEntry {
        run_session_id: session.to_string(),
        ts: Utc::now(),
        level: "INFO".to_string(),
        component: "test".to_string(),
        message: message.to_string(),
        context: None,
    }
}

async fn db_with_run() -> (MetadataDb, Uuid, tempfile::TempDir) {
    let db = MetadataDb::in_memory().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let vault = Vault::load_or_create(&dir.path().join("vault.key")).unwrap();
    let profile = NewProfile {
        name: "legacy".to_string(),
        description: String::new(),
        source: ConnectionConfig {
            host: "src".to_string(),
            port: 5432,
            dbname: "d".to_string(),
            user: "u".to_string(),
            password: "p".to_string(),
            sslmode: "prefer".to_string(),
        },
        target: ConnectionConfig {
            host: "dst".to_string(),
            port: 5432,
            dbname: "d".to_string(),
            user: "u".to_string(),
            password: "p".to_string(),
            sslmode: "prefer".to_string(),
        },
        compat_mode: CompatMode::Auto,
    };
    let profile_id = insert_profile(&db, &vault, &profile).await.unwrap();
    let session = Uuid::new_v4();
    // log rows reference the run's session id
    runs::insert_run(&db, profile_id, session, "row_batch", 0)
        .await
        .unwrap();
    (db, session, dir)
}

#[tokio::test]
async fn test_writer_flushes_to_store() {
    let (db, session, _dir) = db_with_run().await;
    let writer = LogWriter::spawn(db.clone(), 100);
    for i in 0..10 {
        writer.enqueue(entry(session, &format!("line {i}")));
    }
    assert!(writer.flush(Duration::from_secs(5)).await);
    let read = entries_for_session(&db, &session.to_string(), 100).await.unwrap();
    assert_eq!(read.len(), 10);
    writer.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_full_queue_drops_oldest() {
    let (db, session, _dir) = db_with_run().await;
    let writer = LogWriter::spawn(db.clone(), 3);
    // the drain task cannot run between these synchronous enqueues
    for i in 0..8 {
        writer.enqueue(entry(session, &format!("line {i}")));
    }
    assert_eq!(writer.dropped(), 5);
    assert!(writer.flush(Duration::from_secs(5)).await);
    let read = entries_for_session(&db, &session.to_string(), 100).await.unwrap();
    assert_eq!(read.len(), 3);
    assert_eq!(read[0].message, "line 5");
    assert_eq!(read[2].message, "line 7");
    writer.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_shutdown_drains_queue() {
    let (db, session, _dir) = db_with_run().await;
    let writer = LogWriter::spawn(db.clone(), 100);
    writer.enqueue(entry(session, "last words"));
    writer.shutdown(Duration::from_secs(5)).await;
    let read = entries_for_session(&db, &session.to_string(), 100).await.unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].message, "last words");
}
