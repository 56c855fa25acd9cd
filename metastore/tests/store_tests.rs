use chrono::Utc;
use partmig_metastore::checkpoints::{self, CheckpointSeed, CheckpointStatus};
use partmig_metastore::logs::{append_batch, entries_for_session, StoredLogEntry};
use partmig_metastore::metadata_db::MetadataDb;
use partmig_metastore::profiles::{
    delete_profile, get_profile_by_name, insert_profile, list_profiles, CompatMode,
    ConnectionConfig, NewProfile,
};
use partmig_metastore::runs::{self, RunStatus};
use partmig_metastore::vault::Vault;
use uuid::Uuid;

fn test_config(host: &str, password: &str) -> ConnectionConfig {
    ConnectionConfig {
        host: host.to_string(),
        port: 5432,
        dbname: "legacy".to_string(),
        user: "migrator".to_string(),
        password: password.to_string(),
        sslmode: "prefer".to_string(),
    }
}

fn test_profile(name: &str) -> NewProfile {
    NewProfile {
        name: name.to_string(),
        description: "test profile".to_string(),
        source: test_config("src.example", "source-secret"),
        target: test_config("dst.example", "target-secret"),
        compat_mode: CompatMode::V9_3,
    }
}

fn test_vault() -> (tempfile::TempDir, Vault) {
    let dir = tempfile::tempdir().unwrap();
    let vault = Vault::load_or_create(&dir.path().join("vault.key")).unwrap();
    (dir, vault)
}

async fn seeded_run(db: &MetadataDb, vault: &Vault, profile_name: &str) -> (i64, i64, Uuid) {
    let profile_id = insert_profile(db, vault, &test_profile(profile_name))
        .await
        .unwrap();
    let session = Uuid::new_v4();
    let run_id = runs::insert_run(db, profile_id, session, "row_batch", 3)
        .await
        .unwrap();
    let seeds = vec![
        CheckpointSeed {
            partition_name: "point_history_240921".to_string(),
            table_type: "PH".to_string(),
            from_date: 1_726_844_400_000,
            to_date: 1_726_930_799_999,
            cluster_index: false,
        },
        CheckpointSeed {
            partition_name: "point_history_240922".to_string(),
            table_type: "PH".to_string(),
            from_date: 1_726_930_800_000,
            to_date: 1_727_017_199_999,
            cluster_index: false,
        },
        CheckpointSeed {
            partition_name: "point_history_240923".to_string(),
            table_type: "PH".to_string(),
            from_date: 1_727_017_200_000,
            to_date: 1_727_103_599_999,
            cluster_index: true,
        },
    ];
    checkpoints::seed_checkpoints(db, run_id, &seeds).await.unwrap();
    (profile_id, run_id, session)
}

#[tokio::test]
async fn test_profile_roundtrip_with_sealed_passwords() {
    let db = MetadataDb::in_memory().await.unwrap();
    let (_dir, vault) = test_vault();
    insert_profile(&db, &vault, &test_profile("legacy")).await.unwrap();

    let loaded = get_profile_by_name(&db, &vault, "legacy")
        .await
        .unwrap()
        .expect("profile must exist");
    assert_eq!(loaded.source.password, "source-secret");
    assert_eq!(loaded.target.password, "target-secret");
    assert_eq!(loaded.compat_mode, CompatMode::V9_3);

    let summaries = list_profiles(&db).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].name, "legacy");
}

#[tokio::test]
async fn test_passwords_not_stored_in_clear() {
    let db = MetadataDb::in_memory().await.unwrap();
    let (_dir, vault) = test_vault();
    insert_profile(&db, &vault, &test_profile("legacy")).await.unwrap();

    use sqlx::Row;
    let row = sqlx::query("SELECT source_config, target_config, source_secret FROM profiles;")
        .fetch_one(&db.read_pool)
        .await
        .unwrap();
    let source_config: String = row.get("source_config");
    let target_config: String = row.get("target_config");
    let source_secret: Vec<u8> = row.get("source_secret");
    assert!(!source_config.contains("source-secret"));
    assert!(!target_config.contains("target-secret"));
    assert_ne!(source_secret, b"source-secret".to_vec());
}

#[tokio::test]
async fn test_incomplete_for_picks_latest_resumable() {
    let db = MetadataDb::in_memory().await.unwrap();
    let (_dir, vault) = test_vault();
    let profile_id = insert_profile(&db, &vault, &test_profile("legacy"))
        .await
        .unwrap();

    let first = runs::insert_run(&db, profile_id, Uuid::new_v4(), "row_batch", 1)
        .await
        .unwrap();
    runs::finish_run(&db, first, RunStatus::Completed, None).await.unwrap();
    assert!(runs::incomplete_for(&db, profile_id).await.unwrap().is_none());

    let second = runs::insert_run(&db, profile_id, Uuid::new_v4(), "streaming_copy", 2)
        .await
        .unwrap();
    let found = runs::incomplete_for(&db, profile_id).await.unwrap().unwrap();
    assert_eq!(found.id, second);
    assert_eq!(found.status, RunStatus::Running);

    runs::finish_run(&db, second, RunStatus::Failed, Some("boom")).await.unwrap();
    let found = runs::incomplete_for(&db, profile_id).await.unwrap().unwrap();
    assert_eq!(found.id, second, "failed runs stay resumable");

    runs::finish_run(&db, second, RunStatus::Canceled, None).await.unwrap();
    assert!(
        runs::incomplete_for(&db, profile_id).await.unwrap().is_none(),
        "canceled runs are terminal"
    );
}

#[tokio::test]
async fn test_checkpoints_keep_discovery_order() {
    let db = MetadataDb::in_memory().await.unwrap();
    let (_dir, vault) = test_vault();
    let (_profile_id, run_id, _session) = seeded_run(&db, &vault, "legacy").await;

    let pending = checkpoints::pending_for(&db, run_id).await.unwrap();
    assert_eq!(
        pending.iter().map(|c| c.partition_name.as_str()).collect::<Vec<_>>(),
        vec![
            "point_history_240921",
            "point_history_240922",
            "point_history_240923"
        ]
    );
    assert!(pending.iter().all(|c| c.status == CheckpointStatus::Pending));
    assert!(pending[2].cluster_index);
}

#[tokio::test]
async fn test_checkpoint_progress_and_resume_superset() {
    let db = MetadataDb::in_memory().await.unwrap();
    let (_dir, vault) = test_vault();
    let (_profile_id, run_id, _session) = seeded_run(&db, &vault, "legacy").await;

    checkpoints::mark_in_progress(&db, run_id, "point_history_240921").await.unwrap();
    checkpoints::record_batch(&db, run_id, "point_history_240921", 40_000, 40_000)
        .await
        .unwrap();
    let cp = checkpoints::get_checkpoint(&db, run_id, "point_history_240921")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cp.status, CheckpointStatus::InProgress);
    assert_eq!(cp.rows_copied, 40_000);
    assert_eq!(cp.last_offset, 40_000);

    checkpoints::mark_completed(&db, run_id, "point_history_240921", 86_400)
        .await
        .unwrap();
    let before: Vec<String> = checkpoints::completed_names(&db, run_id).await.unwrap();

    // a later activation completes more work; the completed set only grows
    checkpoints::mark_completed(&db, run_id, "point_history_240922", 86_400)
        .await
        .unwrap();
    let after: Vec<String> = checkpoints::completed_names(&db, run_id).await.unwrap();
    assert!(before.iter().all(|name| after.contains(name)));
    assert_eq!(after.len(), 2);

    let (done, rows) = checkpoints::completed_totals(&db, run_id).await.unwrap();
    assert_eq!(done, 2);
    assert_eq!(rows, 172_800);

    let pending = checkpoints::pending_for(&db, run_id).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].partition_name, "point_history_240923");
}

#[tokio::test]
async fn test_failed_checkpoint_keeps_error() {
    let db = MetadataDb::in_memory().await.unwrap();
    let (_dir, vault) = test_vault();
    let (_profile_id, run_id, _session) = seeded_run(&db, &vault, "legacy").await;

    checkpoints::mark_failed(&db, run_id, "point_history_240922", "user declined truncate")
        .await
        .unwrap();
    let cp = checkpoints::get_checkpoint(&db, run_id, "point_history_240922")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cp.status, CheckpointStatus::Failed);
    assert_eq!(cp.error.as_deref(), Some("user declined truncate"));
    // still listed as work for a resumed activation
    let pending = checkpoints::pending_for(&db, run_id).await.unwrap();
    assert!(pending.iter().any(|c| c.partition_name == "point_history_240922"));
}

#[tokio::test]
async fn test_log_batch_append_and_read() {
    let db = MetadataDb::in_memory().await.unwrap();
    let (_dir, vault) = test_vault();
    let (_profile_id, _run_id, session) = seeded_run(&db, &vault, "legacy").await;

    let entries: Vec<StoredLogEntry> = (0..5)
        .map(|i| StoredLogEntry {
            run_session_id: session.to_string(),
            ts: Utc::now(),
            level: "INFO".to_string(),
            component: "test".to_string(),
            message: format!("line {i}"),
            context: None,
        })
        .collect();
    append_batch(&db, &entries).await.unwrap();

    let read = entries_for_session(&db, &session.to_string(), 100).await.unwrap();
    assert_eq!(read.len(), 5);
    assert_eq!(read[0].message, "line 0");
    assert_eq!(read[4].message, "line 4");
}

#[tokio::test]
async fn test_deleting_profile_cascades() {
    let db = MetadataDb::in_memory().await.unwrap();
    let (_dir, vault) = test_vault();
    let (_profile_id, run_id, session) = seeded_run(&db, &vault, "legacy").await;
    append_batch(
        &db,
        &[StoredLogEntry {
            run_session_id: session.to_string(),
            ts: Utc::now(),
            level: "INFO".to_string(),
            component: "test".to_string(),
            message: "kept until cascade".to_string(),
            context: None,
        }],
    )
    .await
    .unwrap();

    assert!(delete_profile(&db, "legacy").await.unwrap());
    assert!(runs::get_run(&db, run_id).await.unwrap().is_none());
    assert!(checkpoints::pending_for(&db, run_id).await.unwrap().is_empty());
    assert!(entries_for_session(&db, &session.to_string(), 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_deleting_run_keeps_profile() {
    let db = MetadataDb::in_memory().await.unwrap();
    let (_dir, vault) = test_vault();
    let (_profile_id, run_id, _session) = seeded_run(&db, &vault, "legacy").await;

    assert!(runs::delete_run(&db, run_id).await.unwrap());
    assert!(checkpoints::pending_for(&db, run_id).await.unwrap().is_empty());
    assert!(get_profile_by_name(&db, &vault, "legacy").await.unwrap().is_some());
}

#[tokio::test]
async fn test_run_counters_update() {
    let db = MetadataDb::in_memory().await.unwrap();
    let (_dir, vault) = test_vault();
    let (_profile_id, run_id, _session) = seeded_run(&db, &vault, "legacy").await;

    runs::set_run_totals(&db, run_id, 3).await.unwrap();
    runs::update_run_counters(&db, run_id, 2, 172_800).await.unwrap();
    let run = runs::get_run(&db, run_id).await.unwrap().unwrap();
    assert_eq!(run.total_partitions, 3);
    assert_eq!(run.completed_partitions, 2);
    assert_eq!(run.total_rows, 172_800);
}
