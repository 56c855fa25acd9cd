use partmig_engine::error::{
    is_canceled, is_confirmation_denied, is_fatal, is_transient, transient_backoff, MigrationError,
};
use std::time::Duration;

#[test]
fn test_backoff_schedule_is_1_4_16_seconds() {
    let delays: Vec<Duration> = transient_backoff().collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(4),
            Duration::from_secs(16)
        ]
    );
}

#[test]
fn test_kind_helpers_survive_anyhow_wrapping() {
    let canceled: anyhow::Error = MigrationError::Canceled.into();
    assert!(is_canceled(&canceled));
    assert!(!is_fatal(&canceled));

    let denied: anyhow::Error = MigrationError::ConfirmationDenied.into();
    assert!(is_confirmation_denied(&denied));

    let fatal: anyhow::Error = MigrationError::Fatal("metadata store failure".to_string()).into();
    assert!(is_fatal(&fatal));
    assert!(!is_canceled(&fatal));

    let transient: anyhow::Error =
        MigrationError::Transient("connection reset".to_string()).into();
    assert!(is_transient(&transient));
    assert!(!is_transient(&fatal));
}

#[test]
fn test_io_errors_classify_as_transient() {
    let io = sqlx::Error::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "reset by peer",
    ));
    let wrapped = anyhow::Error::from(io).context("fetching batch");
    assert!(is_transient(&wrapped));
}

#[test]
fn test_plain_errors_are_not_transient() {
    let plain = anyhow::anyhow!("row count mismatch");
    assert!(!is_transient(&plain));
    assert!(!is_canceled(&plain));
}

#[test]
fn test_display_matches_policy_language() {
    assert_eq!(
        MigrationError::ConfirmationDenied.to_string(),
        "user declined truncate"
    );
    assert_eq!(MigrationError::Canceled.to_string(), "canceled");
    let conflict = MigrationError::SchemaConflict {
        table: "point_history_240921".to_string(),
        reason: "expected 4 columns, found 5".to_string(),
    };
    assert_eq!(
        conflict.to_string(),
        "schema conflict on point_history_240921: expected 4 columns, found 5"
    );
}
