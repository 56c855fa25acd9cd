use thiserror::Error;
use tokio_retry2::strategy::ExponentialBackoff;

/// Error kinds the run policy dispatches on. Most call sites work with
/// `anyhow::Result`; a `MigrationError` is attached where the kind decides
/// retry or abort behavior, and recovered by downcast at the policy points.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MigrationError {
    /// Network reset, deadlock, serialization failure. Retried with backoff.
    #[error("transient database failure: {0}")]
    Transient(String),
    /// Bad input, rejected before any DDL runs.
    #[error("validation failed: {0}")]
    Validation(String),
    /// An existing object does not match the registry shape.
    #[error("schema conflict on {table}: {reason}")]
    SchemaConflict { table: String, reason: String },
    /// The observer declined a TRUNCATE request.
    #[error("user declined truncate")]
    ConfirmationDenied,
    /// Unwound from a suspension point after `stop()`.
    #[error("canceled")]
    Canceled,
    /// Metadata store or vault failure; the run aborts immediately.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Delays for retrying transient failures: 1 s, 4 s, 16 s.
pub fn transient_backoff() -> std::iter::Take<ExponentialBackoff> {
    ExponentialBackoff::from_millis(4).factor(250).take(3)
}

/// SQLSTATEs that are worth retrying: serialization failure, deadlock,
/// connection family, admin shutdown. IO errors and pool timeouts count too.
pub fn transient_db_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some("40001" | "40P01" | "08000" | "08003" | "08006" | "57P01")
        ),
        _ => false,
    }
}

/// Out-of-memory on the server; the row-batch engine halves its batch and
/// retries once.
pub fn memory_pressure_db_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("53200") || db.message().contains("out of memory")
        }
        _ => false,
    }
}

/// Metadata store writes on the history/checkpoint path are fatal to the
/// worker when they fail.
pub fn store_fatal(err: anyhow::Error) -> anyhow::Error {
    MigrationError::Fatal(format!("metadata store failure: {err:#}")).into()
}

pub fn is_canceled(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<MigrationError>(),
        Some(MigrationError::Canceled)
    )
}

pub fn is_confirmation_denied(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<MigrationError>(),
        Some(MigrationError::ConfirmationDenied)
    )
}

pub fn is_fatal(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<MigrationError>(),
        Some(MigrationError::Fatal(_))
    )
}

pub fn is_transient(err: &anyhow::Error) -> bool {
    if matches!(
        err.downcast_ref::<MigrationError>(),
        Some(MigrationError::Transient(_))
    ) {
        return true;
    }
    err.chain()
        .any(|cause| cause.downcast_ref::<sqlx::Error>().is_some_and(transient_db_error))
}

pub fn is_memory_pressure(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<sqlx::Error>()
            .is_some_and(memory_pressure_db_error)
    })
}
