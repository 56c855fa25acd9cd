//! Local persistence for partmig.
//!
//! Everything a migration run needs to remember across process restarts
//! lives here: the per-user storage root, the credential vault and the
//! embedded metadata store (profiles, runs, checkpoints, logs).

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

/// Resolution of the per-user storage root
pub mod app_paths;
/// Per-partition progress records
pub mod checkpoints;
/// Background writer for the logs table
pub mod log_writer;
/// Append-only structured log entries
pub mod logs;
/// Connection to the embedded metadata store
pub mod metadata_db;
/// Connection profiles with sealed credentials
pub mod profiles;
/// Run history
pub mod runs;
/// Versioned schema creation for the metadata store
pub mod sql_migration;
/// Symmetric sealing of connection secrets
pub mod vault;
