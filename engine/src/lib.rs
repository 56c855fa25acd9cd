//! Partition migration engine for legacy PostgreSQL deployments.
//!
//! The engine moves data from trigger- or rule-partitioned parent tables
//! (9.3-style inheritance partitioning) to a target database, partition by
//! partition, with checkpointed resume, pause/stop control and a choice of
//! two copy strategies: batched INSERTs or a streaming COPY pipeline.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

/// Typed channels between the engine and its observer
pub mod bus;
/// Source/target connection pools and session tuning
pub mod connect;
/// Streaming COPY engine
pub mod copy_stream;
/// Catalog-driven partition discovery
pub mod discovery;
/// Error kinds and the retry/abort policy helpers
pub mod error;
/// Session-scoped structured logging with credential masking
pub mod logging;
/// Progress sampling, rate smoothing and ETA
pub mod progress;
/// Row-batch engine
pub mod row_batch;
/// Run orchestration: discovery, checkpoints, engine dispatch, finalization
pub mod run;
/// Target schema builder
pub mod schema;
/// Declarative metadata for the supported partitioned families
pub mod table_types;
/// Worker lifecycle and the pause/stop control gate
pub mod worker;
