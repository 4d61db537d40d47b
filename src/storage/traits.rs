//! Storage traits and error types
//!
//! This module defines the trait interface for the run journal and the error
//! type shared by every persisted artifact (journal, record stores, ledgers,
//! checkpoint).

use crate::storage::{ItemFailureRecord, RunRecord, RunStatus, StageResultRecord};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Corrupt data in {path}: {message}")]
    Corrupt { path: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Durable log of runs, per-stage outcomes and per-item failures
///
/// The pipeline writes to the journal from its coordinating task only, between
/// stages and once per failed item, so implementations need not be `Sync`.
pub trait Journal: Send {
    // ===== Run Management =====

    /// Records the start of a run and returns its id
    fn start_run(&mut self, config_hash: &str) -> StorageResult<i64>;

    /// Sets the final status and finish timestamp of a run
    fn finish_run(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()>;

    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord>;

    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>>;

    /// Most recent runs first
    fn list_runs(&self, limit: usize) -> StorageResult<Vec<RunRecord>>;

    // ===== Stage Results =====

    fn record_stage_result(&mut self, run_id: i64, result: &StageResultRecord)
        -> StorageResult<()>;

    fn get_stage_results(&self, run_id: i64) -> StorageResult<Vec<StageResultRecord>>;

    // ===== Item Failures =====

    fn record_failure(&mut self, run_id: i64, failure: &ItemFailureRecord) -> StorageResult<()>;

    fn get_failures(&self, run_id: i64) -> StorageResult<Vec<ItemFailureRecord>>;
}
