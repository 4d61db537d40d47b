//! Storage module for persisting harvest data
//!
//! This module handles everything written to `data_dir`:
//! - Stage outputs as JSON record stores (`<stage>.json`)
//! - Atomic JSON file replacement shared with the ledgers and checkpoint
//! - The SQLite run journal (runs, stage results, item failures)

mod files;
mod record_store;
mod schema;
mod sqlite;
mod traits;

pub use files::{read_json, write_json_atomic};
pub use record_store::RecordStore;
pub use sqlite::SqliteJournal;
pub use traits::{Journal, StorageError, StorageResult};

/// Represents a harvest run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub status: RunStatus,
}

/// Status of a harvest run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_db_string())
    }
}

/// How a single stage ended within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    /// Every item was attempted (some may have failed)
    Completed,
    /// The stage was skipped and its existing output trusted
    Skipped,
    /// Shutdown was requested while the stage ran
    Interrupted,
    /// A run-level error (sanity gate) stopped the pipeline after this stage
    Failed,
}

impl StageStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(Self::Completed),
            "skipped" => Some(Self::Skipped),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_db_string())
    }
}

/// Journaled outcome counts of one stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageResultRecord {
    pub stage: String,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub denied: u64,
    pub persistence_errors: u64,
    pub status: StageStatus,
    pub finished_at: String,
}

/// Journaled failure of a single work item
#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailureRecord {
    pub stage: String,
    pub item_id: String,
    pub url: String,
    /// `transient` (retries exhausted) or `permanent`
    pub kind: String,
    pub message: String,
    pub attempts: u32,
    pub recorded_at: String,
}
