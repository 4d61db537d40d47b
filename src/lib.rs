//! Stage-Harvest: a resumable, polite, staged web harvester
//!
//! This crate crawls a tree of related resources (a seed listing, per-item
//! detail pages, and pages discovered from those details) in ordered stages.
//! Each stage fans its work items out to a bounded worker pool, gates every
//! request through robots.txt and a process-wide rate limiter, and commits
//! results into durable record stores and visited ledgers so an interrupted
//! run can resume exactly where it stopped.

pub mod config;
pub mod crawler;
pub mod extract;
pub mod output;
pub mod pipeline;
pub mod robots;
pub mod state;
pub mod storage;
pub mod url;

use thiserror::Error;

/// Main error type for Stage-Harvest operations
///
/// Only run-level failures surface through this type. Per-item extraction
/// failures are contained by the stage runner and reported in stage reports.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("URL error: {0}")]
    Url(#[from] UrlError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Sanity check failed for stage '{stage}': yielded {found} items, expected at least {expected}")]
    SanityCheck {
        stage: String,
        found: usize,
        expected: usize,
    },

    #[error("Input for stage '{stage}' is unavailable: output of '{source_stage}' is empty")]
    StageInputUnavailable { stage: String, source_stage: String },

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Invalid checkpoint transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid seed file: {0}")]
    Seed(String),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing domain in URL")]
    MissingDomain,

    #[error("Malformed URL: {0}")]
    Malformed(String),
}

/// Result type alias for Stage-Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{RateLimiter, Shutdown, StageRunner};
pub use extract::{ExtractionError, Extractor, ExtractorRegistry, Record, WorkItem};
pub use pipeline::{Pipeline, RunOptions, RunReport, StageDescriptor};
pub use robots::RobotsGate;
pub use state::{Checkpoint, CheckpointState, VisitedLedger, VisitedOutcome};
pub use storage::RecordStore;
