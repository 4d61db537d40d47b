//! Human-readable reports
//!
//! This module handles:
//! - The summary printed at the end of a run
//! - The resolved plan shown by `--dry-run`
//! - Journal statistics shown by `--stats`

pub mod stats;
mod summary;

pub use stats::{format_statistics, load_statistics, print_statistics, RunStatistics};
pub use summary::{format_plan, format_run_report, print_run_report};
