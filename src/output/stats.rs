//! Statistics read back from the run journal
//!
//! Backs the `--stats` mode: the latest run, its per-stage counts and every
//! item failure recorded for it.

use crate::storage::{
    ItemFailureRecord, Journal, RunRecord, StageResultRecord, StageStatus, StorageResult,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Journaled view of one run
#[derive(Debug, Clone)]
pub struct RunStatistics {
    pub run: RunRecord,
    pub stages: Vec<StageResultRecord>,
    pub failures: Vec<ItemFailureRecord>,
}

impl RunStatistics {
    /// Wall-clock duration, when the run finished
    pub fn duration_seconds(&self) -> Option<i64> {
        let started = self.run.started_at.parse::<DateTime<Utc>>().ok()?;
        let finished = self.run.finished_at.as_ref()?.parse::<DateTime<Utc>>().ok()?;
        Some((finished - started).num_seconds())
    }

    pub fn total_succeeded(&self) -> u64 {
        self.stages.iter().map(|s| s.succeeded).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.stages.iter().map(|s| s.failed).sum()
    }

    /// Failure counts per `(stage, kind)`
    pub fn failures_by_kind(&self) -> BTreeMap<(String, String), usize> {
        let mut counts = BTreeMap::new();
        for failure in &self.failures {
            *counts
                .entry((failure.stage.clone(), failure.kind.clone()))
                .or_insert(0) += 1;
        }
        counts
    }
}

/// Loads the latest run from the journal, if any run was recorded
pub fn load_statistics(journal: &dyn Journal) -> StorageResult<Option<RunStatistics>> {
    let Some(run) = journal.get_latest_run()? else {
        return Ok(None);
    };
    let stages = journal.get_stage_results(run.id)?;
    let failures = journal.get_failures(run.id)?;
    Ok(Some(RunStatistics {
        run,
        stages,
        failures,
    }))
}

/// Renders statistics as plain text
///
/// At most `max_failures` individual failures are listed; the per-kind
/// counts always cover all of them.
pub fn format_statistics(stats: &RunStatistics, max_failures: usize) -> String {
    let mut out = String::new();
    let run = &stats.run;

    out.push_str("=== Harvest Statistics ===\n\n");
    out.push_str(&format!("Run {} ({})\n", run.id, run.status));
    out.push_str(&format!("  Started: {}\n", run.started_at));
    if let Some(finished) = &run.finished_at {
        out.push_str(&format!("  Finished: {}\n", finished));
    }
    if let Some(seconds) = stats.duration_seconds() {
        out.push_str(&format!("  Duration: {}s\n", seconds));
    }
    out.push_str(&format!("  Config hash: {}\n", run.config_hash));
    out.push('\n');

    out.push_str("Stages:\n");
    if stats.stages.is_empty() {
        out.push_str("  (none recorded)\n");
    }
    for stage in &stats.stages {
        if stage.status == StageStatus::Skipped {
            out.push_str(&format!("  {:<12} skipped\n", stage.stage));
            continue;
        }
        out.push_str(&format!(
            "  {:<12} {:<11} ok {:>6}  failed {:>5}  visited {:>6}  denied {:>4}\n",
            stage.stage,
            stage.status.to_db_string(),
            stage.succeeded,
            stage.failed,
            stage.skipped,
            stage.denied
        ));
        if stage.persistence_errors > 0 {
            out.push_str(&format!(
                "  {:<12} {} persistence errors\n",
                "", stage.persistence_errors
            ));
        }
    }
    out.push('\n');

    if !stats.failures.is_empty() {
        out.push_str(&format!("Failures ({}):\n", stats.failures.len()));
        for ((stage, kind), count) in stats.failures_by_kind() {
            out.push_str(&format!("  {} / {}: {}\n", stage, kind, count));
        }
        for failure in stats.failures.iter().take(max_failures) {
            out.push_str(&format!(
                "  - [{}] {} after {} attempt(s): {}\n",
                failure.stage, failure.url, failure.attempts, failure.message
            ));
        }
        if stats.failures.len() > max_failures {
            out.push_str(&format!("  ... and {} more\n", stats.failures.len() - max_failures));
        }
        out.push('\n');
    }

    let succeeded = stats.total_succeeded();
    let attempted = succeeded + stats.total_failed();
    let rate = if attempted > 0 {
        succeeded as f64 / attempted as f64 * 100.0
    } else {
        0.0
    };
    out.push_str(&format!(
        "Success Rate: {:.1}% ({} / {} items)\n",
        rate, succeeded, attempted
    ));
    out
}

/// Prints statistics to stdout
pub fn print_statistics(stats: &RunStatistics) {
    print!("{}", format_statistics(stats, 20));
}
