//! End-of-run summary and dry-run plan rendering

use crate::pipeline::{RunOutcome, RunPlan, RunReport};
use crate::storage::StageStatus;

/// Renders the outcome of a run
pub fn format_run_report(report: &RunReport) -> String {
    let mut out = String::new();

    let heading = match report.outcome {
        RunOutcome::Completed => "completed",
        RunOutcome::Interrupted => "interrupted",
    };
    match report.run_id {
        Some(id) => out.push_str(&format!("=== Harvest run {} {} ===\n", id, heading)),
        None => out.push_str(&format!("=== Harvest {} ===\n", heading)),
    }

    for stage in &report.stages {
        let r = &stage.report;
        if stage.status == StageStatus::Skipped {
            out.push_str(&format!("  {:<12} skipped (existing output kept)\n", r.stage));
            continue;
        }
        out.push_str(&format!(
            "  {:<12} {} items: {} ok, {} failed, {} already visited, {} denied\n",
            r.stage, r.total, r.succeeded, r.failed, r.skipped, r.denied
        ));
        if r.persistence_errors > 0 {
            out.push_str(&format!(
                "  {:<12} {} writes failed; those items run again next time\n",
                "", r.persistence_errors
            ));
        }
    }

    if let Some((stage, cursor)) = &report.resume_point {
        out.push_str(&format!(
            "Interrupted in '{}' at item {}; run again to resume (or --fresh to start over)\n",
            stage, cursor
        ));
    }
    out
}

/// Prints the outcome of a run to stdout
pub fn print_run_report(report: &RunReport) {
    print!("{}", format_run_report(report));
}

/// Renders what a run would do
pub fn format_plan(plan: &RunPlan) -> String {
    let mut out = String::new();
    out.push_str(&format!("Checkpoint: {}\n", plan.checkpoint));
    out.push_str(&format!("Seeds: {}\n", plan.seed_count));
    out.push_str("\nStages:\n");
    for stage in &plan.stages {
        let note = if stage.skipped {
            "skip".to_string()
        } else if stage.before_resume {
            "done".to_string()
        } else if let Some(cursor) = stage.start_cursor {
            format!("resume at {}", cursor)
        } else {
            "run".to_string()
        };
        out.push_str(&format!(
            "  {:<12} {:<14} <- {:<20} [{}]\n",
            stage.name, stage.url_class, stage.input, note
        ));
    }
    out
}
