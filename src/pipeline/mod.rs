//! Staged harvest pipeline
//!
//! A [`Pipeline`] is an ordered list of [`StageDescriptor`]s plus the shared
//! collaborators every stage uses: rate limiter, robots gate, visited ledger,
//! run journal and shutdown signal. [`Pipeline::execute`] decides where to
//! start (fresh or from the checkpoint), runs each stage in order and
//! records the outcome.
//!
//! # Stage Flow
//!
//! ```text
//! checkpoint ─▶ start stage/cursor ─▶ stage input ─▶ StageRunner ─▶ <stage>.json
//!                                        ▲                              │
//!                                        └──────── next stage ──────────┘
//! ```
//!
//! Run-level failures end the run with an error: missing stage input, the
//! seed-yield sanity gate, and storage that cannot be opened. Everything that
//! happens to a single item is contained in the stage reports.

mod defaults;
mod stage;

pub use defaults::{default_stages, CAREERS, CUSTOMERS, DETAILS, JOBS};
pub use stage::{dedup_items, expand_records, seed_items, InputSource, StageDescriptor};

use crate::config::{load_seed_file, merge_seeds, Config, SeedEntry};
use crate::ConfigError;
use crate::crawler::{
    build_http_client, PageFetcher, RateLimiter, RetryPolicy, Shutdown, StageReport, StageRunner,
    DEFAULT_WORKERS,
};
use crate::extract::WorkItem;
use crate::robots::RobotsGate;
use crate::state::{Checkpoint, CheckpointState, FlushPolicy, RunSnapshot, VisitedLedger};
use crate::storage::{
    ItemFailureRecord, Journal, RecordStore, RunStatus, SqliteJournal, StageResultRecord,
    StageStatus,
};
use crate::HarvestError;
use chrono::Utc;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// File name of the run journal inside the data directory
pub const JOURNAL_FILE: &str = "journal.db";

/// Per-invocation switches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Continue from the saved checkpoint when it is inside a stage
    pub resume: bool,
    /// Ignore the visited ledgers
    pub force: bool,
    /// Treat `failure` ledger entries as unvisited
    pub retry_failed: bool,
    /// Stages whose existing output is trusted instead of running them
    pub skip: BTreeSet<String>,
    /// Cap on work items per stage
    pub item_limit: Option<usize>,
    /// Minimum yield of the seed stage (0 disables the check)
    pub min_expected: usize,
}

impl RunOptions {
    /// Options from the config file; resuming is on unless turned off
    pub fn from_config(config: &Config) -> Self {
        Self {
            resume: true,
            force: false,
            retry_failed: false,
            skip: config.stages.skip.iter().cloned().collect(),
            item_limit: config.crawler.item_limit,
            min_expected: config.crawler.min_expected,
        }
    }
}

/// How a run ended (run-level errors are returned as `Err` instead)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Interrupted,
}

/// Result of one stage within a run
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub status: StageStatus,
    pub report: StageReport,
}

/// Result of [`Pipeline::execute`]
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: Option<i64>,
    pub outcome: RunOutcome,
    pub stages: Vec<StageOutcome>,
    /// Stage and cursor the next resuming run continues from, when interrupted
    pub resume_point: Option<(String, usize)>,
}

impl RunReport {
    pub fn stage(&self, name: &str) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.report.stage == name)
    }

    pub fn total_failures(&self) -> usize {
        self.stages.iter().map(|s| s.report.failed).sum()
    }
}

/// A stage as a run would treat it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStage {
    pub name: String,
    pub url_class: String,
    pub input: String,
    pub skipped: bool,
    /// Entered at this cursor when the run resumes inside it
    pub start_cursor: Option<usize>,
    /// Earlier than the resume point, so not run at all
    pub before_resume: bool,
}

/// What [`Pipeline::execute`] would do, for dry runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub stages: Vec<PlannedStage>,
    pub checkpoint: CheckpointState,
    pub seed_count: usize,
}

/// Ordered stages plus their shared collaborators
pub struct Pipeline {
    stages: Vec<StageDescriptor>,
    data_dir: PathBuf,
    seeds: Vec<SeedEntry>,
    limiter: Arc<RateLimiter>,
    robots: Arc<RobotsGate>,
    ledger: Arc<VisitedLedger>,
    shutdown: Shutdown,
    retry: RetryPolicy,
    workers: usize,
    config_hash: String,
    journal: Option<Box<dyn Journal>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .field("data_dir", &self.data_dir)
            .field("seeds", &self.seeds.len())
            .field("workers", &self.workers)
            .field("journal", &self.journal.is_some())
            .finish()
    }
}

impl Pipeline {
    /// Creates a pipeline over `stages`
    ///
    /// Stage names must be unique and every stage input must name an earlier
    /// stage.
    pub fn new(
        stages: Vec<StageDescriptor>,
        data_dir: impl Into<PathBuf>,
        limiter: Arc<RateLimiter>,
        robots: Arc<RobotsGate>,
        ledger: Arc<VisitedLedger>,
        shutdown: Shutdown,
    ) -> Result<Self, HarvestError> {
        let mut seen = HashSet::new();
        for stage in &stages {
            if let InputSource::Stage { name, .. } = &stage.input {
                if !seen.contains(name.as_str()) {
                    return Err(HarvestError::UnknownStage(name.clone()));
                }
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(ConfigError::Validation(format!("duplicate stage '{}'", stage.name)).into());
            }
        }

        Ok(Self {
            stages,
            data_dir: data_dir.into(),
            seeds: Vec::new(),
            limiter,
            robots,
            ledger,
            shutdown,
            retry: RetryPolicy::default(),
            workers: DEFAULT_WORKERS,
            config_hash: String::new(),
            journal: None,
        })
    }

    /// Builds the default four-stage harvester from a loaded configuration
    ///
    /// Creates the data directory and opens the run journal; failing either
    /// is fatal.
    pub fn from_config(
        config: &Config,
        config_hash: &str,
        shutdown: Shutdown,
    ) -> Result<Self, HarvestError> {
        let data_dir = PathBuf::from(&config.storage.data_dir);
        std::fs::create_dir_all(&data_dir)?;
        let journal = SqliteJournal::new(&data_dir.join(JOURNAL_FILE))?;

        Ok(Self::assemble(config, config_hash, shutdown)?.with_journal(Box::new(journal)))
    }

    /// Builds the default harvester for planning only
    ///
    /// Nothing is created on disk and no journal is opened, so the result can
    /// answer [`Pipeline::plan`] for a dry run. Executing it runs without a
    /// journal.
    pub fn for_planning(config: &Config, config_hash: &str) -> Result<Self, HarvestError> {
        Self::assemble(config, config_hash, Shutdown::new())
    }

    fn assemble(config: &Config, config_hash: &str, shutdown: Shutdown) -> Result<Self, HarvestError> {
        let data_dir = PathBuf::from(&config.storage.data_dir);
        let client = build_http_client(
            &config.user_agent,
            Duration::from_secs(config.crawler.request_timeout_secs),
        )?;
        let limiter = Arc::new(RateLimiter::from_secs_f64(config.crawler.rate_limit_seconds));
        let robots = Arc::new(RobotsGate::new(
            client.clone(),
            Arc::clone(&limiter),
            config.user_agent.crawler_name.clone(),
        ));
        let ledger = Arc::new(VisitedLedger::new(
            &data_dir,
            FlushPolicy {
                every: config.storage.ledger_flush_every.max(1),
                interval: Duration::from_secs(config.storage.ledger_flush_interval_secs),
            },
        ));
        let fetcher = PageFetcher::new(client, Arc::clone(&limiter), Arc::clone(&robots));
        let stages = default_stages(&fetcher).map_err(|e| {
            ConfigError::Validation(format!("invalid extractor pattern: {}", e))
        })?;

        let from_file = match &config.storage.seed_file {
            Some(path) => load_seed_file(Path::new(path))?,
            None => Vec::new(),
        };
        let seeds = merge_seeds(&config.seed, from_file);

        Ok(Self::new(stages, data_dir, limiter, robots, ledger, shutdown)?
            .with_seeds(seeds)
            .with_retry(RetryPolicy::from_config(&config.crawler))
            .with_workers(config.crawler.workers)
            .with_config_hash(config_hash))
    }

    #[must_use]
    pub fn with_seeds(mut self, seeds: Vec<SeedEntry>) -> Self {
        self.seeds = seeds;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn with_config_hash(mut self, config_hash: impl Into<String>) -> Self {
        self.config_hash = config_hash.into();
        self
    }

    #[must_use]
    pub fn with_journal(mut self, journal: Box<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn seeds(&self) -> &[SeedEntry] {
        &self.seeds
    }

    pub fn journal(&self) -> Option<&dyn Journal> {
        self.journal.as_deref()
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        Checkpoint::path_in(&self.data_dir)
    }

    /// Resolves what a run with `options` would do without running anything
    pub fn plan(&self, options: &RunOptions) -> Result<RunPlan, HarvestError> {
        self.check_skip_names(options)?;
        let checkpoint = Checkpoint::load(self.checkpoint_path());
        let (start_stage, start_cursor) = self.resume_point(checkpoint.state(), options);

        let stages = self
            .stages
            .iter()
            .enumerate()
            .map(|(index, stage)| PlannedStage {
                name: stage.name.clone(),
                url_class: stage.url_class.clone(),
                input: stage.input.to_string(),
                skipped: self.is_skipped(stage, options),
                start_cursor: (index == start_stage && start_cursor > 0).then_some(start_cursor),
                before_resume: index < start_stage,
            })
            .collect();

        Ok(RunPlan {
            stages,
            checkpoint: checkpoint.state().clone(),
            seed_count: seed_items(&self.seeds).len(),
        })
    }

    /// Runs the pipeline
    ///
    /// Returns `Ok` for completed and interrupted runs. The journal records
    /// the run as `failed` when an error is returned.
    pub async fn execute(&mut self, options: &RunOptions) -> Result<RunReport, HarvestError> {
        self.check_skip_names(options)?;
        std::fs::create_dir_all(&self.data_dir)?;

        let run_id = match self.journal.as_mut() {
            Some(journal) => Some(journal.start_run(&self.config_hash)?),
            None => None,
        };
        if let Some(id) = run_id {
            tracing::info!("Starting harvest run {}", id);
        }

        let result = self.run_stages(run_id, options).await;

        let status = match &result {
            Ok(report) if report.outcome == RunOutcome::Completed => RunStatus::Completed,
            Ok(_) => RunStatus::Interrupted,
            Err(_) => RunStatus::Failed,
        };
        if let (Some(journal), Some(id)) = (self.journal.as_mut(), run_id) {
            if let Err(e) = journal.finish_run(id, status) {
                tracing::error!("Failed to record end of run {}: {}", id, e);
            }
        }
        result
    }

    async fn run_stages(
        &mut self,
        run_id: Option<i64>,
        options: &RunOptions,
    ) -> Result<RunReport, HarvestError> {
        let snapshot = self.snapshot(options);
        let mut checkpoint = Checkpoint::load(self.checkpoint_path());

        if options.resume {
            let previous = checkpoint.snapshot();
            if !previous.config_hash.is_empty() && previous.config_hash != snapshot.config_hash {
                tracing::warn!(
                    "Configuration changed since the checkpoint was saved; resuming anyway"
                );
            }
        }

        let (start_stage, start_cursor) = self.resume_point(checkpoint.state(), options);
        checkpoint.reset();
        checkpoint.set_snapshot(snapshot);

        let runner = StageRunner::new(
            Arc::clone(&self.limiter),
            Arc::clone(&self.robots),
            Arc::clone(&self.ledger),
            self.shutdown.clone(),
        )
        .with_workers(self.workers)
        .with_retry(self.retry)
        .with_force(options.force)
        .with_retry_failed(options.retry_failed);

        let mut report = RunReport {
            run_id,
            outcome: RunOutcome::Completed,
            stages: Vec::new(),
            resume_point: None,
        };

        for index in start_stage..self.stages.len() {
            let stage = self.stages[index].clone();

            if self.shutdown.is_triggered() {
                report.outcome = RunOutcome::Interrupted;
                break;
            }

            if self.is_skipped(&stage, options) {
                tracing::info!("Stage '{}' skipped; trusting existing output", stage.name);
                let outcome = StageOutcome {
                    status: StageStatus::Skipped,
                    report: StageReport::new(&stage.name),
                };
                self.journal_stage(run_id, &outcome);
                report.stages.push(outcome);
                continue;
            }

            let items = self.stage_items(&stage)?;
            let items = match options.item_limit {
                Some(limit) if items.len() > limit => {
                    tracing::info!(
                        "Stage '{}': limiting {} items to {}",
                        stage.name,
                        items.len(),
                        limit
                    );
                    items.into_iter().take(limit).collect()
                }
                _ => items,
            };

            let cursor = if index == start_stage { start_cursor } else { 0 };
            checkpoint.begin_stage(&stage.name, cursor)?;
            let mut checkpoint_errors = 0;
            if let Err(e) = checkpoint.save() {
                tracing::error!("Failed to save checkpoint entering '{}': {}", stage.name, e);
                checkpoint_errors += 1;
            }

            let store = Arc::new(RecordStore::open(stage.output_path(&self.data_dir))?);
            let mut stage_report = runner
                .run(&stage, Arc::clone(&store), items, cursor, &mut checkpoint)
                .await;
            stage_report.persistence_errors += checkpoint_errors;

            if stage_report.interrupted {
                report.resume_point = Some((stage.name.clone(), stage_report.cursor));
                let outcome = StageOutcome {
                    status: StageStatus::Interrupted,
                    report: stage_report,
                };
                self.journal_stage(run_id, &outcome);
                report.stages.push(outcome);
                report.outcome = RunOutcome::Interrupted;
                break;
            }

            let gate = self.sanity_gate(index, options);
            if gate > 0 {
                let found = self.stage_yield(index, &store);
                if found < gate {
                    tracing::error!(
                        "Stage '{}' yielded {} items, expected at least {}; stopping",
                        stage.name,
                        found,
                        gate
                    );
                    let outcome = StageOutcome {
                        status: StageStatus::Failed,
                        report: stage_report,
                    };
                    self.journal_stage(run_id, &outcome);
                    return Err(HarvestError::SanityCheck {
                        stage: stage.name.clone(),
                        found,
                        expected: gate,
                    });
                }
                tracing::info!("Stage '{}' yielded {} items (minimum {})", stage.name, found, gate);
            }

            let outcome = StageOutcome {
                status: StageStatus::Completed,
                report: stage_report,
            };
            self.journal_stage(run_id, &outcome);
            report.stages.push(outcome);
        }

        match report.outcome {
            RunOutcome::Completed => {
                checkpoint.complete()?;
                if let Err(e) = checkpoint.save() {
                    tracing::error!("Failed to save completed checkpoint: {}", e);
                }
                tracing::info!("Harvest complete");
            }
            RunOutcome::Interrupted => {
                if let Err(e) = self.ledger.flush_all() {
                    tracing::error!("Failed to flush ledgers on interrupt: {}", e);
                }
                if report.resume_point.is_none() {
                    if let CheckpointState::InStage { stage, cursor } = checkpoint.state() {
                        report.resume_point = Some((stage.clone(), *cursor));
                    }
                }
                tracing::warn!("Harvest interrupted; the next run resumes from the checkpoint");
            }
        }

        Ok(report)
    }

    /// Index and cursor of the first stage to run
    fn resume_point(&self, state: &CheckpointState, options: &RunOptions) -> (usize, usize) {
        let first_runnable = |from: usize| {
            (from..self.stages.len())
                .find(|&i| !self.is_skipped(&self.stages[i], options))
                .unwrap_or(self.stages.len())
        };

        if !options.resume {
            return (first_runnable(0), 0);
        }

        match state {
            CheckpointState::InStage { stage, cursor } => {
                match self.stages.iter().position(|s| &s.name == stage) {
                    Some(index) if !self.is_skipped(&self.stages[index], options) => {
                        tracing::info!("Resuming stage '{}' at item {}", stage, cursor);
                        (index, *cursor)
                    }
                    Some(index) => {
                        tracing::info!(
                            "Checkpoint stage '{}' is skipped; continuing with the next stage",
                            stage
                        );
                        (first_runnable(index + 1), 0)
                    }
                    None => {
                        tracing::warn!("Checkpoint names unknown stage '{}'; starting fresh", stage);
                        (first_runnable(0), 0)
                    }
                }
            }
            CheckpointState::Completed => {
                tracing::info!("Previous run completed; starting a new pass");
                (first_runnable(0), 0)
            }
            CheckpointState::NotStarted => (first_runnable(0), 0),
        }
    }

    fn is_skipped(&self, stage: &StageDescriptor, options: &RunOptions) -> bool {
        stage.skip || options.skip.contains(&stage.name)
    }

    fn check_skip_names(&self, options: &RunOptions) -> Result<(), HarvestError> {
        match options
            .skip
            .iter()
            .find(|name| !self.stages.iter().any(|s| &s.name == *name))
        {
            Some(unknown) => Err(HarvestError::UnknownStage(unknown.clone())),
            None => Ok(()),
        }
    }

    /// Work items for `stage`, read from seeds or the source stage's output
    fn stage_items(&self, stage: &StageDescriptor) -> Result<Vec<WorkItem>, HarvestError> {
        let (items, source) = match &stage.input {
            InputSource::Seed => (seed_items(&self.seeds), "seed".to_string()),
            InputSource::Stage { name, field } => {
                let source = self
                    .stages
                    .iter()
                    .find(|s| &s.name == name)
                    .ok_or_else(|| HarvestError::UnknownStage(name.clone()))?;
                let store = RecordStore::open(source.output_path(&self.data_dir))?;
                (expand_records(&store.get_all(), field), name.clone())
            }
        };

        if items.is_empty() {
            return Err(HarvestError::StageInputUnavailable {
                stage: stage.name.clone(),
                source_stage: source,
            });
        }
        tracing::info!("Stage '{}': {} work items from {}", stage.name, items.len(), stage.input);
        Ok(items)
    }

    /// Minimum yield required of stage `index` (0 when ungated)
    fn sanity_gate(&self, index: usize, options: &RunOptions) -> usize {
        let stage = &self.stages[index];
        if stage.input == InputSource::Seed && options.min_expected > 0 {
            options.min_expected
        } else {
            stage.min_expected
        }
    }

    /// Number of work items the output of stage `index` expands into for the
    /// stage that consumes it (its record count when nothing does)
    fn stage_yield(&self, index: usize, store: &RecordStore) -> usize {
        let name = &self.stages[index].name;
        let consumer = self.stages[index + 1..].iter().find_map(|s| match &s.input {
            InputSource::Stage { name: source, field } if source == name => Some(field),
            _ => None,
        });
        match consumer {
            Some(field) => expand_records(&store.get_all(), field).len(),
            None => store.len(),
        }
    }

    fn snapshot(&self, options: &RunOptions) -> RunSnapshot {
        RunSnapshot {
            config_hash: self.config_hash.clone(),
            rate_limit_seconds: self.limiter.interval().as_secs_f64(),
            workers: self.workers,
            item_limit: options.item_limit,
            force: options.force,
            retry_failed: options.retry_failed,
            skip: options.skip.iter().cloned().collect(),
        }
    }

    fn journal_stage(&mut self, run_id: Option<i64>, outcome: &StageOutcome) {
        let (Some(journal), Some(run_id)) = (self.journal.as_mut(), run_id) else {
            return;
        };
        let now = Utc::now().to_rfc3339();
        let report = &outcome.report;

        let result = StageResultRecord {
            stage: report.stage.clone(),
            succeeded: report.succeeded as u64,
            failed: report.failed as u64,
            skipped: report.skipped as u64,
            denied: report.denied as u64,
            persistence_errors: report.persistence_errors as u64,
            status: outcome.status,
            finished_at: now.clone(),
        };
        if let Err(e) = journal.record_stage_result(run_id, &result) {
            tracing::error!("Failed to journal stage '{}': {}", report.stage, e);
        }

        for failure in &report.failures {
            let record = ItemFailureRecord {
                stage: report.stage.clone(),
                item_id: failure.id.clone(),
                url: failure.url.clone(),
                kind: failure.kind.clone(),
                message: failure.message.clone(),
                attempts: failure.attempts,
                recorded_at: now.clone(),
            };
            if let Err(e) = journal.record_failure(run_id, &record) {
                tracing::error!("Failed to journal failure of {}: {}", failure.url, e);
            }
        }
    }
}
