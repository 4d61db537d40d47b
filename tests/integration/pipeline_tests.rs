//! Pipeline-level behavior with in-test extractors
//!
//! Item URLs point at a wiremock server that serves no robots.txt, so every
//! item is allowed and the extractors never touch the network.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use stage_harvest::config::SeedEntry;
use stage_harvest::crawler::RetryPolicy;
use stage_harvest::pipeline::{InputSource, RunOutcome};
use stage_harvest::state::FlushPolicy;
use stage_harvest::storage::{SqliteJournal, StageStatus};
use stage_harvest::{
    Checkpoint, CheckpointState, ExtractionError, Extractor, ExtractorRegistry, HarvestError,
    Pipeline, RateLimiter, Record, RecordStore, RobotsGate, RunOptions, Shutdown,
    StageDescriptor, VisitedLedger, WorkItem,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use wiremock::MockServer;

/// Records every URL it processes, with the time it started
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(String, Instant)>>,
}

impl Recorder {
    fn urls(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|(u, _)| u.clone()).collect()
    }

    fn starts(&self) -> Vec<Instant> {
        let mut starts: Vec<_> = self.seen.lock().unwrap().iter().map(|(_, t)| *t).collect();
        starts.sort();
        starts
    }
}

#[async_trait]
impl Extractor for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn process(&self, item: &WorkItem) -> Result<Record, ExtractionError> {
        self.seen
            .lock()
            .unwrap()
            .push((item.url.clone(), Instant::now()));
        Ok(Record::for_item(item).with("seen", true))
    }
}

/// Emits `links` pointing below the item URL
struct Linker {
    links: usize,
}

#[async_trait]
impl Extractor for Linker {
    fn name(&self) -> &str {
        "linker"
    }

    async fn process(&self, item: &WorkItem) -> Result<Record, ExtractionError> {
        let base = item.url.trim_end_matches('/');
        let links: Vec<_> = (0..self.links)
            .map(|i| json!({"url": format!("{}/entry/{}", base, i), "rank": i}))
            .collect();
        Ok(Record::for_item(item).with("links", links))
    }
}

/// Requests shutdown when it reaches item `stop_at`, then never finishes it
struct StopsAt {
    stop_at: String,
    shutdown: Shutdown,
    inner: Recorder,
}

#[async_trait]
impl Extractor for StopsAt {
    fn name(&self) -> &str {
        "stops-at"
    }

    async fn process(&self, item: &WorkItem) -> Result<Record, ExtractionError> {
        if item.url == self.stop_at {
            self.shutdown.trigger();
            std::future::pending::<()>().await;
        }
        self.inner.process(item).await
    }
}

fn seeds(server: &MockServer, count: usize) -> Vec<SeedEntry> {
    (0..count)
        .map(|i| SeedEntry {
            url: format!("{}/item/{}", server.uri(), i),
            fields: Default::default(),
        })
        .collect()
}

fn build(
    dir: &Path,
    stages: Vec<StageDescriptor>,
    limiter: RateLimiter,
    shutdown: Shutdown,
) -> Pipeline {
    let limiter = Arc::new(limiter);
    let robots = Arc::new(RobotsGate::new(Client::new(), Arc::clone(&limiter), "TestHarvester"));
    let ledger = Arc::new(VisitedLedger::new(dir, FlushPolicy::default()));
    Pipeline::new(stages, dir, limiter, robots, ledger, shutdown)
        .unwrap()
        .with_retry(RetryPolicy::no_retry())
        .with_workers(4)
        .with_journal(Box::new(SqliteJournal::new_in_memory().unwrap()))
}

fn single_stage(extractor: Arc<dyn Extractor>) -> Vec<StageDescriptor> {
    vec![StageDescriptor::new(
        "items",
        "item",
        InputSource::Seed,
        ExtractorRegistry::new(extractor),
    )]
}

fn linked_stages(links: usize, leaf: Arc<dyn Extractor>) -> Vec<StageDescriptor> {
    vec![
        StageDescriptor::new(
            "listing",
            "listing",
            InputSource::Seed,
            ExtractorRegistry::new(Arc::new(Linker { links })),
        ),
        StageDescriptor::new(
            "entries",
            "entry",
            InputSource::stage("listing", "links"),
            ExtractorRegistry::new(leaf),
        ),
    ]
}

#[tokio::test]
async fn test_second_run_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;

    let first = Arc::new(Recorder::default());
    let mut pipeline = build(
        dir.path(),
        linked_stages(5, first.clone()),
        RateLimiter::disabled(),
        Shutdown::new(),
    )
    .with_seeds(seeds(&server, 1));
    let options = RunOptions {
        resume: true,
        ..RunOptions::default()
    };
    pipeline.execute(&options).await.unwrap();
    assert_eq!(first.urls().len(), 5);
    let listing = std::fs::read(dir.path().join("listing.json")).unwrap();
    let entries = std::fs::read(dir.path().join("entries.json")).unwrap();

    let second = Arc::new(Recorder::default());
    let mut pipeline = build(
        dir.path(),
        linked_stages(5, second.clone()),
        RateLimiter::disabled(),
        Shutdown::new(),
    )
    .with_seeds(seeds(&server, 1));
    let report = pipeline.execute(&options).await.unwrap();

    assert!(second.urls().is_empty());
    assert_eq!(report.stage("entries").unwrap().report.skipped, 5);
    assert_eq!(std::fs::read(dir.path().join("listing.json")).unwrap(), listing);
    assert_eq!(std::fs::read(dir.path().join("entries.json")).unwrap(), entries);
    let ledger = VisitedLedger::new(dir.path(), FlushPolicy::default());
    assert_eq!(ledger.len("entry"), 5);
}

#[tokio::test]
async fn test_interrupted_run_resumes_without_repeating_items() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    let seeds = seeds(&server, 8);

    let shutdown = Shutdown::new();
    let stopper = Arc::new(StopsAt {
        stop_at: seeds[3].url.clone(),
        shutdown: shutdown.clone(),
        inner: Recorder::default(),
    });
    let mut pipeline = build(dir.path(), single_stage(stopper.clone()), RateLimiter::disabled(), shutdown)
        .with_seeds(seeds.clone())
        .with_workers(1);

    let report = pipeline.execute(&RunOptions::default()).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Interrupted);
    assert_eq!(report.resume_point, Some(("items".to_string(), 3)));
    assert_eq!(report.stage("items").unwrap().status, StageStatus::Interrupted);
    let done_first = stopper.inner.urls();
    assert_eq!(done_first.len(), 3);

    let resumed = Arc::new(Recorder::default());
    let mut pipeline = build(dir.path(), single_stage(resumed.clone()), RateLimiter::disabled(), Shutdown::new())
        .with_seeds(seeds.clone());
    let options = RunOptions {
        resume: true,
        ..RunOptions::default()
    };
    let report = pipeline.execute(&options).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);

    let done_second = resumed.urls();
    assert_eq!(done_second.len(), 5);
    assert!(done_second.iter().all(|url| !done_first.contains(url)));

    let store = RecordStore::open(dir.path().join("items.json")).unwrap();
    assert_eq!(store.len(), 8);
    assert_eq!(
        Checkpoint::load(Checkpoint::path_in(dir.path())).state(),
        &CheckpointState::Completed
    );
}

#[tokio::test]
async fn test_fresh_run_ignores_checkpoint_but_not_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;

    let mut checkpoint = Checkpoint::fresh(Checkpoint::path_in(dir.path()), Default::default());
    checkpoint.begin_stage("items", 4).unwrap();
    checkpoint.save().unwrap();

    let recorder = Arc::new(Recorder::default());
    let mut pipeline = build(dir.path(), single_stage(recorder.clone()), RateLimiter::disabled(), Shutdown::new())
        .with_seeds(seeds(&server, 6));
    let report = pipeline.execute(&RunOptions::default()).await.unwrap();

    assert_eq!(report.stage("items").unwrap().report.total, 6);
    assert_eq!(recorder.urls().len(), 6);
}

#[tokio::test]
async fn test_requests_respect_rate_limit_across_workers() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    let interval = Duration::from_millis(100);

    let recorder = Arc::new(Recorder::default());
    let mut pipeline = build(
        dir.path(),
        single_stage(recorder.clone()),
        RateLimiter::new(interval),
        Shutdown::new(),
    )
    .with_seeds(seeds(&server, 6))
    .with_workers(4);
    pipeline.execute(&RunOptions::default()).await.unwrap();

    let starts = recorder.starts();
    assert_eq!(starts.len(), 6);
    // Five gaps of at least one interval each, minus timer slack
    let span = starts[5].duration_since(starts[0]);
    assert!(span >= interval * 5 - Duration::from_millis(30), "span was {:?}", span);
}

#[tokio::test]
async fn test_unreadable_ledger_is_treated_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    std::fs::write(VisitedLedger::path_for(dir.path(), "item"), "{not json").unwrap();

    let recorder = Arc::new(Recorder::default());
    let mut pipeline = build(dir.path(), single_stage(recorder.clone()), RateLimiter::disabled(), Shutdown::new())
        .with_seeds(seeds(&server, 3));
    let report = pipeline.execute(&RunOptions::default()).await.unwrap();

    assert_eq!(report.stage("items").unwrap().report.succeeded, 3);
    let ledger = VisitedLedger::new(dir.path(), FlushPolicy::default());
    assert_eq!(ledger.len("item"), 3);
}

#[tokio::test]
async fn test_skipped_stage_output_is_untouched_and_consumed() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;

    let mut pipeline = build(
        dir.path(),
        linked_stages(3, Arc::new(Recorder::default())),
        RateLimiter::disabled(),
        Shutdown::new(),
    )
    .with_seeds(seeds(&server, 1));
    pipeline.execute(&RunOptions::default()).await.unwrap();
    let listing = std::fs::read(dir.path().join("listing.json")).unwrap();

    let recorder = Arc::new(Recorder::default());
    let mut pipeline = build(
        dir.path(),
        linked_stages(10, recorder.clone()),
        RateLimiter::disabled(),
        Shutdown::new(),
    )
    .with_seeds(seeds(&server, 1));
    let options = RunOptions {
        force: true,
        skip: BTreeSet::from(["listing".to_string()]),
        ..RunOptions::default()
    };
    let report = pipeline.execute(&options).await.unwrap();

    assert_eq!(report.stage("listing").unwrap().status, StageStatus::Skipped);
    assert_eq!(std::fs::read(dir.path().join("listing.json")).unwrap(), listing);
    // Entries come from the kept listing (3 links), not a fresh one (10)
    assert_eq!(recorder.urls().len(), 3);
}

#[tokio::test]
async fn test_skipping_a_stage_without_output_fails() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;

    let mut pipeline = build(
        dir.path(),
        linked_stages(3, Arc::new(Recorder::default())),
        RateLimiter::disabled(),
        Shutdown::new(),
    )
    .with_seeds(seeds(&server, 1));
    let options = RunOptions {
        skip: BTreeSet::from(["listing".to_string()]),
        ..RunOptions::default()
    };

    let err = pipeline.execute(&options).await.unwrap_err();
    assert!(matches!(
        err,
        HarvestError::StageInputUnavailable { ref source_stage, .. } if source_stage == "listing"
    ));
}

#[tokio::test]
async fn test_sanity_gate_blocks_later_stages() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;

    let recorder = Arc::new(Recorder::default());
    let mut stages = linked_stages(2, recorder.clone());
    stages[0] = stages[0].clone().with_min_expected(3);
    let mut pipeline = build(dir.path(), stages, RateLimiter::disabled(), Shutdown::new())
        .with_seeds(seeds(&server, 1));

    let err = pipeline.execute(&RunOptions::default()).await.unwrap_err();
    assert!(matches!(
        err,
        HarvestError::SanityCheck { found: 2, expected: 3, .. }
    ));
    assert!(recorder.urls().is_empty());
    assert!(!dir.path().join("entries.json").exists());
}

#[tokio::test]
async fn test_context_flows_from_parent_records() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;

    let mut pipeline = build(
        dir.path(),
        linked_stages(2, Arc::new(Recorder::default())),
        RateLimiter::disabled(),
        Shutdown::new(),
    )
    .with_seeds(seeds(&server, 1));
    pipeline.execute(&RunOptions::default()).await.unwrap();

    let store = RecordStore::open(dir.path().join("entries.json")).unwrap();
    let records = store.get_all();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.get("rank").is_some()));
    assert!(records.iter().all(|r| r.get("seen") == Some(&json!(true))));
}
