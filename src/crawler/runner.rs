//! Stage runner - bounded worker pool for one stage
//!
//! The runner owns a fixed number of worker tasks pulling `(index, item)`
//! pairs from a shared bounded queue. For every item a worker:
//!
//! 1. Skips it if the visited ledger already has it (unless forced)
//! 2. Checks robots.txt; a denial is marked `skipped`
//! 3. Waits on the rate limiter and calls the extractor, retrying transient
//!    errors with exponential backoff
//! 4. Commits: record append, then ledger mark
//!
//! Commits are synchronous, so an abandoned worker either committed an item
//! completely or not at all. Workers report each finished index back to the
//! coordinating task, which advances the checkpoint cursor as the
//! low-watermark of finished indices and persists it once the ledger marks
//! behind it are on disk.

use crate::crawler::{RateLimiter, RetryPolicy, Shutdown};
use crate::extract::{ExtractionError, ExtractorRegistry, Record, WorkItem};
use crate::pipeline::StageDescriptor;
use crate::robots::RobotsGate;
use crate::state::{Checkpoint, StageCursor, VisitedLedger, VisitedOutcome};
use crate::storage::RecordStore;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{Duration, MissedTickBehavior};

/// Default number of concurrent workers per stage
pub const DEFAULT_WORKERS: usize = 5;

/// Progress is logged every this many finished items
const PROGRESS_EVERY: usize = 10;

/// Shortest period between checks for stale ledger marks
const MIN_FLUSH_TICK: Duration = Duration::from_millis(100);

/// A work item that could not be turned into a record
#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure {
    pub id: String,
    pub url: String,
    /// `transient` (retries exhausted) or `permanent`
    pub kind: String,
    pub message: String,
    pub attempts: u32,
}

/// Outcome counts of one stage run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageReport {
    pub stage: String,
    /// Items handed to the pool (those at or after the start cursor)
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Already in the visited ledger
    pub skipped: usize,
    /// Disallowed by robots.txt
    pub denied: usize,
    pub persistence_errors: usize,
    pub failures: Vec<ItemFailure>,
    /// Shutdown was requested before the queue drained
    pub interrupted: bool,
    /// Low-watermark cursor when the stage stopped
    pub cursor: usize,
}

impl StageReport {
    pub fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            ..Self::default()
        }
    }

    /// Items that reached a final outcome
    pub fn finished(&self) -> usize {
        self.succeeded + self.failed + self.skipped + self.denied
    }
}

#[derive(Debug)]
enum ItemOutcome {
    Succeeded,
    AlreadyVisited,
    Denied,
    Failed(ItemFailure),
}

/// What a worker reports back for one index
#[derive(Debug)]
struct Completion {
    index: usize,
    outcome: ItemOutcome,
    /// False when a write failed; the cursor must not pass this index
    committed: bool,
    persistence_errors: usize,
}

/// Everything a worker needs, shared across the pool of one stage
struct WorkerContext {
    stage: String,
    url_class: String,
    registry: Arc<ExtractorRegistry>,
    store: Arc<RecordStore>,
    limiter: Arc<RateLimiter>,
    robots: Arc<RobotsGate>,
    ledger: Arc<VisitedLedger>,
    retry: RetryPolicy,
    force: bool,
    retry_failed: bool,
}

/// Executes stages on a bounded worker pool
///
/// The rate limiter, robots gate and ledger are shared with every stage of
/// the run; the runner itself holds no per-stage state.
#[derive(Debug, Clone)]
pub struct StageRunner {
    limiter: Arc<RateLimiter>,
    robots: Arc<RobotsGate>,
    ledger: Arc<VisitedLedger>,
    shutdown: Shutdown,
    workers: usize,
    retry: RetryPolicy,
    force: bool,
    retry_failed: bool,
}

impl StageRunner {
    pub fn new(
        limiter: Arc<RateLimiter>,
        robots: Arc<RobotsGate>,
        ledger: Arc<VisitedLedger>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            limiter,
            robots,
            ledger,
            shutdown,
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::default(),
            force: false,
            retry_failed: false,
        }
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Ignore the visited ledger when deciding what to process
    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Treat `failure` ledger entries as unvisited
    #[must_use]
    pub fn with_retry_failed(mut self, retry_failed: bool) -> Self {
        self.retry_failed = retry_failed;
        self
    }

    pub fn ledger(&self) -> &Arc<VisitedLedger> {
        &self.ledger
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Runs `stage` over `items`, starting at index `start`
    ///
    /// `checkpoint` must already be in this stage; its cursor is advanced and
    /// saved whenever the low-watermark of finished items moves. Per-item
    /// errors are contained in the returned report.
    pub async fn run(
        &self,
        stage: &StageDescriptor,
        store: Arc<RecordStore>,
        items: Vec<WorkItem>,
        start: usize,
        checkpoint: &mut Checkpoint,
    ) -> StageReport {
        let mut report = StageReport::new(&stage.name);
        let start = start.min(items.len());
        report.total = items.len() - start;
        report.cursor = start;

        if start > 0 {
            tracing::info!(
                "Stage '{}': resuming at item {} of {}",
                stage.name,
                start,
                items.len()
            );
        }
        tracing::info!(
            "Stage '{}': processing {} items with {} workers",
            stage.name,
            report.total,
            self.workers
        );

        let context = Arc::new(WorkerContext {
            stage: stage.name.clone(),
            url_class: stage.url_class.clone(),
            registry: Arc::clone(&stage.registry),
            store,
            limiter: Arc::clone(&self.limiter),
            robots: Arc::clone(&self.robots),
            ledger: Arc::clone(&self.ledger),
            retry: self.retry,
            force: self.force,
            retry_failed: self.retry_failed,
        });

        let (queue_tx, queue_rx) = mpsc::channel::<(usize, WorkItem)>(self.workers * 2);
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();

        let mut workers = JoinSet::new();
        for worker_id in 0..self.workers {
            let context = Arc::clone(&context);
            let queue = Arc::clone(&queue_rx);
            let done = done_tx.clone();
            let shutdown = self.shutdown.clone();
            workers.spawn(async move { worker_loop(worker_id, context, queue, done, shutdown).await });
        }
        // Only workers hold the queue and completion ends from here on, so
        // the feeder stops if every worker is gone.
        drop(queue_rx);
        drop(done_tx);

        let feeder_shutdown = self.shutdown.clone();
        let feeder = tokio::spawn(async move {
            for (index, item) in items.into_iter().enumerate().skip(start) {
                tokio::select! {
                    biased;
                    _ = feeder_shutdown.triggered() => break,
                    sent = queue_tx.send((index, item)) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut cursor = StageCursor::starting_at(start);
        let mut saved = start;
        let mut finished = 0usize;
        let mut flush_tick = tokio::time::interval(
            self.ledger.policy().interval.max(MIN_FLUSH_TICK),
        );
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let completion = tokio::select! {
                completion = done_rx.recv() => match completion {
                    Some(completion) => completion,
                    None => break,
                },
                _ = flush_tick.tick() => {
                    if let Err(e) = self.ledger.flush_due() {
                        tracing::error!("Stage '{}': failed to flush ledger: {}", stage.name, e);
                        report.persistence_errors += 1;
                    }
                    self.persist_cursor(stage, &cursor, &mut saved, checkpoint, &mut report);
                    continue;
                }
            };

            finished += 1;
            report.persistence_errors += completion.persistence_errors;
            match completion.outcome {
                ItemOutcome::Succeeded => report.succeeded += 1,
                ItemOutcome::AlreadyVisited => report.skipped += 1,
                ItemOutcome::Denied => report.denied += 1,
                ItemOutcome::Failed(failure) => {
                    report.failed += 1;
                    report.failures.push(failure);
                }
            }

            if completion.committed && cursor.complete(completion.index) {
                self.persist_cursor(stage, &cursor, &mut saved, checkpoint, &mut report);
            }

            if finished % PROGRESS_EVERY == 0 {
                tracing::info!(
                    "Stage '{}' progress: {}/{} items ({} ok, {} failed, {} skipped, {} denied)",
                    stage.name,
                    finished,
                    report.total,
                    report.succeeded,
                    report.failed,
                    report.skipped,
                    report.denied
                );
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Stage '{}': worker task failed: {}", stage.name, e);
            }
        }
        if let Err(e) = feeder.await {
            tracing::error!("Stage '{}': queue feeder failed: {}", stage.name, e);
        }

        match self.ledger.flush_all() {
            Ok(()) => self.persist_cursor(stage, &cursor, &mut saved, checkpoint, &mut report),
            Err(e) => {
                tracing::error!("Stage '{}': failed to flush ledgers: {}", stage.name, e);
                report.persistence_errors += 1;
            }
        }

        report.cursor = cursor.position();
        report.interrupted = self.shutdown.is_triggered() && report.cursor < start + report.total;

        if report.interrupted {
            tracing::warn!(
                "Stage '{}' interrupted at item {} ({} finished)",
                stage.name,
                report.cursor,
                finished
            );
        } else {
            tracing::info!(
                "Stage '{}' finished: {} ok, {} failed, {} skipped, {} denied, {} persistence errors",
                stage.name,
                report.succeeded,
                report.failed,
                report.skipped,
                report.denied,
                report.persistence_errors
            );
        }
        report
    }

    /// Saves the checkpoint at the cursor once every ledger mark behind it
    /// is on disk
    ///
    /// With a batched flush policy the cursor may run ahead of the durable
    /// ledger; it is then held back until the next flush.
    fn persist_cursor(
        &self,
        stage: &StageDescriptor,
        cursor: &StageCursor,
        saved: &mut usize,
        checkpoint: &mut Checkpoint,
        report: &mut StageReport,
    ) {
        let position = cursor.position();
        if position <= *saved || self.ledger.unflushed(&stage.url_class) > 0 {
            return;
        }
        if let Err(e) = checkpoint.advance(position) {
            tracing::error!("Stage '{}': checkpoint not advanced: {}", stage.name, e);
        } else if let Err(e) = checkpoint.save() {
            tracing::error!("Stage '{}': failed to save checkpoint: {}", stage.name, e);
            report.persistence_errors += 1;
        } else {
            *saved = position;
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    context: Arc<WorkerContext>,
    queue: Arc<Mutex<mpsc::Receiver<(usize, WorkItem)>>>,
    done: mpsc::UnboundedSender<Completion>,
    shutdown: Shutdown,
) {
    loop {
        if shutdown.is_triggered() {
            break;
        }

        let next = {
            let mut rx = queue.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.triggered() => None,
                item = rx.recv() => item,
            }
        };
        let Some((index, item)) = next else {
            break;
        };

        // Dropping the in-flight future abandons the item; commits happen
        // after its last await, so nothing is left half-written.
        let item_url = item.url.clone();
        let completion = tokio::select! {
            biased;
            _ = shutdown.triggered() => {
                tracing::debug!("Worker {} abandoned {}", worker_id, item_url);
                break;
            }
            completion = context.process(index, item) => completion,
        };

        if done.send(completion).is_err() {
            break;
        }
    }
    tracing::debug!("Worker {} for stage '{}' stopped", worker_id, context.stage);
}

impl WorkerContext {
    async fn process(&self, index: usize, item: WorkItem) -> Completion {
        if self.already_visited(&item.url) {
            tracing::debug!("[{}] already visited: {}", self.stage, item.url);
            return Completion {
                index,
                outcome: ItemOutcome::AlreadyVisited,
                committed: true,
                persistence_errors: 0,
            };
        }

        if !self.robots.allowed(&item.url).await {
            let committed = self.mark(&item.url, VisitedOutcome::Skipped);
            return Completion {
                index,
                outcome: ItemOutcome::Denied,
                committed,
                persistence_errors: usize::from(!committed),
            };
        }

        match self.extract(&item).await {
            Ok(record) => self.commit(index, &item, record),
            Err((error, attempts)) => {
                tracing::warn!(
                    "[{}] {} failed after {} attempt(s): {}",
                    self.stage,
                    item.url,
                    attempts,
                    error
                );
                let committed = self.mark(&item.url, VisitedOutcome::Failure);
                Completion {
                    index,
                    outcome: ItemOutcome::Failed(ItemFailure {
                        id: item.record_id(),
                        url: item.url.clone(),
                        kind: error.kind().to_string(),
                        message: error.message().to_string(),
                        attempts,
                    }),
                    committed,
                    persistence_errors: usize::from(!committed),
                }
            }
        }
    }

    fn already_visited(&self, url: &str) -> bool {
        if self.force {
            return false;
        }
        match self.ledger.outcome(&self.url_class, url) {
            Some(VisitedOutcome::Failure) => !self.retry_failed,
            Some(_) => true,
            None => false,
        }
    }

    /// Calls the extractor, retrying transient errors
    ///
    /// Every attempt waits on the rate limiter first.
    async fn extract(&self, item: &WorkItem) -> Result<Record, (ExtractionError, u32)> {
        let extractor = self.registry.select(&item.url);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.limiter.wait().await;
            tracing::debug!(
                "[{}] {} via {} (attempt {})",
                self.stage,
                item.url,
                extractor.name(),
                attempt
            );

            match extractor.process(item).await {
                Ok(record) => return Ok(record),
                Err(e) if e.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.backoff(attempt);
                    tracing::debug!(
                        "[{}] transient error on {}: {}; retrying in {:?}",
                        self.stage,
                        item.url,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }

    /// Record append, then ledger mark
    fn commit(&self, index: usize, item: &WorkItem, record: Record) -> Completion {
        let id = record.id.clone();
        if let Err(e) = self.store.append(record) {
            tracing::error!("[{}] failed to save record {}: {}", self.stage, id, e);
            return Completion {
                index,
                outcome: ItemOutcome::Succeeded,
                committed: false,
                persistence_errors: 1,
            };
        }

        let committed = self.mark(&item.url, VisitedOutcome::Success);
        tracing::debug!("[{}] saved {}", self.stage, id);
        Completion {
            index,
            outcome: ItemOutcome::Succeeded,
            committed,
            persistence_errors: usize::from(!committed),
        }
    }

    fn mark(&self, url: &str, outcome: VisitedOutcome) -> bool {
        match self.ledger.mark_visited(&self.url_class, url, outcome) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    "[{}] failed to mark {} as {}: {}",
                    self.stage,
                    url,
                    outcome,
                    e
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Extractor;
    use crate::pipeline::InputSource;
    use crate::state::FlushPolicy;
    use async_trait::async_trait;
    use crate::config::UserAgentConfig;
    use crate::crawler::{build_http_client, PageFetcher};
    use crate::extract::CareersExtractor;
    use crate::state::CheckpointState;
    use reqwest::Client;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    /// Returns a record per item and counts calls per URL
    #[derive(Default)]
    struct CountingExtractor {
        calls: StdMutex<HashMap<String, u32>>,
    }

    impl CountingExtractor {
        fn calls(&self, url: &str) -> u32 {
            self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
        }

        fn total(&self) -> u32 {
            self.calls.lock().unwrap().values().sum()
        }
    }

    #[async_trait]
    impl Extractor for CountingExtractor {
        fn name(&self) -> &str {
            "counting"
        }

        async fn process(&self, item: &WorkItem) -> Result<Record, ExtractionError> {
            *self.calls.lock().unwrap().entry(item.url.clone()).or_insert(0) += 1;
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok(Record::for_item(item).with("seen", true))
        }
    }

    /// Fails with the given error a fixed number of times, then succeeds
    struct FlakyExtractor {
        failures: u32,
        error: ExtractionError,
        calls: StdMutex<u32>,
    }

    #[async_trait]
    impl Extractor for FlakyExtractor {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn process(&self, item: &WorkItem) -> Result<Record, ExtractionError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls <= self.failures {
                return Err(self.error.clone());
            }
            Ok(Record::for_item(item))
        }
    }

    /// Fetches the item's page and records nothing else
    struct PageExtractor {
        fetcher: PageFetcher,
    }

    #[async_trait]
    impl Extractor for PageExtractor {
        fn name(&self) -> &str {
            "page"
        }

        async fn process(&self, item: &WorkItem) -> Result<Record, ExtractionError> {
            let page = self.fetcher.fetch(&item.url).await?;
            Ok(Record::for_item(item).with("length", page.body.len()))
        }
    }

    /// Notes the on-disk checkpoint cursor and ledger size as each item
    /// starts, i.e. what a crash at that moment would leave behind
    struct DiskObserver {
        dir: PathBuf,
        seen: StdMutex<Vec<(usize, usize)>>,
    }

    #[async_trait]
    impl Extractor for DiskObserver {
        fn name(&self) -> &str {
            "disk-observer"
        }

        async fn process(&self, item: &WorkItem) -> Result<Record, ExtractionError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let cursor = match Checkpoint::load(Checkpoint::path_in(&self.dir)).state() {
                CheckpointState::InStage { cursor, .. } => *cursor,
                _ => 0,
            };
            let marks = VisitedLedger::new(&self.dir, FlushPolicy::default()).len("customer");
            self.seen.lock().unwrap().push((cursor, marks));
            Ok(Record::for_item(item))
        }
    }

    fn gate(limiter: Arc<RateLimiter>) -> Arc<RobotsGate> {
        Arc::new(RobotsGate::new(Client::new(), limiter, "TestHarvester"))
    }

    fn page_fetcher(limiter: Arc<RateLimiter>, robots: Arc<RobotsGate>) -> PageFetcher {
        let ua = UserAgentConfig {
            crawler_name: "TestHarvester".to_string(),
            crawler_version: "1.0".to_string(),
            contact_url: "https://example.com/about".to_string(),
            contact_email: "admin@example.com".to_string(),
        };
        let client = build_http_client(&ua, Duration::from_secs(5)).unwrap();
        PageFetcher::new(client, limiter, robots)
    }

    fn html(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/html")
            .set_body_raw(body.to_string(), "text/html")
    }

    struct Harness {
        _dir: tempfile::TempDir,
        server: MockServer,
        store: Arc<RecordStore>,
        ledger: Arc<VisitedLedger>,
        checkpoint: Checkpoint,
        shutdown: Shutdown,
    }

    impl Harness {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let server = MockServer::start().await;
            let store = Arc::new(RecordStore::open(dir.path().join("details.json")).unwrap());
            let ledger = Arc::new(VisitedLedger::new(dir.path(), FlushPolicy::default()));
            let mut checkpoint = Checkpoint::fresh(
                Checkpoint::path_in(dir.path()),
                Default::default(),
            );
            checkpoint.begin_stage("details", 0).unwrap();
            Self {
                _dir: dir,
                server,
                store,
                ledger,
                checkpoint,
                shutdown: Shutdown::new(),
            }
        }

        fn runner(&self) -> StageRunner {
            let limiter = Arc::new(RateLimiter::disabled());
            self.runner_with(Arc::clone(&limiter), gate(limiter))
        }

        /// A runner sharing `limiter` and `robots` with extractors under test
        fn runner_with(&self, limiter: Arc<RateLimiter>, robots: Arc<RobotsGate>) -> StageRunner {
            StageRunner::new(limiter, robots, Arc::clone(&self.ledger), self.shutdown.clone())
                .with_workers(4)
                .with_retry(
                    RetryPolicy::default()
                        .with_base(Duration::from_millis(1))
                        .with_max_backoff(Duration::from_millis(5)),
                )
        }

        fn items(&self, n: usize) -> Vec<WorkItem> {
            (0..n)
                .map(|i| WorkItem::new(format!("{}/customer/{}", self.server.uri(), i)))
                .collect()
        }

        async fn run(
            &mut self,
            runner: &StageRunner,
            extractor: Arc<dyn Extractor>,
            items: Vec<WorkItem>,
            start: usize,
        ) -> StageReport {
            let stage = StageDescriptor::new(
                "details",
                "customer",
                InputSource::Seed,
                ExtractorRegistry::new(extractor),
            );
            runner
                .run(&stage, Arc::clone(&self.store), items, start, &mut self.checkpoint)
                .await
        }
    }

    #[tokio::test]
    async fn test_processes_every_item_once() {
        let mut h = Harness::new().await;
        let extractor = Arc::new(CountingExtractor::default());
        let items = h.items(20);

        let report = h.run(&h.runner(), extractor.clone(), items, 0).await;

        assert_eq!(report.succeeded, 20);
        assert_eq!(report.cursor, 20);
        assert!(!report.interrupted);
        assert_eq!(h.store.len(), 20);
        assert_eq!(extractor.total(), 20);
        assert_eq!(h.ledger.len("customer"), 20);
        assert_eq!(
            h.checkpoint.state(),
            &crate::state::CheckpointState::InStage {
                stage: "details".to_string(),
                cursor: 20
            }
        );
    }

    #[tokio::test]
    async fn test_duplicate_items_commit_once() {
        let mut h = Harness::new().await;
        let extractor = Arc::new(CountingExtractor::default());
        let url = format!("{}/customer/same", h.server.uri());
        let items: Vec<_> = (0..8).map(|_| WorkItem::new(url.clone())).collect();

        let report = h.run(&h.runner(), extractor.clone(), items, 0).await;

        assert_eq!(h.store.len(), 1);
        assert_eq!(report.finished(), 8);
        assert!(report.succeeded >= 1);
    }

    #[tokio::test]
    async fn test_visited_items_are_skipped() {
        let mut h = Harness::new().await;
        let extractor = Arc::new(CountingExtractor::default());
        let items = h.items(5);

        let runner = h.runner();
        h.run(&runner, extractor.clone(), items.clone(), 0).await;
        let second = h.run(&runner, extractor.clone(), items.clone(), 0).await;

        assert_eq!(second.skipped, 5);
        assert_eq!(second.succeeded, 0);
        assert_eq!(extractor.total(), 5);

        let forced = h.run(&runner.clone().with_force(true), extractor.clone(), items, 0).await;
        assert_eq!(forced.succeeded, 5);
        assert_eq!(extractor.total(), 10);
    }

    #[tokio::test]
    async fn test_start_cursor_skips_earlier_items() {
        let mut h = Harness::new().await;
        let extractor = Arc::new(CountingExtractor::default());
        let items = h.items(10);
        let first = items[0].url.clone();
        let last = items[9].url.clone();

        let report = h.run(&h.runner(), extractor.clone(), items, 6).await;

        assert_eq!(report.total, 4);
        assert_eq!(report.succeeded, 4);
        assert_eq!(extractor.calls(&first), 0);
        assert_eq!(extractor.calls(&last), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let mut h = Harness::new().await;
        let extractor = Arc::new(FlakyExtractor {
            failures: 2,
            error: ExtractionError::Transient("HTTP 503".into()),
            calls: StdMutex::new(0),
        });
        let items = h.items(1);

        let report = h.run(&h.runner().with_workers(1), extractor.clone(), items, 0).await;

        assert_eq!(report.succeeded, 1);
        assert_eq!(*extractor.calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let mut h = Harness::new().await;
        let extractor = Arc::new(FlakyExtractor {
            failures: u32::MAX,
            error: ExtractionError::Transient("timeout".into()),
            calls: StdMutex::new(0),
        });
        let items = h.items(1);
        let url = items[0].url.clone();

        let report = h.run(&h.runner().with_workers(1), extractor.clone(), items, 0).await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].attempts, 3);
        assert_eq!(report.failures[0].kind, "transient");
        assert!(h.store.is_empty());
        assert_eq!(h.ledger.outcome("customer", &url), Some(VisitedOutcome::Failure));
        // a failed item still moves the cursor
        assert_eq!(report.cursor, 1);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let mut h = Harness::new().await;
        let extractor = Arc::new(FlakyExtractor {
            failures: u32::MAX,
            error: ExtractionError::Permanent("HTTP 404".into()),
            calls: StdMutex::new(0),
        });
        let items = h.items(1);

        let report = h.run(&h.runner(), extractor.clone(), items, 0).await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].attempts, 1);
        assert_eq!(report.failures[0].message, "HTTP 404");
        assert_eq!(*extractor.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retry_failed_reprocesses_failures() {
        let mut h = Harness::new().await;
        let items = h.items(1);
        let failing = Arc::new(FlakyExtractor {
            failures: 1,
            error: ExtractionError::Permanent("HTTP 404".into()),
            calls: StdMutex::new(0),
        });

        let runner = h.runner();
        h.run(&runner, failing.clone(), items.clone(), 0).await;
        let again = h.run(&runner, failing.clone(), items.clone(), 0).await;
        assert_eq!(again.skipped, 1);

        let retried = h
            .run(&runner.clone().with_retry_failed(true), failing.clone(), items, 0)
            .await;
        assert_eq!(retried.succeeded, 1);
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test]
    async fn test_robots_denial_is_marked_skipped() {
        let mut h = Harness::new().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /customer/1\n"),
            )
            .mount(&h.server)
            .await;
        let extractor = Arc::new(CountingExtractor::default());
        let items = h.items(3);
        let denied_url = items[1].url.clone();

        let report = h.run(&h.runner(), extractor.clone(), items, 0).await;

        assert_eq!(report.denied, 1);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(extractor.calls(&denied_url), 0);
        assert_eq!(
            h.ledger.outcome("customer", &denied_url),
            Some(VisitedOutcome::Skipped)
        );
    }

    #[tokio::test]
    async fn test_shutdown_before_start_processes_nothing() {
        let mut h = Harness::new().await;
        let extractor = Arc::new(CountingExtractor::default());
        let items = h.items(10);
        h.shutdown.trigger();

        let report = h.run(&h.runner(), extractor.clone(), items, 0).await;

        assert!(report.interrupted);
        assert_eq!(report.cursor, 0);
        assert_eq!(extractor.total(), 0);
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_empty_stage() {
        let mut h = Harness::new().await;
        let report = h
            .run(&h.runner(), Arc::new(CountingExtractor::default()), Vec::new(), 0)
            .await;
        assert_eq!(report.total, 0);
        assert!(!report.interrupted);
    }

    #[tokio::test]
    async fn test_checkpoint_never_runs_ahead_of_batched_ledger() {
        let mut h = Harness::new().await;
        let dir = h._dir.path().to_path_buf();
        h.ledger = Arc::new(VisitedLedger::new(
            &dir,
            FlushPolicy {
                every: 5,
                interval: Duration::from_secs(3600),
            },
        ));
        let observer = Arc::new(DiskObserver {
            dir: dir.clone(),
            seen: StdMutex::new(Vec::new()),
        });
        let items = h.items(12);

        let report = h.run(&h.runner().with_workers(1), observer.clone(), items, 0).await;
        assert_eq!(report.succeeded, 12);

        let seen = observer.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 12);
        for (cursor, marks) in &seen {
            assert!(cursor <= marks, "checkpoint at {} with {} marks on disk", cursor, marks);
        }
        assert!(seen.iter().any(|(cursor, _)| *cursor > 0));

        // the stage-end flush lets the cursor reach the end
        assert_eq!(
            Checkpoint::load(Checkpoint::path_in(&dir)).state(),
            &CheckpointState::InStage {
                stage: "details".to_string(),
                cursor: 12
            }
        );
        assert_eq!(VisitedLedger::new(&dir, FlushPolicy::default()).len("customer"), 12);
    }

    #[tokio::test]
    async fn test_extractor_followups_are_gated_by_robots() {
        let mut h = Harness::new().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /careers\n"))
            .expect(1)
            .mount(&h.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(html(r#"<a href="/about">About</a><a href="/careers">Careers</a>"#))
            .mount(&h.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/careers"))
            .respond_with(html(r#"<div class="job"><a href="/jobs/1">Engineer</a></div>"#))
            .expect(0)
            .mount(&h.server)
            .await;

        let limiter = Arc::new(RateLimiter::disabled());
        let robots = gate(Arc::clone(&limiter));
        let careers = CareersExtractor::new(page_fetcher(Arc::clone(&limiter), Arc::clone(&robots)))
            .unwrap();
        let runner = h.runner_with(limiter, robots);
        let items = vec![WorkItem::new(format!("{}/", h.server.uri()))];

        let report = h.run(&runner, Arc::new(careers), items, 0).await;

        assert_eq!(report.succeeded, 1);
        let requested: Vec<String> = h
            .server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| r.url.path().to_string())
            .collect();
        assert!(!requested.contains(&"/careers".to_string()), "{:?}", requested);
        assert_eq!(h.store.get_all()[0].get("career_url"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_robots_fetch_is_rate_limited_like_pages() {
        let mut h = Harness::new().await;
        let arrivals = Arc::new(StdMutex::new(Vec::<Instant>::new()));
        let stamp = {
            let arrivals = Arc::clone(&arrivals);
            move |request: &Request| {
                arrivals.lock().unwrap().push(Instant::now());
                if request.url.path() == "/robots.txt" {
                    ResponseTemplate::new(200).set_body_string("User-agent: *\nAllow: /\n")
                } else {
                    html("<p>page</p>")
                }
            }
        };
        Mock::given(method("GET")).respond_with(stamp).mount(&h.server).await;

        let interval = Duration::from_millis(100);
        let limiter = Arc::new(RateLimiter::new(interval));
        let robots = gate(Arc::clone(&limiter));
        let extractor = PageExtractor {
            fetcher: page_fetcher(Arc::clone(&limiter), Arc::clone(&robots)),
        };
        let runner = h.runner_with(limiter, robots).with_workers(3);
        let items = h.items(4);

        let report = h.run(&runner, Arc::new(extractor), items, 0).await;
        assert_eq!(report.succeeded, 4);

        let mut arrivals = arrivals.lock().unwrap().clone();
        arrivals.sort();
        // robots.txt plus four pages
        assert_eq!(arrivals.len(), 5);
        for pair in arrivals.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= interval - Duration::from_millis(25), "gap of {:?}", gap);
        }
    }
}
