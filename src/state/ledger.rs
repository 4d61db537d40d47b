//! Durable per-URL-class visit ledgers
//!
//! Each URL class (`customer`, `job`, ...) has its own `visited_<class>.json`
//! in the data directory, loaded into memory on first use. Marks are flushed
//! according to a [`FlushPolicy`]; [`VisitedLedger::flush_all`] forces every
//! dirty ledger to disk at stage end and on interrupt.

use crate::storage::{read_json, write_json_atomic, StorageError, StorageResult};
use crate::url::normalize_url;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// What happened the last time a URL was processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisitedOutcome {
    Success,
    Failure,
    /// Denied by robots.txt
    Skipped,
}

impl VisitedOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for VisitedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitedEntry {
    /// RFC 3339 time of the mark
    pub timestamp: String,
    pub outcome: VisitedOutcome,
}

/// On-disk shape of a ledger file
#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    urls: BTreeMap<String, VisitedEntry>,
    #[serde(default)]
    last_updated: Option<String>,
}

/// When dirty ledgers are written back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Flush after this many unflushed marks
    pub every: usize,
    /// Flush on the next mark once this much time passed since the last flush
    pub interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            every: 1,
            interval: Duration::from_secs(5),
        }
    }
}

struct ClassLedger {
    path: PathBuf,
    file: LedgerFile,
    unflushed: usize,
    last_flush: Instant,
}

impl ClassLedger {
    fn load(path: PathBuf) -> Self {
        let file = match read_json::<LedgerFile>(&path) {
            Ok(Some(file)) => file,
            Ok(None) => LedgerFile::default(),
            Err(e) => {
                tracing::warn!("Ignoring unreadable ledger {}: {}", path.display(), e);
                LedgerFile::default()
            }
        };
        Self {
            path,
            file,
            unflushed: 0,
            last_flush: Instant::now(),
        }
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file.last_updated = Some(Utc::now().to_rfc3339());
        write_json_atomic(&self.path, &self.file)?;
        self.unflushed = 0;
        self.last_flush = Instant::now();
        Ok(())
    }
}

/// Visit ledgers for every URL class of a run
pub struct VisitedLedger {
    dir: PathBuf,
    policy: FlushPolicy,
    classes: Mutex<HashMap<String, ClassLedger>>,
}

impl fmt::Debug for VisitedLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisitedLedger")
            .field("dir", &self.dir)
            .field("policy", &self.policy)
            .finish()
    }
}

impl VisitedLedger {
    pub fn new(dir: impl Into<PathBuf>, policy: FlushPolicy) -> Self {
        Self {
            dir: dir.into(),
            policy,
            classes: Mutex::new(HashMap::new()),
        }
    }

    /// Path of the ledger file for `url_class`
    pub fn path_for(dir: &Path, url_class: &str) -> PathBuf {
        dir.join(format!("visited_{}.json", url_class))
    }

    /// True if `url` has any entry (success, failure or skipped)
    pub fn is_visited(&self, url_class: &str, url: &str) -> bool {
        self.outcome(url_class, url).is_some()
    }

    /// The recorded outcome for `url`, if any
    pub fn outcome(&self, url_class: &str, url: &str) -> Option<VisitedOutcome> {
        let key = ledger_key(url);
        let mut classes = self.lock();
        self.class(&mut classes, url_class)
            .file
            .urls
            .get(&key)
            .map(|entry| entry.outcome)
    }

    /// Records an outcome for `url`, flushing if the policy says so
    ///
    /// A `success` entry is never downgraded: a forced re-run that fails
    /// leaves the earlier success in place. An error means the mark is held
    /// in memory but not yet durable; it is retried on the next flush.
    pub fn mark_visited(
        &self,
        url_class: &str,
        url: &str,
        outcome: VisitedOutcome,
    ) -> StorageResult<()> {
        let key = ledger_key(url);
        let mut classes = self.lock();
        let ledger = self.class(&mut classes, url_class);

        let keep_existing = matches!(
            ledger.file.urls.get(&key),
            Some(VisitedEntry { outcome: VisitedOutcome::Success, .. })
        ) && outcome != VisitedOutcome::Success;

        if !keep_existing {
            ledger.file.urls.insert(
                key,
                VisitedEntry {
                    timestamp: Utc::now().to_rfc3339(),
                    outcome,
                },
            );
            ledger.unflushed += 1;
        }

        if ledger.unflushed > 0
            && (ledger.unflushed >= self.policy.every
                || ledger.last_flush.elapsed() >= self.policy.interval)
        {
            ledger.flush()?;
        }
        Ok(())
    }

    /// Writes every ledger with unflushed marks
    ///
    /// All ledgers are attempted; the first error is returned.
    pub fn flush_all(&self) -> StorageResult<()> {
        self.flush_where(|_| true)
    }

    /// Writes the ledgers whose oldest unflushed mark has waited longer than
    /// the policy interval
    ///
    /// Marks only trigger a flush when they are recorded, so a stage that
    /// stalls between items calls this periodically.
    pub fn flush_due(&self) -> StorageResult<()> {
        let interval = self.policy.interval;
        self.flush_where(|ledger| ledger.last_flush.elapsed() >= interval)
    }

    /// Marks recorded for `url_class` that are not yet on disk
    pub fn unflushed(&self, url_class: &str) -> usize {
        let mut classes = self.lock();
        self.class(&mut classes, url_class).unflushed
    }

    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }

    fn flush_where(&self, due: impl Fn(&ClassLedger) -> bool) -> StorageResult<()> {
        let mut classes = self.lock();
        let mut first_error: Option<StorageError> = None;

        for (class, ledger) in classes.iter_mut() {
            if ledger.unflushed == 0 || !due(ledger) {
                continue;
            }
            if let Err(e) = ledger.flush() {
                tracing::error!("Failed to flush ledger '{}': {}", class, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of entries in a class ledger
    pub fn len(&self, url_class: &str) -> usize {
        let mut classes = self.lock();
        self.class(&mut classes, url_class).file.urls.len()
    }

    /// Counts entries per outcome for a class ledger
    pub fn outcome_counts(&self, url_class: &str) -> BTreeMap<VisitedOutcome, usize> {
        let mut classes = self.lock();
        let mut counts = BTreeMap::new();
        for entry in self.class(&mut classes, url_class).file.urls.values() {
            *counts.entry(entry.outcome).or_insert(0) += 1;
        }
        counts
    }

    fn class<'a>(
        &self,
        classes: &'a mut MutexGuard<'_, HashMap<String, ClassLedger>>,
        url_class: &str,
    ) -> &'a mut ClassLedger {
        classes
            .entry(url_class.to_string())
            .or_insert_with(|| ClassLedger::load(Self::path_for(&self.dir, url_class)))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ClassLedger>> {
        self.classes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Canonical ledger key for a URL
fn ledger_key(url: &str) -> String {
    normalize_url(url)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| url.trim().to_string())
}
