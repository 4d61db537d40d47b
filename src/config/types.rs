use serde::Deserialize;

/// Main configuration structure for Stage-Harvest
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub crawler: CrawlerConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub stages: StagesConfig,
    #[serde(default)]
    pub seed: Vec<SeedEntry>,
}

/// Crawler behavior configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlerConfig {
    /// Minimum spacing between any two outbound requests (seconds, 0 disables)
    #[serde(rename = "rate-limit-seconds", default = "default_rate_limit")]
    pub rate_limit_seconds: f64,

    /// Number of concurrent workers per stage
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Cap on work items attempted per stage (dry runs); absent means unlimited
    #[serde(rename = "item-limit", default)]
    pub item_limit: Option<usize>,

    /// Minimum number of items the seed stage must yield (0 disables the check)
    #[serde(rename = "min-expected", default)]
    pub min_expected: usize,

    /// Attempts per item for transient failures, including the first one
    #[serde(rename = "max-attempts", default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff (milliseconds)
    #[serde(rename = "backoff-base-ms", default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Upper bound on a single backoff delay (milliseconds)
    #[serde(rename = "max-backoff-ms", default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Per-request timeout used by the HTTP fetcher (seconds)
    #[serde(rename = "request-timeout-secs", default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            rate_limit_seconds: default_rate_limit(),
            workers: default_workers(),
            item_limit: None,
            min_expected: 0,
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            max_backoff_ms: default_max_backoff(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    /// Name of the crawler
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the crawler
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for crawler-related contact
    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

impl UserAgentConfig {
    /// Formats the full user agent string: `Name/Version (+ContactURL; ContactEmail)`
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}

/// Locations of persisted state and the ledger flush policy
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding stage outputs, ledgers, checkpoint and journal
    #[serde(rename = "data-dir", default = "default_data_dir")]
    pub data_dir: String,

    /// Directory receiving per-run log files
    #[serde(rename = "log-dir", default = "default_log_dir")]
    pub log_dir: String,

    /// Optional JSON seed file merged with the `[[seed]]` entries
    #[serde(rename = "seed-file", default)]
    pub seed_file: Option<String>,

    /// Flush a ledger after this many marks (1 = every mark)
    #[serde(rename = "ledger-flush-every", default = "default_flush_every")]
    pub ledger_flush_every: usize,

    /// Flush a dirty ledger once this many seconds passed since its last flush
    #[serde(rename = "ledger-flush-interval-secs", default = "default_flush_interval")]
    pub ledger_flush_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_dir: default_log_dir(),
            seed_file: None,
            ledger_flush_every: default_flush_every(),
            ledger_flush_interval_secs: default_flush_interval(),
        }
    }
}

/// Per-stage switches
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StagesConfig {
    /// Names of stages whose existing output is trusted instead of re-running them
    #[serde(default)]
    pub skip: Vec<String>,
}

/// A seed URL plus optional context fields carried into the seed work item
#[derive(Debug, Clone, Deserialize)]
pub struct SeedEntry {
    pub url: String,

    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

fn default_rate_limit() -> f64 {
    3.0
}

fn default_workers() -> usize {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    1000
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_flush_every() -> usize {
    1
}

fn default_flush_interval() -> u64 {
    5
}
