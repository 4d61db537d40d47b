//! Extractor contract and the work/record data model
//!
//! A stage hands each [`WorkItem`] to an [`Extractor`] chosen by the stage's
//! [`ExtractorRegistry`]. The extractor fetches and parses the page and returns
//! a [`Record`], or an [`ExtractionError`] saying whether a retry could help.

mod careers;
mod detail;
mod html;
mod jobs;
mod listing;
mod registry;

pub use careers::{CareersExtractor, JobLink};
pub use detail::{parse_detail, CustomerDetail, CustomerDetailExtractor};
pub use html::{clean_text, select_attr, select_first_text, select_texts};
pub use jobs::{job_registry, GenericJobExtractor, JobPlatform, JobPosting, PlatformJobExtractor};
pub use listing::{parse_listing, CustomerEntry, CustomerListingExtractor, MAX_LISTING_PAGES};
pub use registry::ExtractorRegistry;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// A unit of work for one stage: a URL plus what the previous stage knew about it
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub url: String,
    /// Identifier of the record this item was expanded from
    pub parent_id: Option<String>,
    /// Fields carried over from the parent record (or seed entry)
    pub context: Map<String, Value>,
}

impl WorkItem {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            parent_id: None,
            context: Map::new(),
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Stable identifier of the record produced from this item
    ///
    /// This is the canonical form of the URL, falling back to the raw string
    /// for URLs that do not normalize.
    pub fn record_id(&self) -> String {
        crate::url::normalize_url(&self.url)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| self.url.trim().to_string())
    }
}

/// A scraped record: an identifier plus a JSON object of fields
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Starts a record for `item`, seeded with the item's context, its URL and
    /// its parent identifier
    pub fn for_item(item: &WorkItem) -> Self {
        let mut record = Self::new(item.record_id());
        record.fields = item.context.clone();
        record.set("url", item.url.clone());
        if let Some(parent) = &item.parent_id {
            record.set("parent_id", parent.clone());
        }
        record
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    /// Sets `key` only when `value` is present
    pub fn set_opt(&mut self, key: &str, value: Option<String>) {
        if let Some(value) = value {
            self.set(key, value);
        }
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

/// Why an extractor could not produce a record
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    /// Timeouts, connection failures, 5xx and 429 responses
    #[error("transient: {0}")]
    Transient(String),

    /// Other 4xx responses, non-HTML content, empty or unparseable pages
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ExtractionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }
}

/// Fetches and parses one page family
///
/// The stage runner has already checked robots.txt and waited on the rate
/// limiter once before calling [`Extractor::process`]; any additional request
/// an extractor makes must go through
/// [`crate::crawler::PageFetcher::fetch_followup`] so it is checked and
/// throttled too.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Short name used in logs and failure reports
    fn name(&self) -> &str;

    async fn process(&self, item: &WorkItem) -> Result<Record, ExtractionError>;
}
