//! Stage descriptors and work item expansion
//!
//! A stage reads its work items either from the run's seeds or from a field
//! of the previous stage's records. A field expands as follows:
//!
//! | Field value | Work items |
//! |-------------|------------|
//! | string | one item for that URL |
//! | array of strings | one item per string |
//! | array of objects | one item per object with a `url` or `link`; the other keys become the item's context |
//! | anything else | none |
//!
//! Items are de-duplicated by canonical URL, keeping the first occurrence, and
//! carry the source record's id as their parent.

use crate::config::SeedEntry;
use crate::extract::{ExtractorRegistry, Record, WorkItem};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a stage's work items come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// The run's seed entries
    Seed,
    /// `field` of every record in the output of stage `name`
    Stage { name: String, field: String },
}

impl InputSource {
    pub fn stage(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Stage {
            name: name.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seed => f.write_str("seeds"),
            Self::Stage { name, field } => write!(f, "{}.{}", name, field),
        }
    }
}

/// One stage of a pipeline
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    pub name: String,
    /// Ledger the stage's URLs are recorded in (`visited_<class>.json`)
    pub url_class: String,
    pub input: InputSource,
    pub registry: Arc<ExtractorRegistry>,
    /// Trust the existing output instead of running the stage
    pub skip: bool,
    /// Minimum number of items the stage's output must yield (0 disables)
    pub min_expected: usize,
}

impl StageDescriptor {
    pub fn new(
        name: impl Into<String>,
        url_class: impl Into<String>,
        input: InputSource,
        registry: ExtractorRegistry,
    ) -> Self {
        Self {
            name: name.into(),
            url_class: url_class.into(),
            input,
            registry: Arc::new(registry),
            skip: false,
            min_expected: 0,
        }
    }

    #[must_use]
    pub fn with_skip(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }

    #[must_use]
    pub fn with_min_expected(mut self, min_expected: usize) -> Self {
        self.min_expected = min_expected;
        self
    }

    /// Path of the stage's record store inside `data_dir`
    pub fn output_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(format!("{}.json", self.name))
    }
}

/// Work items for a seed stage
pub fn seed_items(seeds: &[SeedEntry]) -> Vec<WorkItem> {
    dedup_items(
        seeds
            .iter()
            .filter(|seed| !seed.url.trim().is_empty())
            .map(|seed| WorkItem::new(seed.url.trim()).with_context(seed.fields.clone()))
            .collect(),
    )
}

/// Work items obtained by expanding `field` of every record
pub fn expand_records(records: &[Record], field: &str) -> Vec<WorkItem> {
    let mut items = Vec::new();
    for record in records {
        let Some(value) = record.get(field) else {
            continue;
        };
        match value {
            Value::String(url) => push_url(&mut items, url, record, Map::new()),
            Value::Array(elements) => {
                for element in elements {
                    match element {
                        Value::String(url) => push_url(&mut items, url, record, Map::new()),
                        Value::Object(object) => {
                            let url = ["url", "link"]
                                .iter()
                                .find_map(|key| object.get(*key).and_then(Value::as_str));
                            if let Some(url) = url {
                                let context = object
                                    .iter()
                                    .filter(|(key, _)| key.as_str() != "url" && key.as_str() != "link")
                                    .map(|(key, value)| (key.clone(), value.clone()))
                                    .collect();
                                push_url(&mut items, url, record, context);
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    dedup_items(items)
}

fn push_url(items: &mut Vec<WorkItem>, url: &str, parent: &Record, context: Map<String, Value>) {
    let url = url.trim();
    if url.is_empty() {
        return;
    }
    items.push(
        WorkItem::new(url)
            .with_parent(parent.id.clone())
            .with_context(context),
    );
}

/// Drops items whose canonical URL was already seen
pub fn dedup_items(items: Vec<WorkItem>) -> Vec<WorkItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.record_id()))
        .collect()
}
