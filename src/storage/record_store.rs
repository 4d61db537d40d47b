//! Durable stage output
//!
//! A [`RecordStore`] is the output of one stage, persisted as a JSON object
//! mapping record identifiers to their fields. Appends merge by identifier and
//! rewrite the file atomically, so a store left behind by an interrupted run
//! is valid input for the next run.

use crate::extract::Record;
use crate::storage::{read_json, write_json_atomic, StorageError, StorageResult};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

type Fields = Map<String, Value>;

/// Identifier-keyed record collection backed by one JSON file
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, Fields>>,
}

impl RecordStore {
    /// Opens the store at `path`, loading any records a previous run left
    ///
    /// A missing file is an empty store. A file that exists but cannot be
    /// parsed is an error: treating it as empty would overwrite that output
    /// on the first append.
    ///
    /// Besides the native `{id: fields}` object, a JSON array of objects is
    /// accepted; each element is keyed by its `id`, `url` or `link` field.
    pub fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let records = match read_json::<Value>(&path)? {
            None => BTreeMap::new(),
            Some(value) => parse_records(&path, value)?,
        };

        tracing::debug!("Opened record store {} ({} records)", path.display(), records.len());

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merges `record` into the store and persists the store
    ///
    /// New fields overwrite existing ones for the same identifier; other
    /// identifiers are untouched. If the write fails the in-memory state is
    /// rolled back, so the store never reports a record that is not on disk.
    pub fn append(&self, record: Record) -> StorageResult<()> {
        let mut records = self.lock();

        let previous = records.get(&record.id).cloned();
        records
            .entry(record.id.clone())
            .or_default()
            .extend(record.fields);

        if let Err(e) = write_json_atomic(&self.path, &*records) {
            match previous {
                Some(fields) => {
                    records.insert(record.id, fields);
                }
                None => {
                    records.remove(&record.id);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// All records ordered by identifier
    pub fn get_all(&self) -> Vec<Record> {
        self.lock()
            .iter()
            .map(|(id, fields)| Record {
                id: id.clone(),
                fields: fields.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Fields>> {
        // The map is only mutated in `append`, which restores it on failure
        // before returning; a panic elsewhere cannot leave it half-updated.
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn parse_records(path: &Path, value: Value) -> StorageResult<BTreeMap<String, Fields>> {
    let corrupt = |message: &str| StorageError::Corrupt {
        path: path.display().to_string(),
        message: message.to_string(),
    };

    match value {
        Value::Object(map) => map
            .into_iter()
            .map(|(id, fields)| match fields {
                Value::Object(fields) => Ok((id, fields)),
                _ => Err(corrupt("record fields must be a JSON object")),
            })
            .collect(),
        Value::Array(items) => {
            let mut records = BTreeMap::new();
            for item in items {
                let Value::Object(fields) = item else {
                    return Err(corrupt("array elements must be JSON objects"));
                };
                let id = ["id", "url", "link"]
                    .iter()
                    .find_map(|key| fields.get(*key).and_then(Value::as_str))
                    .ok_or_else(|| corrupt("array element without id, url or link"))?
                    .to_string();
                records.entry(id).or_insert_with(Map::new).extend(fields);
            }
            Ok(records)
        }
        _ => Err(corrupt("expected a JSON object or array")),
    }
}
