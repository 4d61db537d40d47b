use crate::config::types::SeedEntry;
use crate::ConfigError;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;

/// Loads seed entries from a JSON seed file
///
/// Accepted shapes:
///
/// * `["https://...", ...]`
/// * `[{"url": "https://...", "name": "..."}, ...]` (`link` is accepted in place of `url`)
/// * `{"<any key>": [{"url": ...}, ...], ...}`
///
/// Non-URL keys of an object become the seed's context fields.
pub fn load_seed_file(path: &Path) -> Result<Vec<SeedEntry>, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&content)
        .map_err(|e| ConfigError::Seed(format!("{}: {}", path.display(), e)))?;
    parse_seed_value(&value)
}

/// Extracts seed entries from an already-parsed JSON value
pub fn parse_seed_value(value: &Value) -> Result<Vec<SeedEntry>, ConfigError> {
    match value {
        Value::Array(items) => items.iter().map(seed_from_item).collect(),
        Value::Object(groups) => {
            let mut seeds = Vec::new();
            for (key, group) in groups {
                let Value::Array(items) = group else {
                    continue;
                };
                for item in items {
                    seeds.push(seed_from_item(item).map_err(|e| {
                        ConfigError::Seed(format!("in group '{}': {}", key, e))
                    })?);
                }
            }
            Ok(seeds)
        }
        _ => Err(ConfigError::Seed(
            "expected a JSON array or object of arrays".to_string(),
        )),
    }
}

fn seed_from_item(item: &Value) -> Result<SeedEntry, ConfigError> {
    match item {
        Value::String(url) => Ok(SeedEntry {
            url: url.clone(),
            fields: Map::new(),
        }),
        Value::Object(obj) => {
            let url = obj
                .get("url")
                .or_else(|| obj.get("link"))
                .and_then(Value::as_str)
                .ok_or_else(|| ConfigError::Seed("seed object without 'url' or 'link'".to_string()))?
                .to_string();

            let fields = obj
                .iter()
                .filter(|(k, _)| k.as_str() != "url" && k.as_str() != "link")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            Ok(SeedEntry { url, fields })
        }
        other => Err(ConfigError::Seed(format!(
            "unsupported seed entry: {}",
            other
        ))),
    }
}

/// Combines config seeds with seed-file seeds, keeping the first entry per URL
pub fn merge_seeds(inline: &[SeedEntry], from_file: Vec<SeedEntry>) -> Vec<SeedEntry> {
    let mut seen = HashSet::new();
    inline
        .iter()
        .cloned()
        .chain(from_file)
        .filter(|seed| seen.insert(seed.url.clone()))
        .collect()
}
