//! URL-pattern extractor selection

use crate::extract::Extractor;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// Routes work items to extractors by URL pattern
///
/// Routes are tried in insertion order against the full URL; the first match
/// wins, otherwise the stage's fallback extractor is used.
#[derive(Clone)]
pub struct ExtractorRegistry {
    routes: Vec<(Regex, Arc<dyn Extractor>)>,
    fallback: Arc<dyn Extractor>,
}

impl ExtractorRegistry {
    pub fn new(fallback: Arc<dyn Extractor>) -> Self {
        Self {
            routes: Vec::new(),
            fallback,
        }
    }

    /// Adds a route; `pattern` is a regex searched (case-insensitively) in the URL
    pub fn route(mut self, pattern: &str, extractor: Arc<dyn Extractor>) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("(?i){}", pattern))?;
        self.routes.push((regex, extractor));
        Ok(self)
    }

    pub fn select(&self, url: &str) -> &dyn Extractor {
        self.routes
            .iter()
            .find(|(regex, _)| regex.is_match(url))
            .map(|(_, extractor)| extractor.as_ref())
            .unwrap_or_else(|| self.fallback.as_ref())
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

impl fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let routes: Vec<_> = self
            .routes
            .iter()
            .map(|(regex, extractor)| format!("{} => {}", regex.as_str(), extractor.name()))
            .collect();
        f.debug_struct("ExtractorRegistry")
            .field("routes", &routes)
            .field("fallback", &self.fallback.name())
            .finish()
    }
}
