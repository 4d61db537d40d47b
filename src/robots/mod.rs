//! Robots.txt handling module
//!
//! [`RobotsGate`] answers "may this URL be fetched?" for the run's user agent.
//! Each origin's robots.txt is fetched at most once per run, even when many
//! workers hit a new origin at the same moment, and the answer is cached for
//! the rest of the run. Missing or unreachable robots files fail open.

mod parser;

pub use parser::ParsedRobots;

use crate::crawler::RateLimiter;
use crate::url::origin_of;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use url::Url;

/// Per-origin robots policy cache
#[derive(Debug)]
pub struct RobotsGate {
    client: Client,
    limiter: Arc<RateLimiter>,
    /// Product token matched against `User-agent` lines
    user_agent: String,
    cache: Mutex<HashMap<String, Arc<OnceCell<ParsedRobots>>>>,
}

impl RobotsGate {
    pub fn new(client: Client, limiter: Arc<RateLimiter>, user_agent: impl Into<String>) -> Self {
        Self {
            client,
            limiter,
            user_agent: user_agent.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns whether the run's user agent may fetch `url`
    ///
    /// URLs that do not parse or have no host are allowed; the fetch itself
    /// will then fail and be reported by the extractor.
    pub async fn allowed(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return true;
        };
        let Some(origin) = origin_of(&parsed) else {
            return true;
        };

        let cell = self.cell_for(&origin);
        let robots = cell.get_or_init(|| self.fetch(&origin)).await;
        let allowed = robots.is_allowed(parsed.as_str(), &self.user_agent);
        if !allowed {
            tracing::info!("URL {} disallowed by robots.txt", url);
        }
        allowed
    }

    /// Number of origins whose policy has been looked up
    pub fn cached_origins(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn cell_for(&self, origin: &str) -> Arc<OnceCell<ParsedRobots>> {
        // A poisoned map only means another worker panicked mid-insert; the
        // map itself is still usable.
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(cache.entry(origin.to_string()).or_default())
    }

    async fn fetch(&self, origin: &str) -> ParsedRobots {
        let robots_url = format!("{}/robots.txt", origin);
        tracing::debug!("Fetching robots.txt from {}", robots_url);

        self.limiter.wait().await;

        let response = match self.client.get(&robots_url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    "Failed to fetch {}: {}; allowing all URLs for this origin",
                    robots_url,
                    e
                );
                return ParsedRobots::allow_all();
            }
        };

        let status = response.status();
        if status.is_client_error() {
            tracing::debug!("No robots.txt at {} (HTTP {})", robots_url, status.as_u16());
            return ParsedRobots::allow_all();
        }
        if !status.is_success() {
            tracing::warn!(
                "robots.txt at {} returned HTTP {}; allowing all URLs for this origin",
                robots_url,
                status.as_u16()
            );
            return ParsedRobots::allow_all();
        }

        match response.text().await {
            Ok(body) => ParsedRobots::from_content(&body),
            Err(e) => {
                tracing::warn!(
                    "Unreadable robots.txt at {}: {}; allowing all URLs for this origin",
                    robots_url,
                    e
                );
                ParsedRobots::allow_all()
            }
        }
    }
}
