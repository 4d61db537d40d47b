//! HTTP fetcher implementation
//!
//! This module handles the HTTP requests made on behalf of extractors:
//! - Building the HTTP client with the crawler's user agent string
//! - GET requests for HTML pages
//! - Robots and rate-limit gating for pages found during extraction
//! - Classifying failures as transient (worth a retry) or permanent

use crate::config::UserAgentConfig;
use crate::crawler::RateLimiter;
use crate::extract::ExtractionError;
use crate::robots::RobotsGate;
use reqwest::{redirect::Policy, Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Maximum redirect hops followed for a single page
const MAX_REDIRECTS: usize = 10;

/// A successfully fetched HTML page
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Final URL after redirects; relative links resolve against it
    pub url: Url,
    pub body: String,
}

/// Builds an HTTP client with proper configuration
///
/// # Example
///
/// ```no_run
/// use stage_harvest::config::UserAgentConfig;
/// use stage_harvest::crawler::build_http_client;
/// use std::time::Duration;
///
/// let config = UserAgentConfig {
///     crawler_name: "StageHarvest".to_string(),
///     crawler_version: "1.0".to_string(),
///     contact_url: "https://example.com/about".to_string(),
///     contact_email: "admin@example.com".to_string(),
/// };
///
/// let client = build_http_client(&config, Duration::from_secs(30)).unwrap();
/// ```
pub fn build_http_client(
    config: &UserAgentConfig,
    timeout: Duration,
) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.header_value())
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .redirect(Policy::limited(MAX_REDIRECTS))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Shared page fetcher used by all extractors of a run
///
/// # Error Classification
///
/// | Condition | Kind |
/// |-----------|------|
/// | Timeout, connection failure | Transient |
/// | HTTP 429, HTTP 5xx | Transient |
/// | Other HTTP 4xx / non-success | Permanent |
/// | Content-Type not HTML | Permanent |
/// | Empty body | Permanent |
///
/// The robots gate and rate limiter must be the ones the stage runner uses,
/// so follow-up requests share the run's per-origin policy cache and spacing.
#[derive(Debug, Clone)]
pub struct PageFetcher {
    client: Client,
    limiter: Arc<RateLimiter>,
    robots: Arc<RobotsGate>,
}

impl PageFetcher {
    pub fn new(client: Client, limiter: Arc<RateLimiter>, robots: Arc<RobotsGate>) -> Self {
        Self {
            client,
            limiter,
            robots,
        }
    }

    /// Fetches the page a work item points at
    ///
    /// Does not wait on the rate limiter: the stage runner already did so for
    /// this attempt.
    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, ExtractionError> {
        let url = Url::parse(url)
            .map_err(|e| ExtractionError::Permanent(format!("invalid URL '{}': {}", url, e)))?;
        self.get(url).await
    }

    /// Fetches an additional page discovered during extraction
    ///
    /// The page's origin robots.txt is consulted first, then the rate
    /// limiter. Returns `Ok(None)` when robots.txt disallows the page; no
    /// request is sent in that case.
    pub async fn fetch_followup(&self, url: &Url) -> Result<Option<FetchedPage>, ExtractionError> {
        if !self.robots.allowed(url.as_str()).await {
            return Ok(None);
        }
        self.limiter.wait().await;
        self.get(url.clone()).await.map(Some)
    }

    async fn get(&self, url: Url) -> Result<FetchedPage, ExtractionError> {
        tracing::debug!("GET {}", url);

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if !content_type.is_empty() && !content_type.contains("html") {
            return Err(ExtractionError::Permanent(format!(
                "expected HTML, got {}",
                content_type
            )));
        }

        let final_url = response.url().clone();
        let body = response
            .text()
            .await
            .map_err(|e| ExtractionError::Transient(format!("failed to read body: {}", e)))?;

        if body.trim().is_empty() {
            return Err(ExtractionError::Permanent("empty response body".to_string()));
        }

        Ok(FetchedPage {
            url: final_url,
            body,
        })
    }
}

fn classify_status(status: StatusCode) -> ExtractionError {
    let message = format!("HTTP {}", status.as_u16());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ExtractionError::Transient(message)
    } else {
        ExtractionError::Permanent(message)
    }
}

fn classify_request_error(e: reqwest::Error) -> ExtractionError {
    if e.is_timeout() {
        ExtractionError::Transient("request timeout".to_string())
    } else if e.is_connect() {
        ExtractionError::Transient(format!("connection failed: {}", e))
    } else if e.is_redirect() || e.is_builder() {
        ExtractionError::Permanent(e.to_string())
    } else {
        ExtractionError::Transient(e.to_string())
    }
}
