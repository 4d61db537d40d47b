//! Crawler module for fetching pages and executing stages
//!
//! This module contains the request-side machinery shared by every stage:
//! - HTTP fetching with transient/permanent error classification
//! - The process-wide rate limiter and the retry policy
//! - The bounded worker pool that runs one stage
//! - Cooperative shutdown on Ctrl-C / SIGTERM

mod fetcher;
mod rate_limiter;
mod retry;
mod runner;
mod shutdown;

pub use fetcher::{build_http_client, FetchedPage, PageFetcher};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;
pub use runner::{ItemFailure, StageReport, StageRunner, DEFAULT_WORKERS};
pub use shutdown::Shutdown;
