//! Configuration module for Stage-Harvest
//!
//! This module handles loading, parsing, and validating TOML configuration
//! files, plus reading the optional JSON seed file.
//!
//! # Example
//!
//! ```no_run
//! use stage_harvest::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("harvest.toml")).unwrap();
//! println!("Rate limit: {}s", config.crawler.rate_limit_seconds);
//! ```

mod parser;
mod seeds;
mod types;
mod validation;

// Re-export types
pub use types::{Config, CrawlerConfig, SeedEntry, StagesConfig, StorageConfig, UserAgentConfig};

// Re-export parser functions
pub use parser::{compute_config_hash, hash_text, load_config, load_config_with_hash, parse_config};

pub use seeds::{load_seed_file, merge_seeds, parse_seed_value};

pub use validation::validate;
