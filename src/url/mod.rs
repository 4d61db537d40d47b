//! URL handling module for Stage-Harvest
//!
//! Provides the canonical URL form used as ledger key, link resolution for
//! extractors, and origin derivation for robots lookups.

mod normalize;
mod resolve;

pub use normalize::normalize_url;
pub use resolve::{origin_of, resolve_link};
