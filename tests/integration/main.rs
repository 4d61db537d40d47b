//! Integration tests for Stage-Harvest
//!
//! `pipeline_tests` drive whole pipelines built from small in-test extractors;
//! `harvest_tests` run the default customer → jobs pipeline against wiremock
//! servers.

mod harvest_tests;
mod pipeline_tests;
