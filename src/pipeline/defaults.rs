//! The customer → details → careers → jobs pipeline

use crate::crawler::PageFetcher;
use crate::extract::{
    job_registry, CareersExtractor, CustomerDetailExtractor, CustomerListingExtractor,
    ExtractorRegistry,
};
use crate::pipeline::{InputSource, StageDescriptor};
use std::sync::Arc;

pub const CUSTOMERS: &str = "customers";
pub const DETAILS: &str = "details";
pub const CAREERS: &str = "careers";
pub const JOBS: &str = "jobs";

/// Stage layout of the harvester
///
/// | Stage | URL class | Input |
/// |-------|-----------|-------|
/// | `customers` | `listing` | seeds |
/// | `details` | `customer` | `customers.customers[].link` |
/// | `careers` | `career` | `details.company_url` |
/// | `jobs` | `job` | `careers.jobs[].url` |
pub fn default_stages(fetcher: &PageFetcher) -> Result<Vec<StageDescriptor>, regex::Error> {
    Ok(vec![
        StageDescriptor::new(
            CUSTOMERS,
            "listing",
            InputSource::Seed,
            ExtractorRegistry::new(Arc::new(CustomerListingExtractor::new(fetcher.clone()))),
        ),
        StageDescriptor::new(
            DETAILS,
            "customer",
            InputSource::stage(CUSTOMERS, "customers"),
            ExtractorRegistry::new(Arc::new(CustomerDetailExtractor::new(fetcher.clone()))),
        ),
        StageDescriptor::new(
            CAREERS,
            "career",
            InputSource::stage(DETAILS, "company_url"),
            ExtractorRegistry::new(Arc::new(CareersExtractor::new(fetcher.clone())?)),
        ),
        StageDescriptor::new(
            JOBS,
            "job",
            InputSource::stage(CAREERS, "jobs"),
            job_registry(fetcher)?,
        ),
    ])
}
