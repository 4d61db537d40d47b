//! Careers discovery on company websites
//!
//! Starting from a company home page, find the link to its careers section
//! (by link text, then by URL shape), fetch that page and collect the job
//! postings it lists.

use crate::crawler::PageFetcher;
use crate::extract::html::{clean_text, first_elements_of, first_text_of};
use crate::extract::{ExtractionError, Extractor, Record, WorkItem};
use crate::url::resolve_link;
use async_trait::async_trait;
use regex::{Regex, RegexSet};
use scraper::{Html, Selector};
use serde_json::{json, Value};
use std::collections::HashSet;
use url::Url;

/// Link texts that lead to a careers section
const CAREER_LINK_TEXT: &[&str] = &[
    r"job",
    r"career",
    r"position",
    r"opening",
    r"opportunit",
    r"vacanc",
    r"employ",
    r"work with us",
    r"join us",
    r"join.*team",
];

/// URL paths that look like a careers section
const CAREER_LINK_PATH: &[&str] = &[
    r"/jobs/?",
    r"/careers?(/|$)",
    r"/opportunities",
    r"/openings",
    r"/positions",
    r"/vacancies",
    r"/recruiting",
    r"/work-with-us",
    r"/join-us",
    r"/employment",
];

/// Containers for a single posting on a careers page
const JOB_ELEMENTS: &[&str] = &[
    ".job-item",
    ".job-listing",
    ".job-card",
    ".job",
    ".opening",
    ".position",
    ".vacancy",
    "[data-job-id]",
    ".career-item",
];

const JOB_TITLES: &[&str] = &["h2", "h3", "h4", ".job-title", ".position-title"];

/// Link texts of individual postings when no container matches
const JOB_LINK_TEXT: &str = r"(?i)job|position|opening|apply|career";

/// A posting listed on a careers page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLink {
    pub url: String,
    pub title: Option<String>,
}

/// Extracts `{career_url, jobs: [{url, title}]}` from company websites
#[derive(Debug, Clone)]
pub struct CareersExtractor {
    fetcher: PageFetcher,
    link_text: RegexSet,
    link_path: RegexSet,
    job_link_text: Regex,
}

impl CareersExtractor {
    pub fn new(fetcher: PageFetcher) -> Result<Self, regex::Error> {
        let case_insensitive = |patterns: &[&str]| -> Vec<String> {
            patterns.iter().map(|p| format!("(?i){}", p)).collect()
        };
        Ok(Self {
            fetcher,
            link_text: RegexSet::new(case_insensitive(CAREER_LINK_TEXT))?,
            link_path: RegexSet::new(case_insensitive(CAREER_LINK_PATH))?,
            job_link_text: Regex::new(JOB_LINK_TEXT)?,
        })
    }

    /// Finds the careers page link on a company page
    pub fn find_careers_link(&self, body: &str, base: &Url) -> Option<Url> {
        let document = Html::parse_document(body);
        let anchor = Selector::parse("a[href]").ok()?;
        let links: Vec<(String, Url)> = document
            .select(&anchor)
            .filter_map(|a| {
                let href = a.value().attr("href")?;
                Some((clean_text(a), resolve_link(href, base)?))
            })
            .collect();

        links
            .iter()
            .find(|(text, _)| !text.is_empty() && self.link_text.is_match(text))
            .or_else(|| links.iter().find(|(_, url)| self.link_path.is_match(url.path())))
            .map(|(_, url)| url.clone())
    }

    /// Collects job postings from a careers page
    pub fn find_jobs(&self, body: &str, base: &Url) -> Vec<JobLink> {
        let document = Html::parse_document(body);
        let root = document.root_element();
        let Ok(anchor) = Selector::parse("a[href]") else {
            return Vec::new();
        };

        let mut jobs = Vec::new();
        let containers = first_elements_of(root, JOB_ELEMENTS);
        if containers.is_empty() {
            for a in root.select(&anchor) {
                let text = clean_text(a);
                if !self.job_link_text.is_match(&text) {
                    continue;
                }
                if let Some(url) = a.value().attr("href").and_then(|h| resolve_link(h, base)) {
                    jobs.push(JobLink {
                        url: url.to_string(),
                        title: Some(text),
                    });
                }
            }
        } else {
            for element in containers {
                let Some(url) = element
                    .select(&anchor)
                    .find_map(|a| a.value().attr("href"))
                    .and_then(|h| resolve_link(h, base))
                else {
                    continue;
                };
                let title = first_text_of(element, JOB_TITLES).or_else(|| {
                    element
                        .select(&anchor)
                        .map(clean_text)
                        .find(|t| !t.is_empty())
                });
                jobs.push(JobLink {
                    url: url.to_string(),
                    title,
                });
            }
        }

        // The careers page linking to itself is not a posting
        let mut seen = HashSet::from([base.to_string()]);
        jobs.retain(|job| seen.insert(job.url.clone()));
        jobs
    }
}

#[async_trait]
impl Extractor for CareersExtractor {
    fn name(&self) -> &str {
        "careers"
    }

    async fn process(&self, item: &WorkItem) -> Result<Record, ExtractionError> {
        let home = self.fetcher.fetch(&item.url).await?;
        let mut record = Record::for_item(item);

        let Some(careers_url) = self.find_careers_link(&home.body, &home.url) else {
            tracing::debug!("No careers link on {}", item.url);
            return Ok(without_careers(record));
        };

        let Some(careers) = self.fetcher.fetch_followup(&careers_url).await? else {
            tracing::info!("Careers page {} disallowed by robots.txt", careers_url);
            return Ok(without_careers(record));
        };
        let jobs = self.find_jobs(&careers.body, &careers.url);
        tracing::info!("{} lists {} job(s) at {}", item.url, jobs.len(), careers.url);

        record.set("career_url", careers.url.to_string());
        record.set(
            "jobs",
            jobs.iter()
                .map(|job| json!({"url": job.url, "title": job.title}))
                .collect::<Vec<_>>(),
        );
        Ok(record)
    }
}

fn without_careers(mut record: Record) -> Record {
    record.set("career_url", Value::Null);
    record.set("jobs", Vec::<Value>::new());
    record
}
