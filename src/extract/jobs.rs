//! Job posting pages
//!
//! Hosted applicant-tracking platforms get dedicated parsers selected by host
//! pattern; every other posting goes through [`GenericJobExtractor`], which
//! tries a list of common selectors per field.

use crate::crawler::PageFetcher;
use crate::extract::html::{first_text_of, select_attr, select_first_text};
use crate::extract::{ExtractionError, Extractor, ExtractorRegistry, Record, WorkItem};
use crate::url::resolve_link;
use async_trait::async_trait;
use scraper::{Html, Selector};
use std::sync::Arc;
use url::Url;

/// Fields of a job posting; all optional since markup varies widely
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobPosting {
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub department: Option<String>,
    pub job_type: Option<String>,
    pub application_url: Option<String>,
}

impl JobPosting {
    fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none()
    }

    fn into_record(self, item: &WorkItem, platform: &str) -> Record {
        let mut record = Record::for_item(item);
        record.set_opt("title", self.title);
        record.set_opt("description", self.description);
        record.set_opt("location", self.location);
        record.set_opt("department", self.department);
        record.set_opt("job_type", self.job_type);
        record.set_opt("application_url", self.application_url);
        record.set("platform", platform);
        record
    }
}

/// Applicant-tracking platforms with a dedicated parser
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPlatform {
    Workday,
    Lever,
    Greenhouse,
}

impl JobPlatform {
    pub const ALL: [JobPlatform; 3] = [Self::Workday, Self::Lever, Self::Greenhouse];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Workday => "workday",
            Self::Lever => "lever",
            Self::Greenhouse => "greenhouse",
        }
    }

    /// Registry pattern matching the platform's hosts
    pub fn url_pattern(&self) -> &'static str {
        match self {
            Self::Workday => r"myworkdayjobs\.com|workday\.com",
            Self::Lever => r"lever\.co",
            Self::Greenhouse => r"greenhouse\.io",
        }
    }

    pub fn parse(&self, body: &str, base: &Url) -> JobPosting {
        let document = Html::parse_document(body);
        let root = document.root_element();

        match self {
            Self::Workday => JobPosting {
                title: select_first_text(root, "[data-automation-id='jobTitle']"),
                description: first_text_of(
                    root,
                    &[
                        "[data-automation-id='jobPostingDescription']",
                        "[data-automation-id='job-description-text']",
                        "[data-automation-id='jobDescription']",
                        ".job-description",
                    ],
                ),
                location: select_first_text(root, "[data-automation-id='locationLabel']"),
                department: None,
                job_type: select_first_text(root, "[data-automation-id='time']"),
                application_url: select_attr(root, "a[data-automation-id='adventureButton']", "href")
                    .and_then(|href| absolute(&href, base)),
            },
            Self::Lever => {
                let mut posting = JobPosting {
                    title: select_first_text(root, ".posting-headline h2"),
                    description: lever_description(&document),
                    application_url: select_attr(root, "a.postings-btn[href]", "href")
                        .and_then(|href| absolute(&href, base)),
                    ..JobPosting::default()
                };
                for (label, value) in lever_categories(&document) {
                    if label.contains("location") {
                        posting.location = Some(value);
                    } else if label.contains("team") || label.contains("department") {
                        posting.department = Some(value);
                    } else if label.contains("commitment") || label.contains("type") {
                        posting.job_type = Some(value);
                    }
                }
                posting
            }
            Self::Greenhouse => JobPosting {
                title: select_first_text(root, ".app-title, h1.heading"),
                description: select_first_text(root, "#content, .job-description, .section-description"),
                location: select_first_text(root, ".location, .job-location"),
                department: select_first_text(root, ".department, .job-department"),
                job_type: None,
                application_url: select_attr(root, "#apply a, .apply a", "href")
                    .and_then(|href| absolute(&href, base)),
            },
        }
    }
}

/// `.posting-categories .category` label/value pairs, labels lowercased
fn lever_categories(document: &Html) -> Vec<(String, String)> {
    let Ok(category) = Selector::parse(".posting-categories .category") else {
        return Vec::new();
    };
    document
        .select(&category)
        .filter_map(|element| {
            let label = select_first_text(element, ".category-label")?.to_lowercase();
            let value = select_first_text(element, ".category-text")?;
            Some((label, value))
        })
        .collect()
}

/// Joins `.posting-description .section` blocks as "heading\ncontent"
fn lever_description(document: &Html) -> Option<String> {
    let section = Selector::parse(".posting-description .section").ok()?;
    let parts: Vec<String> = document
        .select(&section)
        .filter_map(|element| {
            let content = select_first_text(element, ".section-wrapper")?;
            Some(match select_first_text(element, "h3") {
                Some(heading) => format!("{}\n{}", heading, content),
                None => content,
            })
        })
        .collect();

    if parts.is_empty() {
        select_first_text(document.root_element(), ".posting-description")
    } else {
        Some(parts.join("\n\n"))
    }
}

fn absolute(href: &str, base: &Url) -> Option<String> {
    resolve_link(href, base).map(|u| u.to_string())
}

/// Parses postings hosted on a known platform
#[derive(Debug, Clone)]
pub struct PlatformJobExtractor {
    platform: JobPlatform,
    fetcher: PageFetcher,
}

impl PlatformJobExtractor {
    pub fn new(platform: JobPlatform, fetcher: PageFetcher) -> Self {
        Self { platform, fetcher }
    }
}

#[async_trait]
impl Extractor for PlatformJobExtractor {
    fn name(&self) -> &str {
        self.platform.name()
    }

    async fn process(&self, item: &WorkItem) -> Result<Record, ExtractionError> {
        let page = self.fetcher.fetch(&item.url).await?;
        let posting = self.platform.parse(&page.body, &page.url);
        if posting.is_empty() {
            return Err(ExtractionError::Permanent(format!(
                "no {} posting found",
                self.platform.name()
            )));
        }
        Ok(posting.into_record(item, self.platform.name()))
    }
}

const GENERIC_TITLE: &[&str] = &[
    "h1.job-title",
    ".job-title",
    ".position-title",
    "[data-job-title]",
    ".job-header h1",
    "h1",
];
const GENERIC_DESCRIPTION: &[&str] = &[
    ".job-description",
    "#job-description",
    "[data-job-description]",
    ".description",
    ".job-content",
    ".about-position",
    "article",
    "main",
];
const GENERIC_LOCATION: &[&str] = &[".job-location", "[data-job-location]", ".location"];
const GENERIC_DEPARTMENT: &[&str] = &[
    ".job-department",
    "[data-job-department]",
    ".department",
    ".category",
];
const GENERIC_JOB_TYPE: &[&str] = &[".job-type", ".employment-type", "[data-job-type]"];
const GENERIC_APPLY: &[&str] = &[
    ".apply a",
    "#apply a",
    "a.apply",
    ".job-apply a",
    "a.apply-button",
    "[data-apply] a",
];

/// Parses postings on arbitrary career sites
#[derive(Debug, Clone)]
pub struct GenericJobExtractor {
    fetcher: PageFetcher,
}

impl GenericJobExtractor {
    pub fn new(fetcher: PageFetcher) -> Self {
        Self { fetcher }
    }

    pub fn parse(body: &str, base: &Url) -> JobPosting {
        let document = Html::parse_document(body);
        let root = document.root_element();
        JobPosting {
            title: first_text_of(root, GENERIC_TITLE),
            description: first_text_of(root, GENERIC_DESCRIPTION),
            location: first_text_of(root, GENERIC_LOCATION),
            department: first_text_of(root, GENERIC_DEPARTMENT),
            job_type: first_text_of(root, GENERIC_JOB_TYPE),
            application_url: GENERIC_APPLY
                .iter()
                .find_map(|css| select_attr(root, css, "href"))
                .and_then(|href| absolute(&href, base)),
        }
    }
}

#[async_trait]
impl Extractor for GenericJobExtractor {
    fn name(&self) -> &str {
        "generic-job"
    }

    async fn process(&self, item: &WorkItem) -> Result<Record, ExtractionError> {
        let page = self.fetcher.fetch(&item.url).await?;
        let posting = Self::parse(&page.body, &page.url);
        if posting.is_empty() {
            return Err(ExtractionError::Permanent("no job posting found".to_string()));
        }
        Ok(posting.into_record(item, "generic"))
    }
}

/// Registry for the jobs stage: one route per platform, generic fallback
pub fn job_registry(fetcher: &PageFetcher) -> Result<ExtractorRegistry, regex::Error> {
    let mut registry = ExtractorRegistry::new(Arc::new(GenericJobExtractor::new(fetcher.clone())));
    for platform in JobPlatform::ALL {
        registry = registry.route(
            platform.url_pattern(),
            Arc::new(PlatformJobExtractor::new(platform, fetcher.clone())),
        )?;
    }
    Ok(registry)
}
