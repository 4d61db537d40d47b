//! Customer listing pages
//!
//! A listing page renders customers as `li.rc05w3` cards: heading, industry
//! and location definitions, and a link carrying the company label. Further
//! results hang off a "see more" link, which is followed (through the rate
//! limiter) up to [`MAX_LISTING_PAGES`] pages.

use crate::crawler::PageFetcher;
use crate::extract::html::{clean_text, select_first_text};
use crate::extract::{ExtractionError, Extractor, Record, WorkItem};
use crate::url::resolve_link;
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::{json, Value};
use std::collections::HashSet;
use url::Url;

/// Upper bound on "see more" pages followed from one seed
pub const MAX_LISTING_PAGES: usize = 50;

/// One customer card on a listing page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerEntry {
    pub link: String,
    pub title: Option<String>,
    pub industry: Option<String>,
    pub location: Option<String>,
    pub company: Option<String>,
}

impl CustomerEntry {
    fn to_value(&self) -> Value {
        json!({
            "link": self.link,
            "title": self.title,
            "industry": self.industry,
            "location": self.location,
            "company": self.company,
        })
    }
}

/// Extracts the `customers` list from listing pages
#[derive(Debug, Clone)]
pub struct CustomerListingExtractor {
    fetcher: PageFetcher,
    max_pages: usize,
}

impl CustomerListingExtractor {
    pub fn new(fetcher: PageFetcher) -> Self {
        Self {
            fetcher,
            max_pages: MAX_LISTING_PAGES,
        }
    }

    #[must_use]
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }
}

#[async_trait]
impl Extractor for CustomerListingExtractor {
    fn name(&self) -> &str {
        "customer-listing"
    }

    async fn process(&self, item: &WorkItem) -> Result<Record, ExtractionError> {
        let page = self.fetcher.fetch(&item.url).await?;
        let (mut entries, mut next) = parse_listing(&page.body, &page.url);
        let mut visited: HashSet<String> = HashSet::from([page.url.to_string()]);
        let mut pages = 1;

        while let Some(next_url) = next.take() {
            if pages >= self.max_pages || !visited.insert(next_url.to_string()) {
                break;
            }
            tracing::debug!("Following listing page {}", next_url);
            let Some(page) = self.fetcher.fetch_followup(&next_url).await? else {
                tracing::info!("Listing page {} disallowed by robots.txt", next_url);
                break;
            };
            let (more, following) = parse_listing(&page.body, &page.url);
            entries.extend(more);
            next = following;
            pages += 1;
        }

        let mut seen = HashSet::new();
        entries.retain(|entry| seen.insert(entry.link.clone()));

        tracing::info!(
            "Listing {} yielded {} customers over {} page(s)",
            item.url,
            entries.len(),
            pages
        );

        let customers: Vec<Value> = entries.iter().map(CustomerEntry::to_value).collect();
        Ok(Record::for_item(item).with("customers", customers))
    }
}

/// Parses one listing page into customer entries plus the "see more" link
pub fn parse_listing(body: &str, base: &Url) -> (Vec<CustomerEntry>, Option<Url>) {
    let document = Html::parse_document(body);
    let root = document.root_element();

    let (Ok(card), Ok(definition), Ok(anchor)) = (
        Selector::parse("li.rc05w3"),
        Selector::parse("span.rc05def"),
        Selector::parse("a"),
    ) else {
        return (Vec::new(), None);
    };

    let mut entries = Vec::new();
    for li in root.select(&card) {
        let Some(link) = li.select(&anchor).next() else {
            continue;
        };
        let Some(href) = link
            .value()
            .attr("href")
            .and_then(|href| resolve_link(href, base))
        else {
            continue;
        };

        let definitions: Vec<_> = li
            .select(&definition)
            .map(|span| span.value().attr("title").map(str::to_string))
            .collect();

        entries.push(CustomerEntry {
            link: href.to_string(),
            title: select_first_text(li, "div.rc05heading"),
            industry: definitions.first().cloned().flatten(),
            location: definitions.get(1).cloned().flatten(),
            company: link
                .value()
                .attr("data-lbl")
                .map(str::to_string)
                .or_else(|| Some(clean_text(link)).filter(|t| !t.is_empty())),
        });
    }

    let next = Selector::parse("a[data-lbl*='see-more'][href]")
        .ok()
        .and_then(|see_more| {
            root.select(&see_more)
                .find_map(|a| a.value().attr("href"))
                .and_then(|href| resolve_link(href, base))
        });

    (entries, next)
}
