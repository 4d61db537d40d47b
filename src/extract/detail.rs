//! Customer detail (case study) pages

use crate::crawler::PageFetcher;
use crate::extract::html::{clean_text, select_first_text, select_texts};
use crate::extract::{ExtractionError, Extractor, Record, WorkItem};
use crate::url::resolve_link;
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::Value;
use url::Url;

/// Screen-reader suffix appended to external link labels
const NEW_TAB_SUFFIX: &str = ", opens in new tab";

/// Fields parsed from a customer detail page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerDetail {
    pub company_name: Option<String>,
    pub company_url: Option<String>,
    pub products_used: Vec<String>,
    pub case_study_content: String,
    pub quote: String,
}

/// Extracts company, products and case study text from a detail page
///
/// The record keeps the listing fields carried in the work item's context
/// (title, industry, location, company) and adds the parsed fields.
#[derive(Debug, Clone)]
pub struct CustomerDetailExtractor {
    fetcher: PageFetcher,
}

impl CustomerDetailExtractor {
    pub fn new(fetcher: PageFetcher) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Extractor for CustomerDetailExtractor {
    fn name(&self) -> &str {
        "customer-detail"
    }

    async fn process(&self, item: &WorkItem) -> Result<Record, ExtractionError> {
        let page = self.fetcher.fetch(&item.url).await?;
        let detail = parse_detail(&page.body, &page.url);

        if detail.company_url.is_none() {
            tracing::debug!("No company website on {}", item.url);
        }

        let mut record = Record::for_item(item);
        record.set("company_name", detail.company_name.map_or(Value::Null, Value::from));
        record.set("company_url", detail.company_url.map_or(Value::Null, Value::from));
        record.set("products_used", detail.products_used);
        record.set("case_study_content", detail.case_study_content);
        record.set("quote", detail.quote);
        Ok(record)
    }
}

pub fn parse_detail(body: &str, base: &Url) -> CustomerDetail {
    let document = Html::parse_document(body);
    let root = document.root_element();

    let (company_name, company_url) = Selector::parse("div[data-trackas='rc42:learn-more'] a")
        .ok()
        .and_then(|selector| root.select(&selector).next())
        .map(|link| {
            let name = clean_text(link).replace(NEW_TAB_SUFFIX, "").trim().to_string();
            let url = link
                .value()
                .attr("href")
                .and_then(|href| resolve_link(href, base))
                .map(|u| u.to_string());
            (Some(name).filter(|n| !n.is_empty()), url)
        })
        .unwrap_or((None, None));

    CustomerDetail {
        company_name,
        company_url,
        products_used: select_texts(root, "div[data-trackas='rc42:products-used'] a"),
        case_study_content: select_texts(root, "div.cb41w1 p").join("\n\n"),
        quote: select_first_text(root, "div.cb41quote").unwrap_or_default(),
    }
}
