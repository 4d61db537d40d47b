//! The default customers → details → careers → jobs pipeline against a mock site

use serde_json::Value;
use stage_harvest::config::{parse_config, Config};
use stage_harvest::output::load_statistics;
use stage_harvest::pipeline::{RunOutcome, CAREERS, CUSTOMERS, DETAILS, JOBS, JOURNAL_FILE};
use stage_harvest::storage::{RunStatus, SqliteJournal, StageStatus};
use stage_harvest::{
    HarvestError, Pipeline, Record, RecordStore, RunOptions, Shutdown, VisitedLedger,
    VisitedOutcome,
};
use stage_harvest::state::FlushPolicy;
use std::path::Path;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(server: &MockServer, data_dir: &Path, extra_crawler: &str) -> Config {
    let toml = format!(
        r#"
[crawler]
rate-limit-seconds = 0.0
workers = 2
max-attempts = 2
backoff-base-ms = 1
max-backoff-ms = 5
request-timeout-secs = 5
{extra_crawler}

[user-agent]
crawler-name = "TestHarvester"
crawler-version = "1.0"
contact-url = "https://example.com/about"
contact-email = "admin@example.com"

[storage]
data-dir = "{data_dir}"
log-dir = "{data_dir}/logs"

[[seed]]
url = "{uri}/customers/"
"#,
        uri = server.uri(),
        data_dir = data_dir.display(),
    );
    parse_config(&toml).unwrap()
}

fn html(body: impl Into<String>) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/html; charset=utf-8")
        .set_body_raw(body.into(), "text/html; charset=utf-8")
}

fn card(name: &str, href: &str) -> String {
    format!(
        r#"<li class="rc05w3">
             <div class="rc05heading">{name} story</div>
             <span class="rc05def" title="Retail">i</span>
             <span class="rc05def" title="Lisbon">l</span>
             <a data-lbl="{name}" href="{href}">Read</a>
           </li>"#
    )
}

async fn page(server: &MockServer, at: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(html(body))
        .mount(server)
        .await;
}

/// Four customers: one full chain, one without a website, one blocked by
/// robots.txt and one whose detail page keeps failing
async fn mock_site() -> MockServer {
    let server = MockServer::start().await;
    let uri = server.uri();

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private/\n"))
        .expect(1)
        .mount(&server)
        .await;

    page(
        &server,
        "/customers/",
        format!(
            r#"<html><body><ul>{}{}{}</ul>
               <a data-lbl="customers-see-more" href="/customers/more">See more</a></body></html>"#,
            card("Acme", "/customers/acme/"),
            card("Globex", "/customers/globex/"),
            card("Initech", "/private/initech/"),
        ),
    )
    .await;
    page(
        &server,
        "/customers/more",
        format!("<html><body><ul>{}</ul></body></html>", card("Hooli", "/customers/hooli/")),
    )
    .await;

    page(
        &server,
        "/customers/acme/",
        format!(
            r#"<html><body>
                 <div data-trackas="rc42:products-used"><a href="/db">Database</a></div>
                 <div data-trackas="rc42:learn-more"><a href="{uri}/acme/">Acme Corp, opens in new tab</a></div>
                 <div class="cb41w1"><p>They moved.</p><p>It went well.</p></div>
                 <div class="cb41quote">Fast.</div>
               </body></html>"#
        ),
    )
    .await;
    page(
        &server,
        "/customers/globex/",
        r#"<html><body><div class="cb41w1"><p>No website here.</p></div></body></html>"#.to_string(),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/customers/hooli/"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    page(
        &server,
        "/acme/",
        r#"<html><body><a href="/acme/about">About</a><a href="/acme/careers">Careers</a></body></html>"#
            .to_string(),
    )
    .await;
    page(
        &server,
        "/acme/careers",
        r#"<html><body>
             <div class="job-card"><h3>Rust Engineer</h3><a href="/acme/jobs/1">Details</a></div>
             <div class="job-card"><h3>Ghost Role</h3><a href="/acme/jobs/2">Details</a></div>
           </body></html>"#
            .to_string(),
    )
    .await;
    page(
        &server,
        "/acme/jobs/1",
        r#"<html><body>
             <h1>Rust Engineer</h1>
             <div class="job-location">Remote</div>
             <div class="job-description">Build crawlers.</div>
           </body></html>"#
            .to_string(),
    )
    .await;
    page(
        &server,
        "/acme/jobs/2",
        "<html><body><p>This posting was removed.</p></body></html>".to_string(),
    )
    .await;

    server
}

fn record_for(records: &[Record], url: &str) -> Record {
    records
        .iter()
        .find(|r| r.get_str("url") == Some(url))
        .cloned()
        .unwrap_or_else(|| panic!("no record for {}", url))
}

#[tokio::test]
async fn test_full_harvest() {
    let dir = tempfile::tempdir().unwrap();
    let server = mock_site().await;
    let uri = server.uri();
    let config = config(&server, dir.path(), "");

    let mut pipeline = Pipeline::from_config(&config, "hash", Shutdown::new()).unwrap();
    let report = pipeline.execute(&RunOptions::from_config(&config)).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);

    // customers: one record listing all four cards across both pages
    let customers = RecordStore::open(dir.path().join("customers.json")).unwrap().get_all();
    assert_eq!(customers.len(), 1);
    let listed = customers[0].get("customers").and_then(Value::as_array).unwrap();
    assert_eq!(listed.len(), 4);

    // details: robots denial and exhausted retries are contained
    let details = &report.stage(DETAILS).unwrap().report;
    assert_eq!(details.total, 4);
    assert_eq!(details.succeeded, 2);
    assert_eq!(details.denied, 1);
    assert_eq!(details.failed, 1);
    assert_eq!(details.failures[0].kind, "transient");
    assert_eq!(details.failures[0].attempts, 2);

    let detail_records = RecordStore::open(dir.path().join("details.json")).unwrap().get_all();
    let acme = record_for(&detail_records, &format!("{}/customers/acme/", uri));
    assert_eq!(acme.get_str("company_name"), Some("Acme Corp"));
    assert_eq!(acme.get_str("industry"), Some("Retail"));
    assert_eq!(acme.get_str("case_study_content"), Some("They moved.\n\nIt went well."));
    let globex = record_for(&detail_records, &format!("{}/customers/globex/", uri));
    assert_eq!(globex.get("company_url"), Some(&Value::Null));

    // careers: only Acme has a website
    let careers = RecordStore::open(dir.path().join("careers.json")).unwrap().get_all();
    assert_eq!(careers.len(), 1);
    assert_eq!(careers[0].get("jobs").and_then(Value::as_array).map(Vec::len), Some(2));

    // jobs: one posting parsed, the empty one failed permanently
    let jobs_report = &report.stage(JOBS).unwrap().report;
    assert_eq!(jobs_report.succeeded, 1);
    assert_eq!(jobs_report.failed, 1);
    assert_eq!(jobs_report.failures[0].kind, "permanent");

    let jobs = RecordStore::open(dir.path().join("jobs.json")).unwrap().get_all();
    let job = record_for(&jobs, &format!("{}/acme/jobs/1", uri));
    assert_eq!(job.get_str("title"), Some("Rust Engineer"));
    assert_eq!(job.get_str("location"), Some("Remote"));
    assert_eq!(job.get_str("platform"), Some("generic"));
    assert_eq!(job.get_str("parent_id"), Some(careers[0].id.as_str()));

    let ledger = VisitedLedger::new(dir.path(), FlushPolicy::default());
    let customer_outcomes = ledger.outcome_counts("customer");
    assert_eq!(customer_outcomes.get(&VisitedOutcome::Success), Some(&2));
    assert_eq!(customer_outcomes.get(&VisitedOutcome::Skipped), Some(&1));
    assert_eq!(customer_outcomes.get(&VisitedOutcome::Failure), Some(&1));
}

#[tokio::test]
async fn test_journal_records_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let server = mock_site().await;
    let config = config(&server, dir.path(), "");

    {
        let mut pipeline = Pipeline::from_config(&config, "hash", Shutdown::new()).unwrap();
        pipeline.execute(&RunOptions::from_config(&config)).await.unwrap();
    }

    let journal = SqliteJournal::new(&dir.path().join(JOURNAL_FILE)).unwrap();
    let stats = load_statistics(&journal).unwrap().unwrap();
    assert_eq!(stats.run.status, RunStatus::Completed);
    assert_eq!(stats.run.config_hash, "hash");

    let names: Vec<_> = stats.stages.iter().map(|s| s.stage.as_str()).collect();
    assert_eq!(names.len(), 4);
    for name in [CUSTOMERS, DETAILS, CAREERS, JOBS] {
        assert!(names.contains(&name));
    }
    assert!(stats.stages.iter().all(|s| s.status == StageStatus::Completed));
    assert_eq!(stats.failures.len(), 2);
}

#[tokio::test]
async fn test_low_listing_yield_stops_before_details() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    page(
        &server,
        "/customers/",
        format!("<html><body><ul>{}</ul></body></html>", card("Acme", "/customers/acme/")),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/customers/acme/"))
        .respond_with(html("<html></html>"))
        .expect(0)
        .mount(&server)
        .await;

    let config = config(&server, dir.path(), "min-expected = 10");
    let mut pipeline = Pipeline::from_config(&config, "hash", Shutdown::new()).unwrap();
    let err = pipeline
        .execute(&RunOptions::from_config(&config))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        HarvestError::SanityCheck { found: 1, expected: 10, ref stage } if stage == CUSTOMERS
    ));
    assert!(!dir.path().join("details.json").exists());

    let journal = SqliteJournal::new(&dir.path().join(JOURNAL_FILE)).unwrap();
    let stats = load_statistics(&journal).unwrap().unwrap();
    assert_eq!(stats.run.status, RunStatus::Failed);
    assert_eq!(stats.stages[0].status, StageStatus::Failed);
}
