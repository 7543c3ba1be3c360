use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ycv_adapters::{
    CompanyExtractor, DetailFetcher, ExtractError, PageRenderer, RenderError, RenderedPage,
    ScrollPolicy,
};
use ycv_core::{CompanyExtract, FounderExtract, UrlRecord};
use ycv_storage::{read_table, CompletionLog, CompletionOutcome, DatasetPaths, UrlLedger};
use ycv_sync::{ExtractionOptions, ResumableExtractor, ResumeMode};

const BASE: &str = "https://www.ycombinator.com/companies";

struct DetailPageStub {
    slug: String,
}

#[async_trait]
impl RenderedPage for DetailPageStub {
    async fn scroll_height(&mut self) -> Result<u64, RenderError> {
        Ok(500)
    }

    async fn scroll_to_bottom(&mut self) -> Result<(), RenderError> {
        Ok(())
    }

    async fn html(&mut self) -> Result<String, RenderError> {
        Ok(format!("<html><body><main>company {}</main></body></html>", self.slug))
    }

    async fn links(&mut self) -> Result<Vec<String>, RenderError> {
        Ok(vec![format!("https://www.linkedin.com/in/{}-founder", self.slug)])
    }
}

/// Renders every detail page except those listed as offline.
#[derive(Default)]
struct DirectoryStub {
    offline: Mutex<HashSet<String>>,
    opened: AtomicUsize,
}

#[async_trait]
impl PageRenderer for DirectoryStub {
    async fn open(&self, url: &str) -> Result<Box<dyn RenderedPage>, RenderError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let slug = url.rsplit('/').next().unwrap_or_default().to_string();
        if self.offline.lock().expect("lock").contains(&slug) {
            return Err(RenderError::Timeout {
                url: url.to_string(),
                after: Duration::from_secs(30),
            });
        }
        Ok(Box::new(DetailPageStub { slug }))
    }
}

/// Turns `company <slug>` into a two-founder company; slugs starting with `bad` get a comma
/// in their name, which validation must reject.
#[derive(Default)]
struct ExtractorStub {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl CompanyExtractor for ExtractorStub {
    async fn extract(&self, text: &str) -> Result<CompanyExtract, ExtractError> {
        let slug = text
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| ExtractError::Malformed("no slug".into()))?
            .to_string();
        self.calls.lock().expect("lock").push(slug.clone());

        let name = if slug.starts_with("bad") {
            format!("{slug}, Inc")
        } else {
            slug.to_uppercase()
        };
        Ok(CompanyExtract {
            name,
            batch: "S24".into(),
            status: "Active".into(),
            industry: Some("B2B".into()),
            team_size: Some(4),
            city: Some("San Francisco".into()),
            founders: Some(vec![
                FounderExtract {
                    first_name: "Ada".into(),
                    last_name: format!("{slug}-one"),
                    linkedin_url: Some(format!("https://www.linkedin.com/in/{slug}-founder")),
                    twitter_url: None,
                },
                FounderExtract {
                    first_name: "Grace".into(),
                    last_name: format!("{slug}-two"),
                    linkedin_url: None,
                    twitter_url: Some("https://x.com/grace".into()),
                },
            ]),
        })
    }
}

fn seed_ledger(paths: &DatasetPaths, slugs: &[&str]) -> Vec<UrlRecord> {
    let records = slugs
        .iter()
        .map(|slug| UrlRecord::new("S24", format!("{BASE}/{slug}")))
        .collect::<Vec<_>>();
    let mut ledger = UrlLedger::load(&paths.url_ledger).expect("ledger");
    ledger.merge(records.clone()).expect("merge");
    records
}

fn extractor(
    renderer: Arc<DirectoryStub>,
    stub: Arc<ExtractorStub>,
    options: ExtractionOptions,
) -> ResumableExtractor {
    let scroll = ScrollPolicy {
        pause_before: Duration::ZERO,
        settle: Duration::ZERO,
        max_scrolls: 2,
    };
    let fetcher = DetailFetcher::new(renderer, scroll, Duration::from_secs(5));
    ResumableExtractor::new(Arc::new(fetcher), stub, options)
}

fn data_rows(path: &std::path::Path) -> usize {
    read_table(path).expect("table").rows.len()
}

#[tokio::test]
async fn validation_failure_is_isolated_to_its_row() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = DatasetPaths::new(dir.path(), Some("2026-10-16"));
    paths.ensure_dirs().expect("dirs");
    seed_ledger(&paths, &["url1", "bad-url2"]);

    let renderer = Arc::new(DirectoryStub::default());
    let stub = Arc::new(ExtractorStub::default());
    let summary = extractor(renderer, stub, ExtractionOptions::default())
        .run(&paths)
        .await
        .expect("run");

    assert_eq!(summary.extracted, 1);
    assert_eq!(summary.rejected, 1);
    assert_eq!(data_rows(&paths.companies), 1);
    assert_eq!(data_rows(&paths.founders), 2);

    let companies = read_table(&paths.companies).expect("companies");
    assert_eq!(
        companies.headers,
        vec!["Name", "Batch", "Status", "Industry", "Team Size", "Location"]
    );
    assert_eq!(companies.rows[0][0], "URL1");

    let log = CompletionLog::load(&paths.completion_log).expect("log");
    let row = |slug: &str| UrlRecord::new("S24", format!("{BASE}/{slug}"));
    assert_eq!(log.outcome(&row("url1")), Some(CompletionOutcome::Extracted));
    assert_eq!(log.outcome(&row("bad-url2")), Some(CompletionOutcome::Rejected));
}

#[tokio::test]
async fn restart_skips_finished_rows_and_retries_unavailable_ones() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = DatasetPaths::new(dir.path(), None);
    paths.ensure_dirs().expect("dirs");
    seed_ledger(&paths, &["alpha", "beta", "gamma", "delta"]);

    let renderer = Arc::new(DirectoryStub::default());
    renderer.offline.lock().expect("lock").insert("gamma".into());
    let first_stub = Arc::new(ExtractorStub::default());
    let first = extractor(renderer.clone(), first_stub.clone(), ExtractionOptions::default())
        .run(&paths)
        .await
        .expect("first run");
    assert_eq!(first.resume_mode, ResumeMode::Fresh);
    assert_eq!(first.extracted, 3);
    assert_eq!(first.unavailable, 1);

    renderer.offline.lock().expect("lock").clear();
    let second_stub = Arc::new(ExtractorStub::default());
    let second = extractor(renderer, second_stub.clone(), ExtractionOptions::default())
        .run(&paths)
        .await
        .expect("second run");
    assert_eq!(second.resume_mode, ResumeMode::CompletionLog);
    assert_eq!(second.skipped, 3);
    assert_eq!(second.extracted, 1);
    assert_eq!(second_stub.calls.lock().expect("lock").as_slice(), ["gamma"]);
    assert_eq!(data_rows(&paths.companies), 4);
    assert_eq!(data_rows(&paths.founders), 8);
}

#[tokio::test]
async fn legacy_dataset_resumes_from_company_count_without_duplicates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = DatasetPaths::new(dir.path(), None);
    paths.ensure_dirs().expect("dirs");
    let ledger = seed_ledger(&paths, &["one", "two", "three", "four"]);

    // An older run wrote two companies but kept no completion log, and stopped
    // before writing the second company's last founder.
    std::fs::write(
        &paths.companies,
        "Name,Batch,Status,Industry,Team Size,Location\n\
         ONE,S24,Active,B2B,4,San Francisco\n\
         TWO,S24,Active,B2B,4,San Francisco\n",
    )
    .expect("companies");
    std::fs::write(
        &paths.founders,
        "Name,Batch,Status,Industry,Team Size,Location,Founder's First Name,Founder's Last Name,Founder's LinkedIn,Founder's Twitter\n\
         ONE,S24,Active,B2B,4,San Francisco,Ada,one-one,https://www.linkedin.com/in/one-founder,\n\
         ONE,S24,Active,B2B,4,San Francisco,Grace,one-two,,https://x.com/grace\n\
         TWO,S24,Active,B2B,4,San Francisco,Ada,two-one,https://www.linkedin.com/in/two-founder,\n",
    )
    .expect("founders");

    let renderer = Arc::new(DirectoryStub::default());
    let stub = Arc::new(ExtractorStub::default());
    let summary = extractor(renderer, stub.clone(), ExtractionOptions::default())
        .run(&paths)
        .await
        .expect("run");

    assert_eq!(summary.resume_mode, ResumeMode::SinkCount { distinct_companies: 2 });
    assert_eq!(stub.calls.lock().expect("lock").as_slice(), ["two", "three", "four"]);
    assert_eq!(summary.companies_written, 2);
    assert_eq!(data_rows(&paths.companies), 4);
    assert_eq!(data_rows(&paths.founders), 8);

    let log = CompletionLog::load(&paths.completion_log).expect("log");
    assert_eq!(log.outcome(&ledger[0]), Some(CompletionOutcome::Inferred));
    assert_eq!(log.outcome(&ledger[1]), Some(CompletionOutcome::Extracted));
    assert_eq!(log.len(), 4);
}

#[tokio::test]
async fn concurrent_workers_still_append_in_ledger_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = DatasetPaths::new(dir.path(), None);
    paths.ensure_dirs().expect("dirs");
    let slugs = ["a1", "b2", "c3", "d4", "e5", "f6"];
    seed_ledger(&paths, &slugs);

    let renderer = Arc::new(DirectoryStub::default());
    let stub = Arc::new(ExtractorStub::default());
    let options = ExtractionOptions {
        workers: 3,
        limit: Some(5),
        ..Default::default()
    };
    let summary = extractor(renderer, stub, options)
        .run(&paths)
        .await
        .expect("run");
    assert_eq!(summary.extracted, 5);

    let companies = read_table(&paths.companies).expect("companies");
    let names = companies.rows.iter().map(|r| r[0].clone()).collect::<Vec<_>>();
    assert_eq!(names, vec!["A1", "B2", "C3", "D4", "E5"]);
}

#[tokio::test]
async fn run_killed_mid_write_resumes_cleanly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = DatasetPaths::new(dir.path(), None);
    paths.ensure_dirs().expect("dirs");
    seed_ledger(&paths, &["alpha", "beta"]);

    // alpha finished; the process died while writing beta's company row and its log line
    std::fs::write(
        &paths.companies,
        "Name,Batch,Status,Industry,Team Size,Location\n\
         ALPHA,S24,Active,B2B,4,San Francisco\n\
         BET",
    )
    .expect("companies");
    std::fs::write(
        &paths.founders,
        "Name,Batch,Status,Industry,Team Size,Location,Founder's First Name,Founder's Last Name,Founder's LinkedIn,Founder's Twitter\n\
         ALPHA,S24,Active,B2B,4,San Francisco,Ada,alpha-one,https://www.linkedin.com/in/alpha-founder,\n\
         ALPHA,S24,Active,B2B,4,San Francisco,Grace,alpha-two,,https://x.com/grace\n",
    )
    .expect("founders");
    std::fs::write(
        &paths.completion_log,
        format!("Batch,YC URL,Outcome\nS24,{BASE}/alpha,extracted\nS24,{BASE}/be"),
    )
    .expect("log");

    let renderer = Arc::new(DirectoryStub::default());
    let stub = Arc::new(ExtractorStub::default());
    let summary = extractor(renderer, stub.clone(), ExtractionOptions::default())
        .run(&paths)
        .await
        .expect("run after torn writes");

    assert_eq!(summary.resume_mode, ResumeMode::CompletionLog);
    assert_eq!(stub.calls.lock().expect("lock").as_slice(), ["beta"]);
    let companies = read_table(&paths.companies).expect("companies");
    let names = companies.rows.iter().map(|r| r[0].clone()).collect::<Vec<_>>();
    assert_eq!(names, vec!["ALPHA", "BETA"]);
    assert_eq!(data_rows(&paths.founders), 4);

    let log = CompletionLog::load(&paths.completion_log).expect("log");
    assert_eq!(log.len(), 2);
    assert_eq!(
        log.outcome(&UrlRecord::new("S24", format!("{BASE}/beta"))),
        Some(CompletionOutcome::Extracted)
    );
}
