//! Harvest orchestration: batch discovery with count reconciliation, resumable extraction,
//! and the optional cron-driven pipeline.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;
use ycv_adapters::{
    detail_text, ChatCompletionsExtractor, ChatExtractorConfig, CompanyExtractor, DetailFetcher,
    ExtractError, PageCollector, PageRenderer, ScrollPolicy, StaticHttpRenderer, DEFAULT_DIRECTORY_URL,
    DEFAULT_EXCLUSIONS,
};
use ycv_core::{BatchSpec, UrlRecord, ValidatedCompany};
use ycv_storage::{
    load_batch_ledger, scan_company_sink, write_batch_ledger, CompanySinkScan, CompletionLog,
    CompletionOutcome, DatasetPaths, HttpClientConfig, HttpFetcher, SinkWriter, UrlLedger,
};

pub const CRATE_NAME: &str = "ycv-sync";

pub const POLICY_FILE: &str = "harvest.yaml";

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub data_dir: PathBuf,
    pub directory_url: String,
    pub user_agent: Option<String>,
    pub http_timeout_secs: u64,
    pub page_timeout_secs: u64,
    pub llm_api_base: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub scheduler_enabled: bool,
    pub harvest_cron: String,
    pub web_port: u16,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("YCV_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            directory_url: env_or("YCV_DIRECTORY_URL", DEFAULT_DIRECTORY_URL),
            user_agent: std::env::var("YCV_USER_AGENT").ok(),
            http_timeout_secs: env_parsed("YCV_HTTP_TIMEOUT_SECS", 20),
            page_timeout_secs: env_parsed("YCV_PAGE_TIMEOUT_SECS", 30),
            llm_api_base: env_or("YCV_LLM_API_BASE", "https://api.openai.com/v1"),
            llm_api_key: std::env::var("YCV_LLM_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok(),
            llm_model: env_or("YCV_LLM_MODEL", "gpt-4o-mini"),
            scheduler_enabled: std::env::var("YCV_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            harvest_cron: env_or("YCV_HARVEST_CRON", "0 0 6 * * *"),
            web_port: env_parsed("YCV_WEB_PORT", 8000),
        }
    }

    pub fn dataset_paths(&self, date: Option<&str>) -> DatasetPaths {
        DatasetPaths::new(&self.data_dir, date)
    }

    pub fn policy_path(&self) -> PathBuf {
        self.data_dir.join(POLICY_FILE)
    }
}

/// Operator-tunable knobs, read from `harvest.yaml` in the data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestPolicy {
    /// Accepted absolute difference between found and expected links per batch.
    pub count_tolerance: u64,
    pub max_retries: usize,
    pub discovery_workers: usize,
    pub extraction_workers: usize,
    pub exclusions: Vec<String>,
    pub scroll_pause_before_ms: u64,
    pub scroll_settle_ms: u64,
    pub max_scrolls: usize,
    pub extraction_attempts: usize,
}

impl Default for HarvestPolicy {
    fn default() -> Self {
        Self {
            count_tolerance: 5,
            max_retries: 3,
            discovery_workers: 6,
            extraction_workers: 1,
            exclusions: DEFAULT_EXCLUSIONS.iter().map(|s| s.to_string()).collect(),
            scroll_pause_before_ms: 400,
            scroll_settle_ms: 200,
            max_scrolls: 500,
            extraction_attempts: 3,
        }
    }
}

impl HarvestPolicy {
    /// A missing file means defaults; a malformed one is a configuration error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn scroll_policy(&self) -> ScrollPolicy {
        ScrollPolicy {
            pause_before: Duration::from_millis(self.scroll_pause_before_ms),
            settle: Duration::from_millis(self.scroll_settle_ms),
            max_scrolls: self.max_scrolls,
        }
    }

    pub fn exclusion_set(&self) -> HashSet<String> {
        self.exclusions.iter().cloned().collect()
    }

    /// Client settings for `config`, with enough per-host slots for the larger worker pool.
    pub fn http_client_config(&self, config: &HarvestConfig) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
            per_host_concurrency: self.discovery_workers.max(self.extraction_workers).max(1),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiscoverySelection {
    /// Leave batches that already have rows in the URL ledger untouched.
    pub skip_discovered: bool,
    /// When non-empty, only these batch codes are collected.
    pub batches: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub tolerance: u64,
    pub max_retries: usize,
    pub workers: usize,
    pub exclusions: HashSet<String>,
    pub selection: DiscoverySelection,
}

impl ReconcileOptions {
    pub fn from_policy(policy: &HarvestPolicy, selection: DiscoverySelection) -> Self {
        Self {
            tolerance: policy.count_tolerance,
            max_retries: policy.max_retries,
            workers: policy.discovery_workers,
            exclusions: policy.exclusion_set(),
            selection,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchDiscovery {
    pub batch_code: String,
    pub expected: u32,
    pub urls: Vec<String>,
    pub attempts: usize,
    /// Final count still outside tolerance after all retries.
    pub mismatch: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoverySummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub batches_total: usize,
    pub batches_collected: usize,
    pub batches_skipped: usize,
    pub empty_batches: usize,
    pub retries: usize,
    pub mismatches: usize,
    pub urls_collected: usize,
    pub urls_added: usize,
    pub ledger_rows: usize,
}

/// Collects every batch's listing, retries suspicious counts, and merges the result
/// into the URL ledger without ever dropping rows already on disk.
pub struct BatchReconciler {
    collector: Arc<PageCollector>,
    options: ReconcileOptions,
}

fn dedup_preserving_order(urls: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.into_iter().filter(|u| seen.insert(u.clone())).collect()
}

impl BatchReconciler {
    pub fn new(collector: Arc<PageCollector>, options: ReconcileOptions) -> Self {
        Self { collector, options }
    }

    /// Collect one batch, retrying while the count is off by more than the tolerance
    /// or the listing came back empty for a batch known to be non-empty.
    pub async fn collect_batch(&self, spec: &BatchSpec) -> BatchDiscovery {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let urls = dedup_preserving_order(
                self.collector
                    .collect(&spec.batch_code, &self.options.exclusions)
                    .await,
            );
            let found = urls.len();
            let deviation = spec.deviation(found);
            let suspicious =
                deviation > self.options.tolerance || (found == 0 && spec.expected_count > 0);
            info!(
                batch = %spec.batch_code,
                attempt = attempts,
                found,
                expected = spec.expected_count,
                "collected batch listing"
            );

            if !suspicious {
                return BatchDiscovery {
                    batch_code: spec.batch_code.clone(),
                    expected: spec.expected_count,
                    urls,
                    attempts,
                    mismatch: false,
                };
            }
            if attempts > self.options.max_retries {
                warn!(
                    batch = %spec.batch_code,
                    found,
                    expected = spec.expected_count,
                    attempts,
                    "count still off after retries; accepting result"
                );
                return BatchDiscovery {
                    batch_code: spec.batch_code.clone(),
                    expected: spec.expected_count,
                    urls,
                    attempts,
                    mismatch: true,
                };
            }
            warn!(
                batch = %spec.batch_code,
                found,
                expected = spec.expected_count,
                "count outside tolerance; retrying"
            );
        }
    }

    /// Collect the selected batches on a bounded worker pool; results come back in batch order.
    pub async fn discover(&self, batches: &[BatchSpec]) -> Vec<BatchDiscovery> {
        let workers = self.options.workers.max(1);
        let mut results: Vec<(usize, BatchDiscovery)> =
            stream::iter(batches.iter().cloned().enumerate())
                .map(|(index, spec)| async move { (index, self.collect_batch(&spec).await) })
                .buffer_unordered(workers)
                .collect()
                .await;
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, discovery)| discovery).collect()
    }

    /// Read both ledgers, collect, merge URLs by (batch, url) union, then rewrite the
    /// batch ledger with the counts actually observed.
    pub async fn reconcile(&self, paths: &DatasetPaths) -> Result<DiscoverySummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        paths.ensure_dirs()?;

        let mut batches = load_batch_ledger(&paths.batch_ledger)?;
        let mut ledger = UrlLedger::load(&paths.url_ledger)?;

        let wanted: HashSet<&str> = self
            .options
            .selection
            .batches
            .iter()
            .map(String::as_str)
            .collect();
        let discovered: HashSet<String> = if self.options.selection.skip_discovered {
            ledger.batch_codes().into_iter().map(str::to_string).collect()
        } else {
            HashSet::new()
        };
        let pending: Vec<BatchSpec> = batches
            .iter()
            .filter(|b| wanted.is_empty() || wanted.contains(b.batch_code.as_str()))
            .filter(|b| !discovered.contains(&b.batch_code))
            .cloned()
            .collect();
        let batches_skipped = batches.len() - pending.len();
        info!(
            total = batches.len(),
            pending = pending.len(),
            skipped = batches_skipped,
            "starting discovery"
        );

        let results = self.discover(&pending).await;

        let mut incoming = Vec::new();
        let mut empty_batches = 0;
        let mut retries = 0;
        let mut mismatches = 0;
        for discovery in &results {
            retries += discovery.attempts - 1;
            if discovery.mismatch {
                mismatches += 1;
            }
            if discovery.urls.is_empty() {
                empty_batches += 1;
                continue;
            }
            incoming.extend(
                discovery
                    .urls
                    .iter()
                    .map(|url| UrlRecord::new(discovery.batch_code.clone(), url.clone())),
            );
            if let Some(spec) = batches
                .iter_mut()
                .find(|b| b.batch_code == discovery.batch_code)
            {
                if spec.expected_count as usize != discovery.urls.len() {
                    info!(
                        batch = %spec.batch_code,
                        previous = spec.expected_count,
                        observed = discovery.urls.len(),
                        "updating expected count"
                    );
                }
                spec.expected_count = u32::try_from(discovery.urls.len()).unwrap_or(u32::MAX);
            }
        }

        let urls_collected = incoming.len();
        let urls_added = ledger.merge(incoming)?;
        write_batch_ledger(&paths.batch_ledger, &batches)?;

        let summary = DiscoverySummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            batches_total: batches.len(),
            batches_collected: results.len(),
            batches_skipped,
            empty_batches,
            retries,
            mismatches,
            urls_collected,
            urls_added,
            ledger_rows: ledger.len(),
        };
        info!(
            added = summary.urls_added,
            ledger_rows = summary.ledger_rows,
            mismatches = summary.mismatches,
            "discovery finished"
        );
        Ok(summary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    Fresh,
    CompletionLog,
    /// No completion log yet; the resume point comes from the company sink's distinct rows.
    SinkCount { distinct_companies: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    pub mode: ResumeMode,
    /// Ledger rows to process, with their zero-based ledger position.
    pub pending: Vec<(usize, UrlRecord)>,
    /// Rows finished by an earlier run that the completion log does not know about yet.
    pub backfill: Vec<UrlRecord>,
    pub skipped: usize,
}

/// Decide which ledger rows still need work.
///
/// With a completion log every row not logged (or logged as rejected, when `retry_rejected`) is
/// pending. Without one, a non-empty company sink with `N` distinct companies means rows before
/// `N - 1` are done; the boundary row is attempted again in case its founders were cut short.
pub fn plan_resume(
    ledger: &[UrlRecord],
    log: &CompletionLog,
    sink: &CompanySinkScan,
    retry_rejected: bool,
) -> ResumePlan {
    if log.is_established() {
        let pending: Vec<(usize, UrlRecord)> = ledger
            .iter()
            .enumerate()
            .filter(|(_, record)| match log.outcome(record) {
                None => true,
                Some(CompletionOutcome::Rejected) => retry_rejected,
                Some(_) => false,
            })
            .map(|(index, record)| (index, record.clone()))
            .collect();
        return ResumePlan {
            mode: ResumeMode::CompletionLog,
            skipped: ledger.len() - pending.len(),
            pending,
            backfill: Vec::new(),
        };
    }

    if sink.is_fresh() {
        return ResumePlan {
            mode: ResumeMode::Fresh,
            pending: ledger.iter().cloned().enumerate().collect(),
            backfill: Vec::new(),
            skipped: 0,
        };
    }

    let distinct_companies = sink.distinct_companies();
    let start = distinct_companies.saturating_sub(1).min(ledger.len());
    ResumePlan {
        mode: ResumeMode::SinkCount { distinct_companies },
        pending: ledger
            .iter()
            .cloned()
            .enumerate()
            .skip(start)
            .collect(),
        backfill: ledger[..start].to_vec(),
        skipped: start,
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    /// Rows fetched and extracted concurrently; results are still written in ledger order.
    pub workers: usize,
    pub retry_rejected: bool,
    /// Stop after this many pending rows.
    pub limit: Option<usize>,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            retry_rejected: false,
            limit: None,
        }
    }
}

#[derive(Debug)]
pub enum RowOutcome {
    Extracted(ValidatedCompany),
    /// Extraction output failed validation; the row is logged and not written.
    Rejected(String),
    /// Page could not be fetched or had no content; retried on the next run.
    Unavailable(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub resume_mode: ResumeMode,
    pub ledger_rows: usize,
    pub skipped: usize,
    pub extracted: usize,
    pub rejected: usize,
    pub unavailable: usize,
    pub companies_written: usize,
    pub founders_written: usize,
}

/// Walks the URL ledger and appends validated companies and founders to the sinks.
/// Safe to kill at any point: each row is durable before its completion is logged.
pub struct ResumableExtractor {
    fetcher: Arc<DetailFetcher>,
    extractor: Arc<dyn CompanyExtractor>,
    options: ExtractionOptions,
}

impl ResumableExtractor {
    pub fn new(
        fetcher: Arc<DetailFetcher>,
        extractor: Arc<dyn CompanyExtractor>,
        options: ExtractionOptions,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            options,
        }
    }

    pub async fn process_row(&self, record: &UrlRecord) -> RowOutcome {
        let page = match self.fetcher.fetch(&record.url).await {
            Ok(page) => page,
            Err(err) => return RowOutcome::Unavailable(err.to_string()),
        };
        let Some(text) = detail_text(&page) else {
            return RowOutcome::Unavailable("detail page has no content".to_string());
        };

        match self.extractor.extract(&text).await {
            Ok(extract) => match extract.validate() {
                Ok(validated) => RowOutcome::Extracted(validated),
                Err(err) => RowOutcome::Rejected(err.to_string()),
            },
            Err(ExtractError::Validation(err)) => RowOutcome::Rejected(err.to_string()),
            Err(ExtractError::Malformed(message)) => RowOutcome::Rejected(message),
            Err(err @ ExtractError::Transport(_)) => RowOutcome::Unavailable(err.to_string()),
        }
    }

    pub async fn run(&self, paths: &DatasetPaths) -> Result<ExtractionSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        paths.ensure_dirs()?;

        let ledger = UrlLedger::load(&paths.url_ledger)?;
        let mut log = CompletionLog::load(&paths.completion_log)?;
        let sink = scan_company_sink(&paths.companies)?;
        let plan = plan_resume(ledger.records(), &log, &sink, self.options.retry_rejected);

        if !plan.backfill.is_empty() {
            info!(rows = plan.backfill.len(), "recording rows finished before the completion log existed");
            log.record_many(plan.backfill.iter(), CompletionOutcome::Inferred)?;
        }

        let total = ledger.len();
        let mut pending = plan.pending;
        if let Some(limit) = self.options.limit {
            pending.truncate(limit);
        }
        info!(
            mode = ?plan.mode,
            total,
            skipped = plan.skipped,
            pending = pending.len(),
            "starting extraction"
        );

        let mut writer = SinkWriter::open(paths)?;
        let mut summary = ExtractionSummary {
            run_id,
            started_at,
            finished_at: started_at,
            resume_mode: plan.mode,
            ledger_rows: total,
            skipped: plan.skipped,
            extracted: 0,
            rejected: 0,
            unavailable: 0,
            companies_written: 0,
            founders_written: 0,
        };

        let workers = self.options.workers.max(1);
        let mut rows = pin!(stream::iter(pending)
            .map(|(index, record)| async move {
                let outcome = self
                    .process_row(&record)
                    .instrument(info_span!("row", url = %record.url))
                    .await;
                (index, record, outcome)
            })
            .buffered(workers));

        while let Some((index, record, outcome)) = rows.next().await {
            let position = index + 1;
            match outcome {
                RowOutcome::Extracted(validated) => {
                    let written = writer.append(&validated)?;
                    log.record(&record, CompletionOutcome::Extracted)?;
                    summary.extracted += 1;
                    summary.companies_written += usize::from(written.company_written);
                    summary.founders_written += written.founders_written;
                    info!(
                        "({position}/{total}) {} -> {} with {} founders",
                        record.url,
                        validated.company.name,
                        validated.founders.len()
                    );
                }
                RowOutcome::Rejected(reason) => {
                    log.record(&record, CompletionOutcome::Rejected)?;
                    summary.rejected += 1;
                    warn!("({position}/{total}) {} rejected: {reason}", record.url);
                }
                RowOutcome::Unavailable(reason) => {
                    summary.unavailable += 1;
                    warn!("({position}/{total}) {} skipped: {reason}", record.url);
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            extracted = summary.extracted,
            rejected = summary.rejected,
            unavailable = summary.unavailable,
            companies = writer.company_count(),
            "extraction finished"
        );
        Ok(summary)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestSummary {
    pub date: Option<String>,
    pub discovery: DiscoverySummary,
    pub extraction: ExtractionSummary,
}

pub fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

/// Wires configuration, policy and the two capabilities into runnable stages.
pub struct HarvestPipeline {
    config: HarvestConfig,
    policy: HarvestPolicy,
    renderer: Arc<dyn PageRenderer>,
    extractor: Arc<dyn CompanyExtractor>,
}

impl HarvestPipeline {
    /// Static HTTP rendering plus the chat-completions extractor, policy from `harvest.yaml`.
    pub fn new(config: HarvestConfig) -> Result<Self> {
        let policy = HarvestPolicy::load(config.policy_path())?;
        Self::with_policy(config, policy)
    }

    /// Like [`HarvestPipeline::new`] with an explicit policy. Worker counts must be final here:
    /// the shared HTTP client sizes its per-host limit from them.
    pub fn with_policy(config: HarvestConfig, policy: HarvestPolicy) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(policy.http_client_config(&config))?);
        let renderer: Arc<dyn PageRenderer> = Arc::new(StaticHttpRenderer::new(http.clone()));
        let extractor: Arc<dyn CompanyExtractor> = Arc::new(ChatCompletionsExtractor::new(
            http,
            ChatExtractorConfig {
                api_base: config.llm_api_base.clone(),
                api_key: config.llm_api_key.clone(),
                model: config.llm_model.clone(),
                max_attempts: policy.extraction_attempts,
            },
        ));
        Ok(Self::with_capabilities(config, policy, renderer, extractor))
    }

    pub fn with_capabilities(
        config: HarvestConfig,
        policy: HarvestPolicy,
        renderer: Arc<dyn PageRenderer>,
        extractor: Arc<dyn CompanyExtractor>,
    ) -> Self {
        Self {
            config,
            policy,
            renderer,
            extractor,
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn policy(&self) -> &HarvestPolicy {
        &self.policy
    }

    fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.config.page_timeout_secs)
    }

    pub fn reconciler(&self, selection: DiscoverySelection) -> Result<BatchReconciler> {
        let directory_url = Url::parse(&self.config.directory_url)
            .with_context(|| format!("parsing directory url {}", self.config.directory_url))?;
        let collector = PageCollector::new(
            self.renderer.clone(),
            directory_url,
            self.policy.scroll_policy(),
            self.page_timeout(),
        );
        Ok(BatchReconciler::new(
            Arc::new(collector),
            ReconcileOptions::from_policy(&self.policy, selection),
        ))
    }

    pub fn extractor(&self, retry_rejected: bool, limit: Option<usize>) -> ResumableExtractor {
        // Detail pages render in one pass; only a short settle is needed.
        let scroll = ScrollPolicy {
            pause_before: Duration::ZERO,
            max_scrolls: 3,
            ..self.policy.scroll_policy()
        };
        let fetcher = DetailFetcher::new(self.renderer.clone(), scroll, self.page_timeout());
        ResumableExtractor::new(
            Arc::new(fetcher),
            self.extractor.clone(),
            ExtractionOptions {
                workers: self.policy.extraction_workers,
                retry_rejected,
                limit,
            },
        )
    }

    pub async fn discover(
        &self,
        date: Option<&str>,
        selection: DiscoverySelection,
    ) -> Result<DiscoverySummary> {
        let paths = self.config.dataset_paths(date);
        self.reconciler(selection)?
            .reconcile(&paths)
            .instrument(info_span!("discover", date = date.unwrap_or("-")))
            .await
    }

    pub async fn extract(
        &self,
        date: Option<&str>,
        retry_rejected: bool,
        limit: Option<usize>,
    ) -> Result<ExtractionSummary> {
        let paths = self.config.dataset_paths(date);
        self.extractor(retry_rejected, limit)
            .run(&paths)
            .instrument(info_span!("extract", date = date.unwrap_or("-")))
            .await
    }

    pub async fn run_once(&self, date: Option<&str>) -> Result<HarvestSummary> {
        let discovery = self.discover(date, DiscoverySelection::default()).await?;
        let extraction = self.extract(date, false, None).await?;
        Ok(HarvestSummary {
            date: date.map(str::to_string),
            discovery,
            extraction,
        })
    }

    /// A scheduler that harvests into today's dataset directory on `YCV_HARVEST_CRON`,
    /// or `None` when scheduling is disabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.harvest_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                let date = today();
                match pipeline.run_once(Some(&date)).await {
                    Ok(summary) => info!(
                        date = %date,
                        urls_added = summary.discovery.urls_added,
                        extracted = summary.extraction.extracted,
                        "scheduled harvest finished"
                    ),
                    Err(err) => error!(date = %date, error = %format!("{err:#}"), "scheduled harvest failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_harvest_once_from_env(date: Option<&str>) -> Result<HarvestSummary> {
    let pipeline = HarvestPipeline::new(HarvestConfig::from_env())?;
    pipeline.run_once(date).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use ycv_adapters::{RenderError, RenderedPage};

    struct FixedPage {
        links: Vec<String>,
    }

    #[async_trait]
    impl RenderedPage for FixedPage {
        async fn scroll_height(&mut self) -> Result<u64, RenderError> {
            Ok(100)
        }

        async fn scroll_to_bottom(&mut self) -> Result<(), RenderError> {
            Ok(())
        }

        async fn html(&mut self) -> Result<String, RenderError> {
            Ok(String::new())
        }

        async fn links(&mut self) -> Result<Vec<String>, RenderError> {
            Ok(self.links.clone())
        }
    }

    /// Serves a queued link list per listing URL; the last entry repeats once the queue drains.
    #[derive(Default)]
    struct ListingRenderer {
        responses: Mutex<HashMap<String, Vec<Vec<String>>>>,
        opened: Mutex<Vec<String>>,
    }

    impl ListingRenderer {
        fn serve(&self, batch: &str, attempts: Vec<Vec<String>>) {
            let url = format!("https://www.ycombinator.com/companies?batch={batch}");
            self.responses.lock().expect("lock").insert(url, attempts);
        }

        fn opened_batches(&self) -> Vec<String> {
            self.opened
                .lock()
                .expect("lock")
                .iter()
                .map(|u| u.rsplit('=').next().unwrap_or_default().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl PageRenderer for ListingRenderer {
        async fn open(&self, url: &str) -> Result<Box<dyn RenderedPage>, RenderError> {
            self.opened.lock().expect("lock").push(url.to_string());
            let mut responses = self.responses.lock().expect("lock");
            let queue = responses.get_mut(url).ok_or_else(|| RenderError::Navigation {
                url: url.to_string(),
                message: "not found".into(),
            })?;
            let links = if queue.len() > 1 {
                queue.remove(0)
            } else {
                queue.first().cloned().unwrap_or_default()
            };
            Ok(Box::new(FixedPage { links }))
        }
    }

    fn company_links(slugs: &[&str]) -> Vec<String> {
        slugs
            .iter()
            .map(|s| format!("https://www.ycombinator.com/companies/{s}"))
            .collect()
    }

    fn reconciler(renderer: Arc<ListingRenderer>, selection: DiscoverySelection) -> BatchReconciler {
        let policy = HarvestPolicy {
            max_retries: 2,
            scroll_pause_before_ms: 0,
            scroll_settle_ms: 0,
            ..HarvestPolicy::default()
        };
        let collector = PageCollector::new(
            renderer,
            Url::parse(DEFAULT_DIRECTORY_URL).expect("url"),
            policy.scroll_policy(),
            Duration::from_secs(5),
        );
        BatchReconciler::new(
            Arc::new(collector),
            ReconcileOptions::from_policy(&policy, selection),
        )
    }

    #[tokio::test]
    async fn short_listing_is_retried_until_within_tolerance() {
        let renderer = Arc::new(ListingRenderer::default());
        let full = (0..20).map(|i| format!("c{i}")).collect::<Vec<_>>();
        let full = full.iter().map(String::as_str).collect::<Vec<_>>();
        renderer.serve(
            "S24",
            vec![company_links(&full[..3]), company_links(&full)],
        );
        let reconciler = reconciler(renderer.clone(), DiscoverySelection::default());

        let discovery = reconciler.collect_batch(&BatchSpec::new("S24", 20)).await;
        assert_eq!(discovery.attempts, 2);
        assert_eq!(discovery.urls.len(), 20);
        assert!(!discovery.mismatch);
    }

    #[tokio::test]
    async fn persistent_mismatch_is_accepted_with_warning() {
        let renderer = Arc::new(ListingRenderer::default());
        renderer.serve("W23", vec![company_links(&["a", "b", "a"])]);
        let reconciler = reconciler(renderer.clone(), DiscoverySelection::default());

        let discovery = reconciler.collect_batch(&BatchSpec::new("W23", 50)).await;
        assert_eq!(discovery.attempts, 3);
        assert!(discovery.mismatch);
        assert_eq!(discovery.urls, company_links(&["a", "b"]));
    }

    #[tokio::test]
    async fn reconcile_merges_and_updates_counts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = DatasetPaths::new(dir.path(), Some("2026-10-16"));
        write_batch_ledger(
            &paths.batch_ledger,
            &[BatchSpec::new("S24", 2), BatchSpec::new("W24", 1), BatchSpec::new("X25", 3)],
        )
        .expect("batches");

        let renderer = Arc::new(ListingRenderer::default());
        renderer.serve("S24", vec![company_links(&["a", "b", "founders"])]);
        renderer.serve("W24", vec![company_links(&["c", "d"])]);
        renderer.serve("X25", vec![vec![]]);
        let reconciler = reconciler(renderer.clone(), DiscoverySelection::default());

        let summary = reconciler.reconcile(&paths).await.expect("reconcile");
        assert_eq!(summary.batches_collected, 3);
        assert_eq!(summary.urls_added, 4);
        assert_eq!(summary.empty_batches, 1);
        assert_eq!(summary.retries, 2);

        let batches = load_batch_ledger(&paths.batch_ledger).expect("reload");
        assert_eq!(
            batches,
            vec![BatchSpec::new("S24", 2), BatchSpec::new("W24", 2), BatchSpec::new("X25", 3)]
        );

        // A later run that finds fewer URLs never shrinks the ledger.
        renderer.serve("S24", vec![company_links(&["a"])]);
        let again = reconciler.reconcile(&paths).await.expect("second reconcile");
        assert_eq!(again.urls_added, 0);
        assert_eq!(UrlLedger::load(&paths.url_ledger).expect("ledger").len(), 4);
    }

    #[tokio::test]
    async fn selection_limits_which_batches_are_opened() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = DatasetPaths::new(dir.path(), None);
        write_batch_ledger(
            &paths.batch_ledger,
            &[BatchSpec::new("S24", 1), BatchSpec::new("W24", 1), BatchSpec::new("F24", 1)],
        )
        .expect("batches");
        let mut ledger = UrlLedger::load(&paths.url_ledger).expect("ledger");
        ledger
            .merge([UrlRecord::new("S24", "https://www.ycombinator.com/companies/a")])
            .expect("seed");

        let renderer = Arc::new(ListingRenderer::default());
        renderer.serve("W24", vec![company_links(&["w"])]);
        renderer.serve("F24", vec![company_links(&["f"])]);
        let reconciler = reconciler(
            renderer.clone(),
            DiscoverySelection {
                skip_discovered: true,
                batches: vec!["S24".into(), "W24".into()],
            },
        );

        let summary = reconciler.reconcile(&paths).await.expect("reconcile");
        assert_eq!(summary.batches_skipped, 2);
        assert_eq!(renderer.opened_batches(), vec!["W24".to_string()]);
    }

    fn ledger_of(n: usize) -> Vec<UrlRecord> {
        (0..n)
            .map(|i| UrlRecord::new("S24", format!("https://www.ycombinator.com/companies/c{i}")))
            .collect()
    }

    fn write_companies(path: &Path, rows: &[&str]) {
        let mut text = String::from("Name,Batch,Status,Industry,Team Size,Location\n");
        for row in rows {
            text.push_str(row);
            text.push('\n');
        }
        std::fs::write(path, text).expect("write sink");
    }

    #[test]
    fn fresh_sink_starts_at_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = DatasetPaths::new(dir.path(), None);
        let log = CompletionLog::load(&paths.completion_log).expect("log");
        let sink = scan_company_sink(&paths.companies).expect("scan");

        let plan = plan_resume(&ledger_of(3), &log, &sink, false);
        assert_eq!(plan.mode, ResumeMode::Fresh);
        assert_eq!(plan.pending.len(), 3);
        assert_eq!(plan.pending[0].0, 0);
    }

    #[test]
    fn legacy_sink_resumes_at_boundary_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = DatasetPaths::new(dir.path(), None);
        write_companies(
            &paths.companies,
            &[
                "A,S24,Active,AI,3,Paris",
                "B,S24,Active,AI,4,",
                "B,S24,Active,AI,4,",
                "C,S24,Public,,,",
            ],
        );
        let log = CompletionLog::load(&paths.completion_log).expect("log");
        let sink = scan_company_sink(&paths.companies).expect("scan");

        let ledger = ledger_of(6);
        let plan = plan_resume(&ledger, &log, &sink, false);
        assert_eq!(plan.mode, ResumeMode::SinkCount { distinct_companies: 3 });
        assert_eq!(
            plan.pending.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![2, 3, 4, 5]
        );
        assert_eq!(plan.backfill, ledger[..2].to_vec());
    }

    #[test]
    fn completion_log_drives_resume_once_present() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = DatasetPaths::new(dir.path(), None);
        let ledger = ledger_of(4);
        {
            let mut log = CompletionLog::load(&paths.completion_log).expect("log");
            log.record(&ledger[0], CompletionOutcome::Extracted).expect("record");
            log.record(&ledger[2], CompletionOutcome::Rejected).expect("record");
        }
        let log = CompletionLog::load(&paths.completion_log).expect("reload");
        let sink = scan_company_sink(&paths.companies).expect("scan");

        let plan = plan_resume(&ledger, &log, &sink, false);
        assert_eq!(plan.mode, ResumeMode::CompletionLog);
        assert_eq!(plan.pending.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 3]);

        let retry = plan_resume(&ledger, &log, &sink, true);
        assert_eq!(retry.pending.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    struct UnusedExtractor;

    #[async_trait]
    impl CompanyExtractor for UnusedExtractor {
        async fn extract(&self, _text: &str) -> Result<ycv_core::CompanyExtract, ExtractError> {
            Err(ExtractError::Malformed("not expected in this test".into()))
        }
    }

    fn test_config(data_dir: &Path) -> HarvestConfig {
        HarvestConfig {
            data_dir: data_dir.to_path_buf(),
            directory_url: DEFAULT_DIRECTORY_URL.into(),
            page_timeout_secs: 5,
            ..HarvestConfig::from_env()
        }
    }

    #[tokio::test]
    async fn harvest_runs_on_a_spawned_task() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = DatasetPaths::new(dir.path(), Some("2026-10-16"));
        write_batch_ledger(&paths.batch_ledger, &[BatchSpec::new("S24", 2)]).expect("batches");

        let renderer = Arc::new(ListingRenderer::default());
        renderer.serve("S24", vec![company_links(&["a", "b"])]);
        let policy = HarvestPolicy {
            scroll_pause_before_ms: 0,
            scroll_settle_ms: 0,
            ..HarvestPolicy::default()
        };
        let pipeline = Arc::new(HarvestPipeline::with_capabilities(
            test_config(dir.path()),
            policy,
            renderer,
            Arc::new(UnusedExtractor),
        ));

        // scheduled jobs run the harvest as a spawned task, which needs a Send future
        let summary = tokio::spawn(async move { pipeline.run_once(Some("2026-10-16")).await })
            .await
            .expect("join")
            .expect("harvest");
        assert_eq!(summary.discovery.urls_added, 2);
        // detail pages are not served, so both rows stay pending for the next run
        assert_eq!(summary.extraction.unavailable, 2);
        assert!(!CompletionLog::load(&paths.completion_log).expect("log").is_established());
    }

    #[test]
    fn http_limits_follow_worker_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let mut policy = HarvestPolicy::default();
        assert_eq!(policy.http_client_config(&config).per_host_concurrency, 6);

        policy.extraction_workers = 20;
        let http = policy.http_client_config(&config);
        assert_eq!(http.per_host_concurrency, 20);
        assert_eq!(http.timeout, Duration::from_secs(config.http_timeout_secs));
        assert!(HarvestPipeline::with_policy(config, policy).is_ok());
    }

    #[test]
    fn policy_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(POLICY_FILE);
        assert_eq!(HarvestPolicy::load(&path).expect("missing"), HarvestPolicy::default());

        std::fs::write(&path, "count_tolerance: 0\nexclusions: [founders]\n").expect("write");
        let policy = HarvestPolicy::load(&path).expect("policy");
        assert_eq!(policy.count_tolerance, 0);
        assert_eq!(policy.exclusions, vec!["founders".to_string()]);
        assert_eq!(policy.max_retries, 3);

        std::fs::write(&path, "count_tolerance: [oops\n").expect("write");
        assert!(HarvestPolicy::load(&path).is_err());
    }
}
