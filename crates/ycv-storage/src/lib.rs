//! Flat-file datasets (batch ledger, URL ledger, company/founder sinks, completion log)
//! plus the concurrency-limited HTTP fetcher shared by the capabilities.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::io::Cursor;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;
use ycv_core::{
    BatchSpec, CompanyIdentity, FounderIdentity, UrlRecord, ValidatedCompany, COMPANY_HEADER,
    COMPLETION_LOG_HEADER, FOUNDER_HEADER, URL_LEDGER_HEADER,
};

pub const CRATE_NAME: &str = "ycv-storage";

pub const BATCH_LEDGER_FILE: &str = "YC_Batches.csv";
pub const URL_LEDGER_FILE: &str = "YC_URLs.csv";
pub const COMPANY_SINK_FILE: &str = "YC_Companies.csv";
pub const FOUNDER_SINK_FILE: &str = "YC_Founders.csv";
pub const COMPLETION_LOG_FILE: &str = "YC_Completed.csv";

/// Resolved file locations for one dataset. The batch ledger is shared across dates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetPaths {
    pub dataset_dir: PathBuf,
    pub batch_ledger: PathBuf,
    pub url_ledger: PathBuf,
    pub companies: PathBuf,
    pub founders: PathBuf,
    pub completion_log: PathBuf,
}

impl DatasetPaths {
    pub fn new(data_dir: impl AsRef<Path>, date: Option<&str>) -> Self {
        let data_dir = data_dir.as_ref();
        let dataset_dir = match date {
            Some(date) => data_dir.join(date),
            None => data_dir.to_path_buf(),
        };
        Self {
            batch_ledger: data_dir.join(BATCH_LEDGER_FILE),
            url_ledger: dataset_dir.join(URL_LEDGER_FILE),
            companies: dataset_dir.join(COMPANY_SINK_FILE),
            founders: dataset_dir.join(FOUNDER_SINK_FILE),
            completion_log: dataset_dir.join(COMPLETION_LOG_FILE),
            dataset_dir,
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.dataset_dir)
            .with_context(|| format!("creating dataset directory {}", self.dataset_dir.display()))
    }
}

fn is_missing_or_empty(path: &Path) -> Result<bool> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len() == 0),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(err) => Err(err).with_context(|| format!("inspecting {}", path.display())),
    }
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {} for append", path.display()))
}

/// Length of the prefix of `bytes` that ends on a line terminator.
fn terminated_len(bytes: &[u8]) -> usize {
    bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1)
}

fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

/// Contents of `path` up to its last line terminator, or `None` when the file is missing.
/// An unterminated trailing record is what an interrupted append leaves behind; it is dropped.
fn read_complete_records(path: &Path) -> Result<Option<Vec<u8>>> {
    let Some(mut bytes) = read_if_exists(path)? else {
        return Ok(None);
    };
    let complete = terminated_len(&bytes);
    if complete < bytes.len() {
        warn!(
            path = %path.display(),
            dropped_bytes = bytes.len() - complete,
            "ignoring unterminated trailing record"
        );
        bytes.truncate(complete);
    }
    Ok(Some(bytes))
}

/// Cut an unterminated trailing record off `path` so the next append starts on its own line.
fn truncate_torn_tail(path: &Path) -> Result<()> {
    let Some(bytes) = read_if_exists(path)? else {
        return Ok(());
    };
    let complete = terminated_len(&bytes);
    if complete == bytes.len() {
        return Ok(());
    }
    warn!(
        path = %path.display(),
        dropped_bytes = bytes.len() - complete,
        "truncating unterminated trailing record before appending"
    );
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("opening {} for repair", path.display()))?;
    file.set_len(complete as u64)
        .with_context(|| format!("truncating {}", path.display()))?;
    file.sync_data()
        .with_context(|| format!("syncing {}", path.display()))
}

/// Append-mode CSV writer that emits `header` only when the file is new or empty.
fn append_writer(path: &Path, header: &[&str]) -> Result<csv::Writer<File>> {
    truncate_torn_tail(path)?;
    let fresh = is_missing_or_empty(path)?;
    let file = open_append(path)?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    if fresh {
        writer
            .write_record(header)
            .with_context(|| format!("writing header to {}", path.display()))?;
        flush_durably(&mut writer, path)?;
    }
    Ok(writer)
}

fn flush_durably(writer: &mut csv::Writer<File>, path: &Path) -> Result<()> {
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    writer
        .get_ref()
        .sync_data()
        .with_context(|| format!("syncing {}", path.display()))
}

fn raw_reader(path: &Path) -> Result<Option<csv::Reader<Cursor<Vec<u8>>>>> {
    Ok(read_complete_records(path)?.map(|bytes| {
        csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(Cursor::new(bytes))
    }))
}

/// A sink's first row is a header when its first two cells are `Name` and `Batch`.
pub fn looks_like_header(row: &csv::StringRecord) -> bool {
    let cell = |i: usize| row.get(i).map(str::trim).unwrap_or_default();
    cell(0).eq_ignore_ascii_case("name") && cell(1).eq_ignore_ascii_case("batch")
}

pub fn load_batch_ledger(path: impl AsRef<Path>) -> Result<Vec<BatchSpec>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("opening batch ledger {}", path.display()))?;
    reader
        .deserialize()
        .collect::<Result<Vec<BatchSpec>, _>>()
        .with_context(|| format!("parsing batch ledger {}", path.display()))
}

/// Replace the batch ledger in full via temp file + rename, so a crash never leaves it half written.
pub fn write_batch_ledger(path: impl AsRef<Path>, batches: &[BatchSpec]) -> Result<()> {
    let path = path.as_ref();
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", BATCH_LEDGER_FILE, Uuid::new_v4()));
    let written = (|| -> Result<()> {
        let mut writer = csv::Writer::from_path(&temp_path)
            .with_context(|| format!("creating temp ledger {}", temp_path.display()))?;
        for batch in batches {
            writer
                .serialize(batch)
                .with_context(|| format!("writing batch {}", batch.batch_code))?;
        }
        flush_durably(&mut writer, &temp_path)
    })();

    let result = written.and_then(|()| {
        fs::rename(&temp_path, path).with_context(|| {
            format!(
                "atomically renaming temp ledger {} -> {}",
                temp_path.display(),
                path.display()
            )
        })
    });
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// Deduplicated, insertion-ordered view of the URL ledger file. Only ever appended to.
#[derive(Debug)]
pub struct UrlLedger {
    path: PathBuf,
    records: Vec<UrlRecord>,
    keys: HashSet<UrlRecord>,
}

impl UrlLedger {
    /// Loads the ledger; a missing file is an empty ledger, a malformed record is an error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut ledger = Self {
            path,
            records: Vec::new(),
            keys: HashSet::new(),
        };
        let Some(bytes) = read_complete_records(&ledger.path)? else {
            return Ok(ledger);
        };

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(Cursor::new(bytes));
        for row in reader.deserialize::<UrlRecord>() {
            let record =
                row.with_context(|| format!("parsing URL ledger {}", ledger.path.display()))?;
            ledger.insert(record);
        }
        Ok(ledger)
    }

    fn insert(&mut self, record: UrlRecord) -> bool {
        if self.keys.contains(&record) {
            return false;
        }
        self.keys.insert(record.clone());
        self.records.push(record);
        true
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[UrlRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, record: &UrlRecord) -> bool {
        self.keys.contains(record)
    }

    pub fn batch_codes(&self) -> HashSet<&str> {
        self.records.iter().map(|r| r.batch_code.as_str()).collect()
    }

    /// Set-union `incoming` into the ledger on the `(batch, url)` key and append only the
    /// pairs not already present. Returns the number of pairs added.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = UrlRecord>) -> Result<usize> {
        let added = incoming
            .into_iter()
            .filter(|record| self.insert(record.clone()))
            .collect::<Vec<_>>();
        if added.is_empty() {
            return Ok(0);
        }

        let mut writer = append_writer(&self.path, &URL_LEDGER_HEADER)?;
        for record in &added {
            writer
                .write_record([record.batch_code.as_str(), record.url.as_str()])
                .with_context(|| format!("appending to URL ledger {}", self.path.display()))?;
        }
        flush_durably(&mut writer, &self.path)?;
        Ok(added.len())
    }
}

/// What an earlier run left in the company sink.
#[derive(Debug, Default, Clone)]
pub struct CompanySinkScan {
    pub exists: bool,
    pub has_header: bool,
    pub data_rows: usize,
    pub identities: HashSet<CompanyIdentity>,
}

impl CompanySinkScan {
    /// True when nothing (not even a header) has been written yet.
    pub fn is_fresh(&self) -> bool {
        !self.has_header && self.data_rows == 0
    }

    pub fn distinct_companies(&self) -> usize {
        self.identities.len()
    }
}

pub fn scan_company_sink(path: impl AsRef<Path>) -> Result<CompanySinkScan> {
    let path = path.as_ref();
    let Some(mut reader) = raw_reader(path)? else {
        return Ok(CompanySinkScan::default());
    };

    let mut scan = CompanySinkScan {
        exists: true,
        ..Default::default()
    };
    for (i, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("reading company sink {}", path.display()))?;
        if i == 0 && looks_like_header(&row) {
            scan.has_header = true;
            continue;
        }
        let cells = row.iter().collect::<Vec<_>>();
        if let Some(identity) = CompanyIdentity::from_cells(&cells) {
            scan.data_rows += 1;
            scan.identities.insert(identity);
        }
    }
    Ok(scan)
}

pub fn scan_founder_sink(path: impl AsRef<Path>) -> Result<HashSet<FounderIdentity>> {
    let path = path.as_ref();
    let Some(mut reader) = raw_reader(path)? else {
        return Ok(HashSet::new());
    };

    let mut identities = HashSet::new();
    for (i, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("reading founder sink {}", path.display()))?;
        if i == 0 && looks_like_header(&row) {
            continue;
        }
        let cells = row.iter().collect::<Vec<_>>();
        if let Some(identity) = FounderIdentity::from_cells(&cells) {
            identities.insert(identity);
        }
    }
    Ok(identities)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    pub company_written: bool,
    pub founders_written: usize,
}

/// Single writer over the company and founder sinks. Every `append` writes the company row,
/// then its founders, and makes both files durable before returning.
pub struct SinkWriter {
    companies_path: PathBuf,
    founders_path: PathBuf,
    companies: csv::Writer<File>,
    founders: csv::Writer<File>,
    known_companies: HashSet<CompanyIdentity>,
    known_founders: HashSet<FounderIdentity>,
}

impl SinkWriter {
    pub fn open(paths: &DatasetPaths) -> Result<Self> {
        let known_companies = scan_company_sink(&paths.companies)?.identities;
        let known_founders = scan_founder_sink(&paths.founders)?;
        Ok(Self {
            companies: append_writer(&paths.companies, &COMPANY_HEADER)?,
            founders: append_writer(&paths.founders, &FOUNDER_HEADER)?,
            companies_path: paths.companies.clone(),
            founders_path: paths.founders.clone(),
            known_companies,
            known_founders,
        })
    }

    /// Rows whose identity is already on disk are not written again, which makes
    /// re-attempting a partially written row idempotent.
    pub fn append(&mut self, validated: &ValidatedCompany) -> Result<AppendOutcome> {
        let mut outcome = AppendOutcome::default();

        let identity = validated.company.identity();
        if !self.known_companies.contains(&identity) {
            self.companies
                .write_record(validated.company.to_cells())
                .with_context(|| format!("appending to {}", self.companies_path.display()))?;
            flush_durably(&mut self.companies, &self.companies_path)?;
            self.known_companies.insert(identity);
            outcome.company_written = true;
        }

        for founder in &validated.founders {
            let identity = founder.identity();
            if self.known_founders.contains(&identity) {
                continue;
            }
            self.founders
                .write_record(founder.to_cells())
                .with_context(|| format!("appending to {}", self.founders_path.display()))?;
            self.known_founders.insert(identity);
            outcome.founders_written += 1;
        }
        flush_durably(&mut self.founders, &self.founders_path)?;

        Ok(outcome)
    }

    pub fn company_count(&self) -> usize {
        self.known_companies.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionOutcome {
    /// Row was extracted and written to the sinks.
    Extracted,
    /// Extraction output failed validation.
    Rejected,
    /// Row was completed by a run that predates the completion log.
    Inferred,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CompletionRow {
    #[serde(rename = "Batch")]
    batch_code: String,
    #[serde(rename = "YC URL")]
    url: String,
    #[serde(rename = "Outcome")]
    outcome: CompletionOutcome,
}

/// Append-only log of finished ledger rows keyed by `(batch, url)`.
pub struct CompletionLog {
    path: PathBuf,
    established: bool,
    entries: HashMap<UrlRecord, CompletionOutcome>,
    writer: Option<csv::Writer<File>>,
}

impl CompletionLog {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut entries = HashMap::new();
        let established = path.exists();
        if let Some(bytes) = read_complete_records(&path)? {
            let mut reader = csv::ReaderBuilder::new()
                .trim(csv::Trim::All)
                .from_reader(Cursor::new(bytes));
            for row in reader.deserialize::<CompletionRow>() {
                let row = row.with_context(|| format!("parsing completion log {}", path.display()))?;
                entries.insert(UrlRecord::new(row.batch_code, row.url), row.outcome);
            }
        }
        Ok(Self {
            path,
            established,
            entries,
            writer: None,
        })
    }

    /// False when the log file did not exist at load time.
    pub fn is_established(&self) -> bool {
        self.established
    }

    pub fn outcome(&self, record: &UrlRecord) -> Option<CompletionOutcome> {
        self.entries.get(record).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record(&mut self, record: &UrlRecord, outcome: CompletionOutcome) -> Result<()> {
        self.record_many(std::iter::once(record), outcome)
    }

    pub fn record_many<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a UrlRecord>,
        outcome: CompletionOutcome,
    ) -> Result<()> {
        if self.writer.is_none() {
            self.writer = Some(append_writer(&self.path, &COMPLETION_LOG_HEADER)?);
        }
        let writer = self
            .writer
            .as_mut()
            .context("completion log writer not initialised")?;
        for record in records {
            writer
                .serialize(CompletionRow {
                    batch_code: record.batch_code.clone(),
                    url: record.url.clone(),
                    outcome,
                })
                .with_context(|| format!("appending to completion log {}", self.path.display()))?;
            self.entries.insert(record.clone(), outcome);
        }
        flush_durably(writer, &self.path)
    }
}

/// Whole-file read of a tabular dataset, used by the query surface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
    }
}

pub fn read_table(path: impl AsRef<Path>) -> Result<Table> {
    let path = path.as_ref();
    let bytes = read_complete_records(path)?
        .with_context(|| format!("{} does not exist", path.display()))?;
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(Cursor::new(bytes));
    let headers = reader
        .headers()
        .with_context(|| format!("reading headers of {}", path.display()))?
        .iter()
        .map(ToString::to_string)
        .collect();
    let rows = reader
        .records()
        .map(|row| row.map(|r| r.iter().map(ToString::to_string).collect()))
        .collect::<Result<Vec<Vec<String>>, _>>()
        .with_context(|| format!("reading rows of {}", path.display()))?;
    Ok(Table { headers, rows })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_host_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    timeout: Duration,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }
}

fn host_key(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            timeout: config.timeout,
            backoff: config.backoff,
        })
    }

    /// Whole-request timeout every fetch runs under.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.send_with_retry(url, || self.client.get(url)).await
    }

    /// POST a JSON body, optionally with a bearer token, under the same limits and retries as GET.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        body: &T,
    ) -> Result<FetchedResponse, FetchError> {
        self.send_with_retry(url, || {
            let request = self.client.post(url).json(body);
            match bearer_token {
                Some(token) => request.bearer_auth(token),
                None => request,
            }
        })
        .await
    }

    async fn send_with_retry<F>(&self, url: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let host = host_key(url);
        let per_host = self.per_host_semaphore(&host).await;
        let _host = per_host.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", host = %host, url);
        self.retry_loop(&build).instrument(span).await
    }

    async fn retry_loop<F>(&self, build: &F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying after retryable status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after request error");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}
