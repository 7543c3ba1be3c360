//! Read-only JSON API over the harvested datasets (one `YYYY-MM-DD` directory per run).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::info;
use ycv_core::{CompanyStatus, COMPANY_HEADER, FOUNDER_HEADER};
use ycv_storage::{read_table, Table, COMPANY_SINK_FILE, FOUNDER_SINK_FILE};

pub const CRATE_NAME: &str = "ycv-web";

pub const API_TITLE: &str = "YC Vault API";

#[derive(Clone)]
pub struct AppState {
    pub data_dir: PathBuf,
}

impl AppState {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }
}

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unprocessable(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            ApiError::Unprocessable(detail) => (StatusCode::UNPROCESSABLE_ENTITY, detail),
            ApiError::Internal(err) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize, Default)]
struct PageQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct CompaniesQuery {
    date: Option<String>,
    batch: Option<String>,
    status: Option<String>,
    industry: Option<String>,
    city: Option<String>,
    team_size: Option<u32>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct FoundersQuery {
    date: Option<String>,
    batch: Option<String>,
    status: Option<String>,
    industry: Option<String>,
    city: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DatasetFile {
    pub filename: String,
    pub size_bytes: u64,
    pub extension: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CompanyRow {
    pub name: String,
    pub batch: String,
    pub status: String,
    pub industry: Option<String>,
    pub team_size: Option<u32>,
    pub city: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FounderRow {
    pub first_name: String,
    pub last_name: String,
    pub company_count: usize,
    pub founder_linkedin_url: Option<String>,
    pub founder_twitter_url: Option<String>,
    pub companies: Vec<CompanyRow>,
}

#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub dataset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_message: Option<String>,
    pub total_records: usize,
    pub limit: Option<usize>,
    pub offset: usize,
    pub data: Vec<T>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/v1/datasets", get(list_datasets_handler))
        .route("/v1/datasets/{date}", get(dataset_files_handler))
        .route("/v1/datasets/{date}/{file}", get(dataset_rows_handler))
        .route("/v1/companies", get(companies_handler))
        .route("/v1/founders", get(founders_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, data_dir = %state.data_dir.display(), "serving dataset api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn root_handler() -> Json<JsonValue> {
    Json(json!({
        "name": API_TITLE,
        "version": env!("CARGO_PKG_VERSION"),
        "description": "API for accessing Y Combinator startup data",
    }))
}

async fn list_datasets_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<String>> {
    let data_dir = state.data_dir.clone();
    let datasets = blocking(move || Ok(list_datasets(&data_dir)?)).await?;
    Ok(Json(datasets))
}

async fn dataset_files_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(date): AxumPath<String>,
) -> ApiResult<JsonValue> {
    let dir = dataset_dir(&state.data_dir, &date)?;
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(&dir)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ApiError::Internal(e.into()))?
    {
        let meta = entry.metadata().await.map_err(|e| ApiError::Internal(e.into()))?;
        if !meta.is_file() {
            continue;
        }
        let path = entry.path();
        files.push(DatasetFile {
            filename: entry.file_name().to_string_lossy().into_owned(),
            size_bytes: meta.len(),
            extension: path
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default(),
        });
    }
    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(Json(json!({ "dataset": date, "files": files })))
}

async fn dataset_rows_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((date, file)): AxumPath<(String, String)>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Page<JsonMap<String, JsonValue>>> {
    let dir = dataset_dir(&state.data_dir, &date)?;
    if !is_plain_file_name(&file) {
        return Err(ApiError::BadRequest(format!("invalid file name: {file}")));
    }
    let path = dir.join(&file);
    if !path.is_file() {
        return Err(ApiError::NotFound(format!("File {file} not found in dataset {date}")));
    }
    if !file.ends_with(".csv") {
        return Err(ApiError::BadRequest(format!("Unsupported file format: {file}")));
    }

    let table = blocking(move || Ok(read_table(&path)?)).await?;
    let records = table
        .rows
        .iter()
        .map(|row| {
            table
                .headers
                .iter()
                .enumerate()
                .map(|(i, header)| {
                    let value = row
                        .get(i)
                        .filter(|v| !v.is_empty())
                        .map(|v| JsonValue::String(v.clone()))
                        .unwrap_or(JsonValue::Null);
                    (header.clone(), value)
                })
                .collect::<JsonMap<_, _>>()
        })
        .collect::<Vec<_>>();

    let (total_records, offset, data) = paginate(records, query.limit, query.offset);
    Ok(Json(Page {
        dataset: date,
        file: Some(file),
        date_message: None,
        total_records,
        limit: query.limit,
        offset,
        data,
    }))
}

async fn companies_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CompaniesQuery>,
) -> ApiResult<Page<CompanyRow>> {
    let status = parse_status(query.status.as_deref())?;
    let (dataset, date_message, table) =
        load_nearest_sink(&state, query.date.clone(), COMPANY_SINK_FILE, "Companies").await?;

    let filter = CompanyFilter {
        batch: query.batch.as_deref(),
        status,
        industry: query.industry.as_deref(),
        city: query.city.as_deref(),
        team_size: query.team_size,
    };
    let columns = CompanyColumns::locate(&table);
    let rows = table
        .rows
        .iter()
        .map(|row| columns.company(row))
        .filter(|company| filter.matches(company))
        .collect::<Vec<_>>();

    let (total_records, offset, data) = paginate(rows, query.limit, query.offset);
    Ok(Json(Page {
        dataset,
        file: None,
        date_message,
        total_records,
        limit: query.limit,
        offset,
        data,
    }))
}

async fn founders_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FoundersQuery>,
) -> ApiResult<Page<FounderRow>> {
    let status = parse_status(query.status.as_deref())?;
    let (dataset, date_message, table) =
        load_nearest_sink(&state, query.date.clone(), FOUNDER_SINK_FILE, "Founders").await?;

    let filter = CompanyFilter {
        batch: query.batch.as_deref(),
        status,
        industry: query.industry.as_deref(),
        city: query.city.as_deref(),
        team_size: None,
    };
    let columns = CompanyColumns::locate(&table);
    let first_col = table.column(FOUNDER_HEADER[6]);
    let last_col = table.column(FOUNDER_HEADER[7]);
    let linkedin_col = table.column(FOUNDER_HEADER[8]);
    let twitter_col = table.column(FOUNDER_HEADER[9]);

    let mut founders: Vec<FounderRow> = Vec::new();
    let mut by_name: HashMap<(String, String), usize> = HashMap::new();
    for row in &table.rows {
        let company = columns.company(row);
        if !filter.matches(&company) {
            continue;
        }
        let first = cell(row, first_col).unwrap_or_default();
        let last = cell(row, last_col).unwrap_or_default();
        if !contains_ci(Some(&first), query.first_name.as_deref())
            || !contains_ci(Some(&last), query.last_name.as_deref())
        {
            continue;
        }

        let key = (first.clone(), last.clone());
        let index = *by_name.entry(key).or_insert_with(|| {
            founders.push(FounderRow {
                first_name: first,
                last_name: last,
                company_count: 0,
                founder_linkedin_url: cell(row, linkedin_col),
                founder_twitter_url: cell(row, twitter_col),
                companies: Vec::new(),
            });
            founders.len() - 1
        });
        let founder = &mut founders[index];
        founder.company_count += 1;
        founder.companies.push(company);
    }

    let (total_records, offset, data) = paginate(founders, query.limit, query.offset);
    Ok(Json(Page {
        dataset,
        file: None,
        date_message,
        total_records,
        limit: query.limit,
        offset,
        data,
    }))
}

fn is_dataset_name(name: &str) -> bool {
    NaiveDate::parse_from_str(name, "%Y-%m-%d").is_ok() && name.len() == 10
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && name != "." && name != ".."
}

/// Dataset directory names, newest first.
pub fn list_datasets(data_dir: &Path) -> anyhow::Result<Vec<String>> {
    if !data_dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = std::fs::read_dir(data_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| is_dataset_name(name))
        .collect::<Vec<_>>();
    names.sort_unstable_by(|a, b| b.cmp(a));
    Ok(names)
}

/// The dataset for `target`: exact match, else the newest one before it, else the oldest.
/// A missing or malformed target selects today, then the same rule.
pub fn nearest_dataset(datasets: &[String], target: Option<&str>) -> Option<String> {
    let today = Utc::now().format("%Y-%m-%d").to_string();
    let target = match target {
        Some(t) if is_dataset_name(t) => t.to_string(),
        Some(_) => return datasets.first().cloned(),
        None => today,
    };
    datasets
        .iter()
        .find(|d| d.as_str() <= target.as_str())
        .or_else(|| datasets.last())
        .cloned()
}

fn resolve_dataset(data_dir: &Path, requested: Option<&str>) -> Result<(String, Option<String>), ApiError> {
    let datasets = list_datasets(data_dir)?;
    let dataset = nearest_dataset(&datasets, requested)
        .ok_or_else(|| ApiError::NotFound("No datasets found".into()))?;
    let message = requested.filter(|r| *r != dataset).map(|r| {
        format!("Requested date {r} not found. Using nearest available date: {dataset}")
    });
    Ok((dataset, message))
}

fn dataset_dir(data_dir: &Path, date: &str) -> Result<PathBuf, ApiError> {
    let dir = data_dir.join(date);
    if !is_plain_file_name(date) || !dir.is_dir() {
        return Err(ApiError::NotFound(format!("Dataset for {date} not found")));
    }
    Ok(dir)
}

fn load_sink(data_dir: &Path, dataset: &str, file: &str, label: &str) -> Result<Table, ApiError> {
    let path = data_dir.join(dataset).join(file);
    if !path.is_file() {
        return Err(ApiError::NotFound(format!("{label} data not found in dataset {dataset}")));
    }
    Ok(read_table(&path)?)
}

/// Resolve the dataset nearest to `requested` and read one of its sinks.
async fn load_nearest_sink(
    state: &AppState,
    requested: Option<String>,
    file: &'static str,
    label: &'static str,
) -> Result<(String, Option<String>, Table), ApiError> {
    let data_dir = state.data_dir.clone();
    blocking(move || {
        let (dataset, message) = resolve_dataset(&data_dir, requested.as_deref())?;
        let table = load_sink(&data_dir, &dataset, file, label)?;
        Ok((dataset, message, table))
    })
    .await
}

/// Whole-file CSV reads run on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?
}

fn parse_status(raw: Option<&str>) -> Result<Option<CompanyStatus>, ApiError> {
    raw.map(|s| s.parse::<CompanyStatus>())
        .transpose()
        .map_err(|e| ApiError::Unprocessable(e.to_string()))
}

fn cell(row: &[String], col: Option<usize>) -> Option<String> {
    col.and_then(|i| row.get(i))
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn contains_ci(value: Option<&str>, needle: Option<&str>) -> bool {
    match needle {
        None => true,
        Some(needle) => value
            .map(|v| v.to_lowercase().contains(&needle.to_lowercase()))
            .unwrap_or(false),
    }
}

struct CompanyColumns {
    name: Option<usize>,
    batch: Option<usize>,
    status: Option<usize>,
    industry: Option<usize>,
    team_size: Option<usize>,
    city: Option<usize>,
}

impl CompanyColumns {
    fn locate(table: &Table) -> Self {
        Self {
            name: table.column(COMPANY_HEADER[0]),
            batch: table.column(COMPANY_HEADER[1]),
            status: table.column(COMPANY_HEADER[2]),
            industry: table.column(COMPANY_HEADER[3]),
            team_size: table.column(COMPANY_HEADER[4]),
            city: table.column(COMPANY_HEADER[5]).or_else(|| table.column("City")),
        }
    }

    fn company(&self, row: &[String]) -> CompanyRow {
        CompanyRow {
            name: cell(row, self.name).unwrap_or_default(),
            batch: cell(row, self.batch).unwrap_or_default(),
            status: cell(row, self.status).unwrap_or_default(),
            industry: cell(row, self.industry),
            team_size: cell(row, self.team_size).and_then(|v| v.parse().ok()),
            city: cell(row, self.city),
        }
    }
}

struct CompanyFilter<'a> {
    batch: Option<&'a str>,
    status: Option<CompanyStatus>,
    industry: Option<&'a str>,
    city: Option<&'a str>,
    team_size: Option<u32>,
}

impl CompanyFilter<'_> {
    fn matches(&self, company: &CompanyRow) -> bool {
        self.batch
            .map_or(true, |b| company.batch.eq_ignore_ascii_case(b))
            && self.status.map_or(true, |s| company.status == s.as_str())
            && contains_ci(company.industry.as_deref(), self.industry)
            && contains_ci(company.city.as_deref(), self.city)
            && self.team_size.map_or(true, |n| company.team_size == Some(n))
    }
}

/// Offset/limit slice; returns the pre-slice total and the effective offset.
fn paginate<T>(rows: Vec<T>, limit: Option<usize>, offset: Option<usize>) -> (usize, usize, Vec<T>) {
    let total = rows.len();
    let offset = offset.unwrap_or(0);
    let page = rows
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect();
    (total, offset, page)
}
