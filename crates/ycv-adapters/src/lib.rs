//! Capability contracts (render, extract) and the directory adapters built on them:
//! the listing page collector and the detail-page fetcher.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;
use ycv_core::{CompanyExtract, ValidationError};
use ycv_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "ycv-adapters";

pub const DEFAULT_DIRECTORY_URL: &str = "https://www.ycombinator.com";

/// Category listings that live under `/companies/` but are not companies.
pub const DEFAULT_EXCLUSIONS: [&str; 4] = [
    "founders",
    "black-founders",
    "hispanic-latino-founders",
    "women-founders",
];

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("timed out after {after:?} loading {url}")]
    Timeout { url: String, after: Duration },
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// A page loaded by a renderer that can still be scrolled and inspected.
#[async_trait]
pub trait RenderedPage: Send {
    async fn scroll_height(&mut self) -> Result<u64, RenderError>;
    async fn scroll_to_bottom(&mut self) -> Result<(), RenderError>;
    async fn html(&mut self) -> Result<String, RenderError>;
    /// Every hyperlink currently on the page, resolved to absolute URLs where possible.
    async fn links(&mut self) -> Result<Vec<String>, RenderError>;
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn RenderedPage>, RenderError>;
}

/// Renderer for server-rendered pages: a plain GET, no script execution.
/// The document never grows, so plateau detection settles after one probe.
pub struct StaticHttpRenderer {
    http: Arc<HttpFetcher>,
}

impl StaticHttpRenderer {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PageRenderer for StaticHttpRenderer {
    async fn open(&self, url: &str) -> Result<Box<dyn RenderedPage>, RenderError> {
        let response = self.http.fetch_bytes(url).await.map_err(|err| {
            if err.is_timeout() {
                RenderError::Timeout {
                    url: url.to_string(),
                    after: self.http.timeout(),
                }
            } else {
                RenderError::Fetch(err)
            }
        })?;
        let base = Url::parse(&response.final_url).map_err(|e| RenderError::Navigation {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        Ok(Box::new(StaticPage {
            base,
            html: response.text(),
        }))
    }
}

struct StaticPage {
    base: Url,
    html: String,
}

#[async_trait]
impl RenderedPage for StaticPage {
    async fn scroll_height(&mut self) -> Result<u64, RenderError> {
        Ok(self.html.len() as u64)
    }

    async fn scroll_to_bottom(&mut self) -> Result<(), RenderError> {
        Ok(())
    }

    async fn html(&mut self) -> Result<String, RenderError> {
        Ok(self.html.clone())
    }

    async fn links(&mut self) -> Result<Vec<String>, RenderError> {
        Ok(extract_links(&self.html, Some(&self.base)))
    }
}

/// All `a[href]` targets in document order, joined onto `base` when relative.
pub fn extract_links(html: &str, base: Option<&Url>) -> Vec<String> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    document
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| match base {
            Some(base) => base.join(href).ok().map(|u| u.to_string()),
            None => Some(href.to_string()),
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct ScrollPolicy {
    /// Wait before each scroll command.
    pub pause_before: Duration,
    /// Wait after each scroll command before re-reading the height.
    pub settle: Duration,
    /// Upper bound on scroll commands for pages that keep growing.
    pub max_scrolls: usize,
}

impl Default for ScrollPolicy {
    fn default() -> Self {
        Self {
            pause_before: Duration::from_millis(400),
            settle: Duration::from_millis(200),
            max_scrolls: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollReport {
    pub scrolls: usize,
    /// Scrolls after which the page height increased.
    pub growth_steps: usize,
    pub final_height: u64,
}

/// Scroll to the bottom until the page height stops increasing.
pub async fn scroll_until_stable(
    page: &mut dyn RenderedPage,
    policy: &ScrollPolicy,
) -> Result<ScrollReport, RenderError> {
    let mut last_height = page.scroll_height().await?;
    let mut report = ScrollReport {
        scrolls: 0,
        growth_steps: 0,
        final_height: last_height,
    };

    let mut settled = false;
    while report.scrolls < policy.max_scrolls {
        tokio::time::sleep(policy.pause_before).await;
        page.scroll_to_bottom().await?;
        report.scrolls += 1;
        tokio::time::sleep(policy.settle).await;

        let new_height = page.scroll_height().await?;
        if new_height <= last_height {
            settled = true;
            break;
        }
        report.growth_steps += 1;
        last_height = new_height;
    }

    if !settled && policy.max_scrolls > 0 {
        warn!(max_scrolls = policy.max_scrolls, "page still growing at scroll limit");
    }
    report.final_height = last_height;
    Ok(report)
}

/// True for `/companies/<slug>` pages whose path contains none of `exclusions`.
pub fn is_company_detail(url: &Url, exclusions: &HashSet<String>) -> bool {
    let Some(segments) = url.path_segments() else {
        return false;
    };
    let segments = segments.filter(|s| !s.is_empty()).collect::<Vec<_>>();
    if segments.len() != 2 || segments[0] != "companies" {
        return false;
    }
    !exclusions
        .iter()
        .any(|excluded| url.path().contains(excluded.as_str()))
}

/// Keep detail-page links, resolving relative ones against `base`. Order is preserved.
pub fn filter_detail_links(links: &[String], base: &Url, exclusions: &HashSet<String>) -> Vec<String> {
    links
        .iter()
        .filter_map(|link| Url::parse(link).or_else(|_| base.join(link)).ok())
        .filter(|url| is_company_detail(url, exclusions))
        .map(|mut url| {
            url.set_fragment(None);
            url.to_string()
        })
        .collect()
}

pub fn default_exclusions() -> HashSet<String> {
    DEFAULT_EXCLUSIONS.iter().map(|s| s.to_string()).collect()
}

/// Loads a batch's listing page, scrolls until it settles and returns its company links.
pub struct PageCollector {
    renderer: Arc<dyn PageRenderer>,
    directory_url: Url,
    scroll: ScrollPolicy,
    page_timeout: Duration,
}

impl PageCollector {
    pub fn new(
        renderer: Arc<dyn PageRenderer>,
        directory_url: Url,
        scroll: ScrollPolicy,
        page_timeout: Duration,
    ) -> Self {
        Self {
            renderer,
            directory_url,
            scroll,
            page_timeout,
        }
    }

    pub fn listing_url(&self, batch_code: &str) -> Url {
        let mut url = self
            .directory_url
            .join("/companies")
            .unwrap_or_else(|_| self.directory_url.clone());
        url.query_pairs_mut().clear().append_pair("batch", batch_code);
        url
    }

    /// Never fails: a timeout or render error is logged and yields no links,
    /// leaving the batch eligible for a retry by the caller.
    pub async fn collect(&self, batch_code: &str, exclusions: &HashSet<String>) -> Vec<String> {
        match self.try_collect(batch_code, exclusions).await {
            Ok(urls) => urls,
            Err(err) => {
                warn!(batch = batch_code, error = %err, "listing page failed");
                Vec::new()
            }
        }
    }

    async fn try_collect(
        &self,
        batch_code: &str,
        exclusions: &HashSet<String>,
    ) -> Result<Vec<String>, RenderError> {
        let listing_url = self.listing_url(batch_code);
        let mut page = open_with_timeout(self.renderer.as_ref(), listing_url.as_str(), self.page_timeout).await?;

        let report = scroll_until_stable(page.as_mut(), &self.scroll).await?;
        debug!(
            batch = batch_code,
            scrolls = report.scrolls,
            height = report.final_height,
            "listing settled"
        );

        let links = page.links().await?;
        Ok(filter_detail_links(&links, &listing_url, exclusions))
    }
}

async fn open_with_timeout(
    renderer: &dyn PageRenderer,
    url: &str,
    timeout: Duration,
) -> Result<Box<dyn RenderedPage>, RenderError> {
    match tokio::time::timeout(timeout, renderer.open(url)).await {
        Ok(result) => result,
        Err(_) => Err(RenderError::Timeout {
            url: url.to_string(),
            after: timeout,
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailPage {
    pub url: String,
    pub html: String,
    pub links: Vec<String>,
}

/// Loads company detail pages for extraction.
pub struct DetailFetcher {
    renderer: Arc<dyn PageRenderer>,
    scroll: ScrollPolicy,
    page_timeout: Duration,
}

impl DetailFetcher {
    pub fn new(renderer: Arc<dyn PageRenderer>, scroll: ScrollPolicy, page_timeout: Duration) -> Self {
        Self {
            renderer,
            scroll,
            page_timeout,
        }
    }

    pub async fn fetch(&self, url: &str) -> Result<DetailPage, RenderError> {
        let mut page = open_with_timeout(self.renderer.as_ref(), url, self.page_timeout).await?;
        scroll_until_stable(page.as_mut(), &self.scroll).await?;
        Ok(DetailPage {
            url: url.to_string(),
            html: page.html().await?,
            links: page.links().await?,
        })
    }
}

fn collapse_text<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text handed to the extraction capability, or `None` when the page has no usable content.
///
/// The directory embeds the company payload in a `div[data-page]` attribute; pages without it
/// fall back to the visible text of `<main>` or `<body>`. Off-site links (founder profiles,
/// company website) are listed after the content.
pub fn detail_text(page: &DetailPage) -> Option<String> {
    let document = Html::parse_document(&page.html);
    let payload = Selector::parse("div[data-page]").ok()?;
    let main = Selector::parse("main").ok()?;
    let body = Selector::parse("body").ok()?;

    let content = document
        .select(&payload)
        .next()
        .and_then(|node| node.value().attr("data-page"))
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .or_else(|| {
            document
                .select(&main)
                .chain(document.select(&body))
                .map(|node| collapse_text(node.text()))
                .find(|text| !text.is_empty())
        })?;

    let own_host = Url::parse(&page.url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string));
    let mut seen = HashSet::new();
    let external = page
        .links
        .iter()
        .filter_map(|link| Url::parse(link).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .filter(|url| url.host_str().map(str::to_string) != own_host)
        .map(|url| url.to_string())
        .filter(|link| seen.insert(link.clone()))
        .collect::<Vec<_>>();

    if external.is_empty() {
        return Some(content);
    }
    let links = external
        .iter()
        .map(|l| format!("- {l}"))
        .collect::<Vec<_>>()
        .join("\n");
    Some(format!("{content}\n\nLinks:\n{links}"))
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extracted record failed validation: {0}")]
    Validation(#[from] ValidationError),
    #[error("extractor returned an unusable response: {0}")]
    Malformed(String),
    #[error("extractor request failed: {0}")]
    Transport(#[from] FetchError),
}

/// Free text in, structured company out. Implementations may fail validation.
#[async_trait]
pub trait CompanyExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<CompanyExtract, ExtractError>;
}

pub const EXTRACTION_SYSTEM_PROMPT: &str = "You are an advanced company details extractor. \
Extract the company described by the user without any additional context or commentary. \
You must not include any commas in any value. \
Answer with a single JSON object with the keys: \
name (string), batch (YC batch code: W winter, S summer, F fall, X spring, e.g. S24), \
status (one of Active, Inactive, Acquired, Public), industry (string or null), \
team_size (integer or null), city (HQ city name only, or null), \
founders (array of objects with first_name, last_name, linkedin_url, twitter_url; \
first name only, no nicknames; URLs or null).";

#[derive(Debug, Clone)]
pub struct ChatExtractorConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Total requests per row, counting re-asks after a validation failure.
    pub max_attempts: usize,
}

impl Default for ChatExtractorConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            max_attempts: 3,
        }
    }
}

/// Extraction over an OpenAI-compatible `/chat/completions` endpoint in JSON mode.
pub struct ChatCompletionsExtractor {
    http: Arc<HttpFetcher>,
    config: ChatExtractorConfig,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Pull the assistant message out of a chat-completions response body.
pub fn chat_content(body: &[u8]) -> Result<String, ExtractError> {
    let response: ChatResponse = serde_json::from_slice(body)
        .map_err(|e| ExtractError::Malformed(format!("chat response: {e}")))?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| ExtractError::Malformed("chat response has no message content".into()))
}

/// Parse the assistant message as a company payload, tolerating a fenced code block.
pub fn parse_company_json(content: &str) -> Result<CompanyExtract, ExtractError> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(unfenced.trim())
        .map_err(|e| ExtractError::Malformed(format!("company JSON: {e}")))
}

impl ChatCompletionsExtractor {
    pub fn new(http: Arc<HttpFetcher>, config: ChatExtractorConfig) -> Self {
        Self { http, config }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.api_base.trim_end_matches('/'))
    }
}

#[async_trait]
impl CompanyExtractor for ChatCompletionsExtractor {
    async fn extract(&self, text: &str) -> Result<CompanyExtract, ExtractError> {
        let mut messages: Vec<JsonValue> = vec![
            json!({"role": "system", "content": EXTRACTION_SYSTEM_PROMPT}),
            json!({"role": "user", "content": text}),
        ];
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = ExtractError::Malformed("no attempt made".into());

        for attempt in 1..=attempts {
            let body = json!({
                "model": self.config.model,
                "temperature": 0,
                "response_format": {"type": "json_object"},
                "messages": messages,
            });
            let response = self
                .http
                .post_json(&self.endpoint(), self.config.api_key.as_deref(), &body)
                .await?;
            let content = chat_content(&response.body)?;

            let problem = match parse_company_json(&content) {
                Ok(extract) => match extract.clone().validate() {
                    Ok(_) => return Ok(extract),
                    Err(err) => {
                        let message = err.to_string();
                        last_error = ExtractError::Validation(err);
                        message
                    }
                },
                Err(err) => {
                    let message = err.to_string();
                    last_error = err;
                    message
                }
            };

            info!(attempt, attempts, %problem, "re-asking extractor");
            messages.push(json!({"role": "assistant", "content": content}));
            messages.push(json!({
                "role": "user",
                "content": format!("That answer was rejected: {problem}. Reply with the corrected JSON object only."),
            }));
        }

        Err(last_error)
    }
}
