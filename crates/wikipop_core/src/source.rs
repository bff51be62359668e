use std::collections::BTreeMap;
use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::WikipopConfig;
use crate::model::{PopularityRecord, PopularityTier};
use crate::timestamp::parse_source_timestamp;

/// Per-run parameters sent alongside the titles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopularityRequest {
    pub lang: String,
    /// Upper bound on returned records. `None` asks for one per title.
    pub max_records: Option<usize>,
}

impl PopularityRequest {
    pub fn nrecs(&self, title_count: usize) -> usize {
        self.max_records.unwrap_or(title_count)
    }
}

pub trait PopularityApi {
    /// One batched lookup for every title. Titles missing from the answer are
    /// simply absent from the returned records.
    fn fetch_popularity(
        &mut self,
        titles: &[String],
        request: &PopularityRequest,
    ) -> Result<Vec<PopularityRecord>>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct PopularityClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl PopularityClientConfig {
    pub fn from_config(config: &WikipopConfig) -> Self {
        Self {
            api_url: config.api_url().unwrap_or_default(),
            user_agent: config.user_agent(),
            timeout_ms: config.source.timeout_ms,
            max_retries: config.source.max_retries,
            retry_delay_ms: config.source.retry_delay_ms,
        }
    }
}

pub struct PopularityClient {
    client: Client,
    config: PopularityClientConfig,
    request_count: usize,
}

impl PopularityClient {
    pub fn new(config: PopularityClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build popularity HTTP client")?;

        Ok(Self {
            client,
            config,
            request_count: 0,
        })
    }

    fn request_json_post(&mut self, form: &[(String, String)]) -> Result<Value> {
        if self.config.api_url.trim().is_empty() {
            bail!(
                "popularity API URL is not configured (set [source].api_url or WIKIPOP_API_URL)"
            );
        }
        let url = Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid popularity API URL: {}", self.config.api_url))?;
        for attempt in 0..=self.config.max_retries {
            self.request_count += 1;
            let response = self
                .client
                .post(url.clone())
                .header("User-Agent", self.config.user_agent.clone())
                .form(&form)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("popularity API request failed with HTTP {status}");
                    }
                    return response
                        .json()
                        .context("failed to decode popularity API JSON response");
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).context("failed to call popularity API");
                }
            }
        }

        bail!("popularity API request exhausted retry budget")
    }

    fn wait_before_retry(&self, attempt: usize) {
        let base = backoff_delay_ms(self.config.retry_delay_ms, attempt);
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let delay_ms = base.saturating_add(jitter);
        debug!(attempt, delay_ms, "retrying popularity API request");
        sleep(Duration::from_millis(delay_ms));
    }
}

impl PopularityApi for PopularityClient {
    fn fetch_popularity(
        &mut self,
        titles: &[String],
        request: &PopularityRequest,
    ) -> Result<Vec<PopularityRecord>> {
        if titles.is_empty() {
            return Ok(Vec::new());
        }
        let payload = self.request_json_post(&popularity_form(titles, request))?;
        parse_popularity_response(payload)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Form body of the single batched lookup: every title joined with `|`.
pub fn popularity_form(titles: &[String], request: &PopularityRequest) -> Vec<(String, String)> {
    let mut form = vec![("format".to_string(), "json".to_string())];
    if !request.lang.is_empty() {
        form.push(("lang".to_string(), request.lang.clone()));
    }
    form.push(("titles".to_string(), titles.join("|")));
    form.push(("nrecs".to_string(), request.nrecs(titles.len()).to_string()));
    form
}

/// Exponential backoff before retry `attempt` (0-based), without jitter.
fn backoff_delay_ms(retry_delay_ms: u64, attempt: usize) -> u64 {
    let exponent = u32::try_from(attempt).unwrap_or(16).min(16);
    retry_delay_ms.saturating_mul(2u64.saturating_pow(exponent))
}

/// Decodes `{"pages": {"<title>": {...}}}`. Entries that do not decode are
/// skipped with a warning instead of failing the whole batch.
pub fn parse_popularity_response(payload: Value) -> Result<Vec<PopularityRecord>> {
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        bail!("popularity API error [{code}]: {info}");
    }

    let parsed: PopularityResponse =
        serde_json::from_value(payload).context("failed to decode popularity API response")?;
    let mut records = Vec::with_capacity(parsed.pages.len());
    for (title, entry) in parsed.pages {
        match decode_entry(&title, entry) {
            Ok(record) => records.push(record),
            Err(error) => warn!(title = %title, "skipping popularity entry: {error:#}"),
        }
    }
    Ok(records)
}

fn decode_entry(title: &str, entry: Value) -> Result<PopularityRecord> {
    let entry: PopularityEntry =
        serde_json::from_value(entry).context("malformed popularity entry")?;
    Ok(PopularityRecord {
        title: title.to_string(),
        pop_timestamp: parse_source_timestamp(&entry.timestamp)?,
        pop_count: entry.pop_count,
        popularity: entry.popularity,
    })
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize, Default)]
struct PopularityResponse {
    #[serde(default)]
    pages: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct PopularityEntry {
    popularity: PopularityTier,
    #[serde(alias = "popcount", alias = "views")]
    pop_count: i64,
    #[serde(alias = "pop_timestamp")]
    timestamp: String,
}
