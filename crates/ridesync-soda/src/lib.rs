//! Socrata SODA client: query building, retrying transport, count oracle.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use ridesync_core::{DateWindow, RemoteRow};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "ridesync-soda";

pub const DEFAULT_BASE_URL: &str = "https://data.ny.gov";
pub const DEFAULT_PAGE_SIZE: usize = 50_000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

const APP_TOKEN_HEADER: &str = "X-App-Token";
const SECRET_TOKEN_HEADER: &str = "X-App-Token-Secret";

/// App/secret tokens for elevated rate limits. Both optional; anonymous
/// access works with tighter throttling.
#[derive(Debug, Clone, Default)]
pub struct SodaCredentials {
    pub app_token: Option<String>,
    pub secret_token: Option<String>,
}

impl SodaCredentials {
    pub fn from_env() -> Self {
        Self {
            app_token: non_empty_env("SOCRATA_APP_TOKEN"),
            secret_token: non_empty_env("SOCRATA_SECRET_TOKEN"),
        }
    }

    /// Apply explicit overrides (CLI flags) on top of whatever the
    /// environment provided.
    pub fn with_overrides(mut self, app_token: Option<String>, secret_token: Option<String>) -> Self {
        if let Some(token) = app_token {
            self.app_token = Some(token);
        }
        if let Some(token) = secret_token {
            self.secret_token = Some(token);
        }
        self
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
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

/// Exponential backoff in whole powers of two, capped.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after `attempt_index` failures (0-based):
    /// 2s, 4s, 8s, ... capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 2u64
            .checked_pow(attempt_index.saturating_add(1).min(32) as u32)
            .unwrap_or(u64::MAX);
        Duration::from_secs(factor).min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum SodaError {
    #[error("request failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: usize,
        source: reqwest::Error,
    },
    #[error("rate limited after {attempts} attempts for {url}")]
    RateLimitExhausted { attempts: usize, url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("dataset not found: {detail}")]
    NotFound { detail: String },
    #[error("unexpected payload shape: {detail}")]
    UnexpectedShape { detail: String },
    #[error("malformed count response: {detail}")]
    MalformedCount { detail: String },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Build the SoQL predicate for a half-open window on the time column.
pub fn where_window(ts_column: &str, window: &DateWindow) -> String {
    format!(
        "{ts_column} >= '{}' AND {ts_column} < '{}'",
        window.start_ts(),
        window.end_ts()
    )
}

/// Predicate for cursor resumption: `>` after a stored cursor, `>=` when
/// starting from the window's own lower bound.
pub fn where_after(ts_column: &str, lower: &str, upper: &str, inclusive_lower: bool) -> String {
    let op = if inclusive_lower { ">=" } else { ">" };
    format!("{ts_column} {op} '{lower}' AND {ts_column} < '{upper}'")
}

/// Total deterministic ordering: time column, dataset tie-breakers, then the
/// synthetic row id so rows sharing a timestamp never straddle page
/// boundaries ambiguously.
pub fn order_clause(ts_column: &str, tie_breakers: &[String]) -> String {
    let mut parts = Vec::with_capacity(tie_breakers.len() + 2);
    parts.push(format!("{ts_column} ASC"));
    for column in tie_breakers {
        parts.push(format!("{column} ASC"));
    }
    parts.push(":id ASC".to_string());
    parts.join(", ")
}

/// One `$limit`/`$offset` page request against a filtered, ordered query.
#[derive(Debug, Clone)]
pub struct PageQuery {
    pub where_clause: String,
    pub order_clause: String,
    pub limit: usize,
    pub offset: u64,
}

impl PageQuery {
    fn params(&self) -> Vec<(String, String)> {
        vec![
            ("$where".to_string(), self.where_clause.clone()),
            ("$order".to_string(), self.order_clause.clone()),
            ("$limit".to_string(), self.limit.to_string()),
            ("$offset".to_string(), self.offset.to_string()),
        ]
    }
}

/// Remote query surface the sync engine runs against. Implemented by
/// [`SodaClient`]; engine tests substitute an in-memory fake.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// `$select count(1)` under the predicate. An empty result is 0; a
    /// malformed count cell is an error, never silently 0.
    async fn count(&self, dataset_id: &str, where_clause: &str) -> Result<u64, SodaError>;

    /// Number of distinct calendar days with any row under the predicate.
    async fn distinct_days(
        &self,
        dataset_id: &str,
        ts_column: &str,
        where_clause: &str,
    ) -> Result<u64, SodaError>;

    /// One page of rows.
    async fn page(&self, dataset_id: &str, query: &PageQuery) -> Result<Vec<RemoteRow>, SodaError>;
}

#[derive(Debug)]
pub struct SodaClient {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl SodaClient {
    pub fn new(credentials: &SodaCredentials, timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = &credentials.app_token {
            headers.insert(APP_TOKEN_HEADER, HeaderValue::from_str(token)?);
        }
        if let Some(token) = &credentials.secret_token {
            headers.insert(SECRET_TOKEN_HEADER, HeaderValue::from_str(token)?);
        }

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            backoff: BackoffPolicy::default(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn endpoint(&self, dataset_id: &str) -> String {
        format!("{}/resource/{dataset_id}.json", self.base_url)
    }

    /// GET with retry: transport failures and 429/5xx back off exponentially
    /// up to the retry ceiling; other failures and malformed payloads are
    /// terminal immediately.
    async fn request_rows(
        &self,
        dataset_id: &str,
        params: &[(String, String)],
    ) -> Result<Vec<RemoteRow>, SodaError> {
        let url = self.endpoint(dataset_id);
        let mut last_transport_error: Option<reqwest::Error> = None;

        for attempt in 0..self.backoff.max_retries {
            let response = self.client.get(&url).query(params).send().await;

            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt + 1 < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(%url, attempt, ?delay, "transport error, backing off");
                        last_transport_error = Some(err);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(SodaError::RetriesExhausted {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
            };

            let status = response.status();
            if !status.is_success() {
                if classify_status(status) == RetryDisposition::Retryable
                    && attempt + 1 < self.backoff.max_retries
                {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(%url, %status, attempt, ?delay, "rate limited or server error, backing off");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                if status == StatusCode::TOO_MANY_REQUESTS {
                    return Err(SodaError::RateLimitExhausted {
                        attempts: attempt + 1,
                        url,
                    });
                }
                return Err(SodaError::HttpStatus {
                    status: status.as_u16(),
                    url,
                });
            }

            let payload: JsonValue = response.json().await?;
            return match payload {
                JsonValue::Array(items) => items
                    .into_iter()
                    .map(|item| match item {
                        JsonValue::Object(row) => Ok(row),
                        other => Err(SodaError::UnexpectedShape {
                            detail: format!("array element is not an object: {other}"),
                        }),
                    })
                    .collect(),
                JsonValue::Object(body)
                    if body.get("code").and_then(JsonValue::as_str) == Some("not_found") =>
                {
                    Err(SodaError::NotFound {
                        detail: serde_json::to_string(&body).unwrap_or_default(),
                    })
                }
                other => Err(SodaError::UnexpectedShape {
                    detail: format!("expected a JSON array, got {other}"),
                }),
            };
        }

        match last_transport_error {
            Some(source) => Err(SodaError::RetriesExhausted {
                attempts: self.backoff.max_retries,
                source,
            }),
            None => Err(SodaError::RateLimitExhausted {
                attempts: self.backoff.max_retries,
                url,
            }),
        }
    }
}

fn parse_count(rows: &[RemoteRow]) -> Result<u64, SodaError> {
    let Some(first) = rows.first() else {
        return Ok(0);
    };
    let cell = if first.len() == 1 {
        first.values().next()
    } else {
        first.get("count").or_else(|| first.get("count_1"))
    };
    let parsed = match cell {
        Some(JsonValue::String(text)) => text.parse::<u64>().ok(),
        Some(JsonValue::Number(number)) => number.as_u64(),
        _ => None,
    };
    parsed.ok_or_else(|| SodaError::MalformedCount {
        detail: serde_json::to_string(rows).unwrap_or_default(),
    })
}

#[async_trait]
impl RemoteSource for SodaClient {
    async fn count(&self, dataset_id: &str, where_clause: &str) -> Result<u64, SodaError> {
        let params = vec![
            ("$select".to_string(), "count(1)".to_string()),
            ("$where".to_string(), where_clause.to_string()),
        ];
        let rows = self
            .request_rows(dataset_id, &params)
            .instrument(info_span!("soda_count", dataset_id))
            .await?;
        parse_count(&rows)
    }

    async fn distinct_days(
        &self,
        dataset_id: &str,
        ts_column: &str,
        where_clause: &str,
    ) -> Result<u64, SodaError> {
        let params = vec![
            (
                "$select".to_string(),
                format!("date_trunc_ymd({ts_column}) AS day"),
            ),
            ("$where".to_string(), where_clause.to_string()),
            ("$group".to_string(), "day".to_string()),
        ];
        let rows = self
            .request_rows(dataset_id, &params)
            .instrument(info_span!("soda_distinct_days", dataset_id))
            .await?;
        Ok(rows.len() as u64)
    }

    async fn page(&self, dataset_id: &str, query: &PageQuery) -> Result<Vec<RemoteRow>, SodaError> {
        self.request_rows(dataset_id, &query.params())
            .instrument(info_span!("soda_page", dataset_id, offset = query.offset))
            .await
    }
}
