//! Rate-limited HTTP access to upstream sources. Every call is a single
//! attempt; retries belong to callers via [`crate::RetryPolicy`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid response body from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("http client is shut down")]
    Closed,
}

impl FetchError {
    /// Timeouts, connection failures, 5xx and 429 are worth retrying and
    /// count toward outage detection.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            FetchError::HttpStatus { status, .. } => {
                matches!(*status, 408 | 429) || (500..600).contains(status)
            }
            FetchError::Decode { .. } | FetchError::Closed => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 429, .. })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    /// Applied to each source id separately.
    pub request_budget: Option<RequestBudgetConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            request_budget: None,
        }
    }
}

/// Requests per minute to one upstream, with up to `burst` sent back to back
/// before spacing kicks in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestBudgetConfig {
    pub per_minute: u32,
    pub burst: u32,
}

impl RequestBudgetConfig {
    /// Burst of a tenth of the minute's budget.
    pub fn per_minute(per_minute: u32) -> Self {
        let per_minute = per_minute.max(1);
        Self {
            per_minute,
            burst: (per_minute / 10).max(1),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(60) / self.per_minute.max(1)
    }
}

/// Evenly spaced request slots. Each caller reserves the next slot under the
/// lock and sleeps outside it, so waiters are served in arrival order.
#[derive(Debug)]
pub struct RequestBudget {
    interval: Duration,
    burst_window: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestBudget {
    pub fn new(config: RequestBudgetConfig) -> Self {
        let interval = config.interval();
        Self {
            interval,
            burst_window: interval * config.burst.max(1).saturating_sub(1),
            next_slot: Mutex::new(None),
        }
    }

    /// How long the caller arriving at `now` must wait for its slot.
    pub async fn reserve(&self, now: Instant) -> Duration {
        let mut next_slot = self.next_slot.lock().await;
        let slot = next_slot.map_or(now, |slot| slot.max(now));
        *next_slot = Some(slot + self.interval);
        slot.saturating_duration_since(now)
            .saturating_sub(self.burst_window)
    }

    pub async fn acquire(&self) {
        let wait = self.reserve(Instant::now()).await;
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "request budget exhausted, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Per-source limits: a concurrency cap and an optional request budget.
#[derive(Debug)]
struct SourceGate {
    in_flight: Semaphore,
    budget: Option<RequestBudget>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|err| FetchError::Decode {
            url: self.final_url.clone(),
            message: err.to_string(),
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Shared client for the listing, award and analysis upstreams. Concurrency
/// is bounded globally and per source id.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Semaphore,
    per_source_limit: usize,
    request_budget: Option<RequestBudgetConfig>,
    sources: Mutex<HashMap<String, Arc<SourceGate>>>,
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
            global_limit: Semaphore::new(config.global_concurrency.max(1)),
            per_source_limit: config.per_source_concurrency.max(1),
            request_budget: config.request_budget,
            sources: Mutex::new(HashMap::new()),
        })
    }

    async fn source_gate(&self, source_id: &str) -> Arc<SourceGate> {
        let mut sources = self.sources.lock().await;
        sources
            .entry(source_id.to_string())
            .or_insert_with(|| {
                Arc::new(SourceGate {
                    in_flight: Semaphore::new(self.per_source_limit),
                    budget: self.request_budget.map(RequestBudget::new),
                })
            })
            .clone()
    }

    pub async fn get(
        &self,
        source_id: &str,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let request = self.client.get(url).query(query);
        self.send(source_id, url, request).await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        source_id: &str,
        url: &str,
        query: &[(String, String)],
    ) -> Result<T, FetchError> {
        self.get(source_id, url, query).await?.json()
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        source_id: &str,
        url: &str,
        body: &B,
        bearer_token: Option<&str>,
    ) -> Result<T, FetchError> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }
        self.send(source_id, url, request).await?.json()
    }

    async fn send(
        &self,
        source_id: &str,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let gate = self.source_gate(source_id).await;
        let _source = gate.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;
        if let Some(budget) = &gate.budget {
            budget.acquire().await;
        }
        let _global = self.global_limit.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", source_id, url);
        async move {
            let resp = request.send().await.map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            debug!(status = status.as_u16(), "upstream responded");

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|source| FetchError::Request {
                    url: final_url.clone(),
                    source,
                })?
                .to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
