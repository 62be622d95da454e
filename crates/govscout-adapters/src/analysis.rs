use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use govscout_core::{AnalysisResult, OpportunitySummary};
use govscout_storage::{FetchError, HttpFetcher, RetryPolicy};
use tracing::{info, warn};

use crate::batch::{process_in_groups, BatchConfig};

/// The language-model analysis service. One call per opportunity summary.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(&self, summary: &OpportunitySummary) -> Result<AnalysisResult, FetchError>;
}

pub struct HttpAnalysisService {
    http: Arc<HttpFetcher>,
    url: String,
    api_key: Option<String>,
}

impl HttpAnalysisService {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            url: url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl AnalysisService for HttpAnalysisService {
    async fn analyze(&self, summary: &OpportunitySummary) -> Result<AnalysisResult, FetchError> {
        self.http
            .post_json("analysis", &self.url, summary, self.api_key.as_deref())
            .await
    }
}

/// Batches summaries to the analysis service. Per-item failures are logged
/// and left out of the result, never raised.
#[derive(Clone)]
pub struct AnalysisAdapter {
    service: Arc<dyn AnalysisService>,
    retry: RetryPolicy,
    batching: BatchConfig,
}

impl AnalysisAdapter {
    pub fn new(service: Arc<dyn AnalysisService>, retry: RetryPolicy, batching: BatchConfig) -> Self {
        Self {
            service,
            retry,
            batching,
        }
    }

    pub async fn analyze_one(
        &self,
        summary: &OpportunitySummary,
    ) -> Result<AnalysisResult, FetchError> {
        let service = self.service.as_ref();
        self.retry
            .run_fetch("analysis", move || service.analyze(summary))
            .await
    }

    /// Map of notice id -> analysis for every item that succeeded.
    pub async fn analyze_batch(
        &self,
        summaries: Vec<OpportunitySummary>,
    ) -> HashMap<String, AnalysisResult> {
        let total = summaries.len();
        let outcomes = process_in_groups(summaries, self.batching, |summary| async move {
            let result = self.analyze_one(&summary).await;
            (summary.notice_id, result)
        })
        .await;

        let mut analyzed = HashMap::with_capacity(outcomes.len());
        for (notice_id, result) in outcomes {
            match result {
                Ok(analysis) => {
                    analyzed.insert(notice_id, analysis);
                }
                Err(err) => {
                    warn!(notice_id = %notice_id, error = %err, "analysis failed; item omitted")
                }
            }
        }
        info!(total, analyzed = analyzed.len(), "analysis batch finished");
        analyzed
    }
}
