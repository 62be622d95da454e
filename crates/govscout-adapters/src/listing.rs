use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use govscout_storage::{FetchError, HttpFetcher, PageArchive};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::html::description_text;
use crate::strategy::ListingQuery;

/// One page of raw listing records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingPage {
    pub total_records: Option<u64>,
    pub records: Vec<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "totalRecords")]
    total_records: Option<u64>,
    #[serde(rename = "opportunitiesData", default)]
    opportunities_data: Vec<JsonValue>,
}

/// The procurement listing source. Calls are single attempts; callers own
/// retries and outage accounting.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_page(
        &self,
        query: &ListingQuery,
        limit: usize,
        offset: usize,
    ) -> Result<ListingPage, FetchError>;

    /// Plain-text notice description behind a description URL.
    async fn fetch_description(&self, url: &str) -> Result<String, FetchError>;

    /// Cheap health check used while an outage is active.
    async fn probe(&self) -> Result<(), FetchError>;
}

pub struct SamListingClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    api_key: Option<String>,
    archive: Option<PageArchive>,
}

impl SamListingClient {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    fn with_key(&self, mut params: Vec<(String, String)>) -> Vec<(String, String)> {
        if let Some(key) = &self.api_key {
            params.push(("api_key".into(), key.clone()));
        }
        params
    }
}

#[async_trait]
impl ListingSource for SamListingClient {
    fn source_id(&self) -> &'static str {
        "listing"
    }

    async fn fetch_page(
        &self,
        query: &ListingQuery,
        limit: usize,
        offset: usize,
    ) -> Result<ListingPage, FetchError> {
        let params = self.with_key(query.paged_params(limit, offset));
        let response = self.http.get(self.source_id(), &self.base_url, &params).await?;

        if let Some(archive) = &self.archive {
            match archive
                .archive_page(Utc::now(), query.strategy.as_str(), offset, &response.body)
                .await
            {
                Ok(page) => debug!(
                    path = %page.relative_path.display(),
                    deduplicated = page.deduplicated,
                    "listing page archived"
                ),
                Err(err) => warn!(error = %err, "failed to archive listing page"),
            }
        }

        let parsed: SearchResponse = response.json()?;
        Ok(ListingPage {
            total_records: parsed.total_records,
            records: parsed.opportunities_data,
        })
    }

    async fn fetch_description(&self, url: &str) -> Result<String, FetchError> {
        let params = self.with_key(Vec::new());
        let response = self.http.get(self.source_id(), url, &params).await?;
        Ok(description_text(&response.text()))
    }

    async fn probe(&self) -> Result<(), FetchError> {
        let today: NaiveDate = Utc::now().date_naive();
        let day = today.format("%m/%d/%Y").to_string();
        let params = self.with_key(vec![
            ("postedFrom".into(), day.clone()),
            ("postedTo".into(), day),
            ("limit".into(), "1".into()),
            ("offset".into(), "0".into()),
        ]);
        let response = self.http.get(self.source_id(), &self.base_url, &params).await?;
        response.json::<SearchResponse>().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_response_tolerates_missing_data_array() {
        let parsed: SearchResponse = serde_json::from_str(r#"{"totalRecords": 0}"#).unwrap();
        assert_eq!(parsed.total_records, Some(0));
        assert!(parsed.opportunities_data.is_empty());
    }
}
