//! Fixture-backed sources for offline runs. Layout under a fixture root:
//! `listing/<strategy>.json` (a search response), `listing/descriptions.json`
//! (url -> text), `awards/awards.json` and `analysis/analysis.json`
//! (notice id -> analysis).

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use govscout_core::{AnalysisResult, HistoricalAward, OpportunitySummary, QueryStrategy};
use govscout_storage::FetchError;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::awards::{AwardQuery, HistoricalAwardSource};
use crate::listing::{ListingPage, ListingSource};
use crate::strategy::ListingQuery;

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn read_optional<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if path.exists() {
        read_json_file(path)
    } else {
        Ok(T::default())
    }
}

fn fixture_error(status: u16, url: impl Into<String>) -> FetchError {
    FetchError::HttpStatus {
        status,
        url: url.into(),
    }
}

/// Take one injected failure if any remain.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Default)]
pub struct FixtureListingSource {
    records: HashMap<QueryStrategy, Vec<JsonValue>>,
    descriptions: HashMap<String, String>,
    page_failures: AtomicUsize,
    probe_failures: AtomicUsize,
}

impl FixtureListingSource {
    pub fn from_dir(root: impl AsRef<Path>) -> Result<Self> {
        let dir = root.as_ref().join("listing");
        let mut records = HashMap::new();
        for strategy in QueryStrategy::ALL {
            let path = dir.join(format!("{}.json", strategy.as_str()));
            if !path.exists() {
                continue;
            }
            let page: JsonValue = read_json_file(&path)?;
            let items = page
                .get("opportunitiesData")
                .and_then(JsonValue::as_array)
                .cloned()
                .unwrap_or_default();
            records.insert(strategy, items);
        }
        Ok(Self {
            records,
            descriptions: read_optional(&dir.join("descriptions.json"))?,
            ..Self::default()
        })
    }

    pub fn from_records(records: HashMap<QueryStrategy, Vec<JsonValue>>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    /// The next `count` page fetches fail with a 503.
    pub fn fail_next_pages(self, count: usize) -> Self {
        self.page_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn fail_next_probes(self, count: usize) -> Self {
        self.probe_failures.store(count, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl ListingSource for FixtureListingSource {
    fn source_id(&self) -> &'static str {
        "fixture-listing"
    }

    async fn fetch_page(
        &self,
        query: &ListingQuery,
        limit: usize,
        offset: usize,
    ) -> Result<ListingPage, FetchError> {
        if take_failure(&self.page_failures) {
            return Err(fixture_error(503, format!("fixture://listing/{}", query.strategy)));
        }
        let all = self
            .records
            .get(&query.strategy)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let records = all.iter().skip(offset).take(limit).cloned().collect();
        Ok(ListingPage {
            total_records: Some(all.len() as u64),
            records,
        })
    }

    async fn fetch_description(&self, url: &str) -> Result<String, FetchError> {
        self.descriptions
            .get(url)
            .cloned()
            .ok_or_else(|| fixture_error(404, url))
    }

    async fn probe(&self) -> Result<(), FetchError> {
        if take_failure(&self.probe_failures) {
            return Err(fixture_error(503, "fixture://listing/probe"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FixtureAwardSource {
    awards: Vec<HistoricalAward>,
}

impl FixtureAwardSource {
    pub fn from_dir(root: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            awards: read_optional(&root.as_ref().join("awards").join("awards.json"))?,
        })
    }

    pub fn new(awards: Vec<HistoricalAward>) -> Self {
        Self { awards }
    }
}

#[async_trait]
impl HistoricalAwardSource for FixtureAwardSource {
    async fn search_awards(&self, query: &AwardQuery) -> Result<Vec<HistoricalAward>, FetchError> {
        let mut awards: Vec<_> = self
            .awards
            .iter()
            .filter(|award| query.matches(award))
            .cloned()
            .collect();
        awards.sort_by(|a, b| b.obligated_amount.total_cmp(&a.obligated_amount));
        awards.truncate(query.limit);
        Ok(awards)
    }
}

#[derive(Debug, Default)]
pub struct FixtureAnalysisService {
    results: HashMap<String, AnalysisResult>,
}

impl FixtureAnalysisService {
    pub fn from_dir(root: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            results: read_optional(&root.as_ref().join("analysis").join("analysis.json"))?,
        })
    }
}

#[async_trait]
impl crate::analysis::AnalysisService for FixtureAnalysisService {
    async fn analyze(&self, summary: &OpportunitySummary) -> Result<AnalysisResult, FetchError> {
        self.results
            .get(&summary.notice_id)
            .cloned()
            .ok_or_else(|| fixture_error(404, format!("fixture://analysis/{}", summary.notice_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisService;
    use crate::strategy::{build_queries, DateWindow, QueryProfile};
    use chrono::NaiveDate;
    use std::path::PathBuf;

    fn fixture_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures")
            .canonicalize()
            .expect("fixture root")
    }

    fn naics_query() -> ListingQuery {
        let profile = QueryProfile {
            naics_codes: vec!["541512".into()],
            ..Default::default()
        };
        let window = DateWindow::lookback(NaiveDate::from_ymd_opt(2026, 10, 5).unwrap(), 30);
        build_queries(QueryStrategy::NaicsTargeted, &profile, window).remove(0)
    }

    #[tokio::test]
    async fn listing_fixture_pages_and_injected_failures() {
        let source = FixtureListingSource::from_dir(fixture_root())
            .unwrap()
            .fail_next_pages(1);
        let query = naics_query();

        let err = source.fetch_page(&query, 2, 0).await.unwrap_err();
        assert!(err.is_transient());

        let first = source.fetch_page(&query, 2, 0).await.unwrap();
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.total_records, Some(3));
        let second = source.fetch_page(&query, 2, 2).await.unwrap();
        assert_eq!(second.records.len(), 1);
    }

    #[tokio::test]
    async fn award_fixture_filters_and_sorts() {
        let source = FixtureAwardSource::from_dir(fixture_root()).unwrap();
        let query = AwardQuery {
            naics_codes: vec!["541512".into()],
            psc_codes: vec!["DA01".into()],
            agencies: vec!["General Services Administration".into()],
            start_date: NaiveDate::from_ymd_opt(2021, 10, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2026, 10, 1).unwrap(),
            limit: 3,
        };
        let awards = source.search_awards(&query).await.unwrap();
        let amounts: Vec<f64> = awards.iter().map(|a| a.obligated_amount).collect();
        assert_eq!(amounts, vec![200_000.0, 180_000.0, 150_000.0]);
    }

    #[tokio::test]
    async fn analysis_fixture_misses_are_errors() {
        let service = FixtureAnalysisService::from_dir(fixture_root()).unwrap();
        let summary = OpportunitySummary {
            notice_id: "unknown".into(),
            title: "Unknown".into(),
            agency: None,
            naics_codes: vec![],
            set_aside_codes: vec![],
            description: None,
        };
        assert!(service.analyze(&summary).await.is_err());
    }
}
