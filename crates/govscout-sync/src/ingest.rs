use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use govscout_adapters::{
    build_all_queries, normalize_record, AnalysisAdapter, DateWindow, ListingQuery, ListingSource,
    Paginator, DEFAULT_PAGE_CAP,
};
use govscout_core::{
    IngestionRun, OpportunitySummary, RunState, RunStats, ScoredOpportunity,
    DEFAULT_SCORE_THRESHOLD,
};
use govscout_storage::{FetchError, OpportunityStore, RetryPolicy, RunStoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{SyncConfig, TargetingProfile};
use crate::dedup::Deduplicator;
use crate::filter::hard_filter;
use crate::score::score;
use crate::status::StatusTracker;

#[derive(Debug, Clone, Copy)]
pub struct IngestConfig {
    pub page_size: usize,
    pub page_cap: usize,
    pub lookback_days: u32,
    pub score_threshold: u8,
    pub retry: RetryPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            page_cap: DEFAULT_PAGE_CAP,
            lookback_days: 30,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            retry: RetryPolicy::default(),
        }
    }
}

impl IngestConfig {
    pub fn from_sync_config(config: &SyncConfig) -> Self {
        Self {
            page_size: config.page_size,
            page_cap: config.page_cap,
            lookback_days: config.lookback_days,
            score_threshold: config.score_threshold,
            retry: config.retry_policy(),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Run(#[from] RunStoreError),
    #[error("listing fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl IngestError {
    /// A run is already in progress or an outage is unresolved.
    pub fn is_conflict(&self) -> bool {
        matches!(self, IngestError::Run(err) if err.is_conflict())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionSummary {
    pub run_id: Option<Uuid>,
    pub state: RunState,
    pub stats: RunStats,
    pub created: u64,
    pub updated: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl IngestionSummary {
    fn from_run(run: &IngestionRun, created: u64, updated: u64) -> Self {
        Self {
            run_id: run.run_id,
            state: run.state,
            stats: run.stats,
            created,
            updated,
            started_at: run.started_at,
            finished_at: run.finished_at,
        }
    }
}

enum FetchOutcome {
    Finished,
    Outage(IngestionRun),
}

enum RunOutcome {
    Stored {
        stats: RunStats,
        created: u64,
        updated: u64,
    },
    Outage(IngestionRun),
}

/// Query -> paginate -> dedup -> normalize -> filter -> score (+ analysis)
/// -> upsert, wrapped in one tracked ingestion run.
pub struct IngestionRunner {
    listing: Arc<dyn ListingSource>,
    store: Arc<dyn OpportunityStore>,
    tracker: StatusTracker,
    analysis: Option<AnalysisAdapter>,
    profile: TargetingProfile,
    config: IngestConfig,
}

impl IngestionRunner {
    pub fn new(
        listing: Arc<dyn ListingSource>,
        store: Arc<dyn OpportunityStore>,
        tracker: StatusTracker,
        profile: TargetingProfile,
        config: IngestConfig,
    ) -> Self {
        Self {
            listing,
            store,
            tracker,
            analysis: None,
            profile,
            config,
        }
    }

    /// Analyze above-threshold items while ingesting.
    pub fn with_analysis(mut self, analysis: AnalysisAdapter) -> Self {
        self.analysis = Some(analysis);
        self
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    pub fn listing(&self) -> Arc<dyn ListingSource> {
        self.listing.clone()
    }

    /// Claim the run record. Conflicts when a run is in progress or an
    /// outage is unresolved.
    pub async fn begin(&self, now: DateTime<Utc>) -> Result<IngestionRun, IngestError> {
        Ok(self.tracker.start_run(now).await?)
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<IngestionSummary, IngestError> {
        let run = self.begin(now).await?;
        self.execute(&run, now).await
    }

    /// Drive a run claimed with [`IngestionRunner::begin`] to completion,
    /// outage or failure. Every ending is recorded on the run record.
    pub async fn execute(
        &self,
        run: &IngestionRun,
        now: DateTime<Utc>,
    ) -> Result<IngestionSummary, IngestError> {
        let run_id = run.run_id.unwrap_or_default();
        let span = info_span!("ingestion_run", run_id = %run_id);
        match self.collect_and_store(now).instrument(span).await {
            Ok(RunOutcome::Stored {
                stats,
                created,
                updated,
            }) => {
                let run = self.tracker.complete(stats, Utc::now()).await?;
                Ok(IngestionSummary::from_run(&run, created, updated))
            }
            Ok(RunOutcome::Outage(run)) => Ok(IngestionSummary::from_run(&run, 0, 0)),
            Err(err) => {
                if let Err(record_err) = self.tracker.fail(&err.to_string(), Utc::now()).await {
                    warn!(error = %record_err, "could not record ingestion failure");
                }
                Err(err)
            }
        }
    }

    fn queries(&self, now: DateTime<Utc>) -> Vec<ListingQuery> {
        let window = DateWindow::lookback(now.date_naive(), self.config.lookback_days);
        build_all_queries(&self.profile.query_profile(), window)
    }

    async fn fetch_query(
        &self,
        query: &ListingQuery,
        dedup: &mut Deduplicator,
    ) -> Result<FetchOutcome, IngestError> {
        let mut paginator = Paginator::new(self.listing.as_ref(), query, self.config.page_size)
            .with_cap(self.config.page_cap);
        let retry = self.config.retry;
        let mut attempt = 0usize;
        loop {
            match paginator.next_page().await {
                Ok(Some(records)) => {
                    attempt = 0;
                    self.tracker.fetch_succeeded(Utc::now()).await?;
                    dedup.extend(query.strategy, records);
                }
                Ok(None) => return Ok(FetchOutcome::Finished),
                Err(err) if err.is_transient() => {
                    let run = self.tracker.fetch_failed(&err.to_string(), Utc::now()).await?;
                    if run.in_outage() {
                        return Ok(FetchOutcome::Outage(run));
                    }
                    if !retry.allows_retry(attempt) {
                        return Err(err.into());
                    }
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        strategy = %query.strategy,
                        target = %query.target,
                        offset = paginator.offset(),
                        attempt = attempt + 1,
                        error = %err,
                        "retrying listing page"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn collect_and_store(&self, now: DateTime<Utc>) -> Result<RunOutcome, IngestError> {
        let queries = self.queries(now);
        info!(queries = queries.len(), "ingestion queries built");

        let mut dedup = Deduplicator::new();
        for query in &queries {
            if let FetchOutcome::Outage(run) = self.fetch_query(query, &mut dedup).await? {
                return Ok(RunOutcome::Outage(run));
            }
        }

        let mut stats = RunStats {
            fetched: dedup.seen(),
            deduplicated: dedup.len() as u64,
            skipped_malformed: dedup.malformed(),
            ..RunStats::default()
        };

        let mut drafts = Vec::with_capacity(dedup.len());
        for (strategy, raw) in dedup.into_records() {
            match normalize_record(&raw, strategy) {
                Ok(draft) => drafts.push(draft),
                Err(err) => {
                    warn!(strategy = %strategy, error = %err, "skipping malformed listing record");
                    stats.skipped_malformed += 1;
                }
            }
        }

        let rules = self.profile.filter_rules();
        let scoring = self.profile.scoring_profile();
        let mut scored = Vec::new();
        for draft in drafts {
            let decision = hard_filter(&draft, now, &rules);
            if !decision.passed {
                debug!(
                    notice_id = %draft.notice_id,
                    reason = decision.reason.as_deref().unwrap_or_default(),
                    "listing excluded"
                );
                continue;
            }
            let relevance = score(&draft, &scoring);
            scored.push(ScoredOpportunity {
                draft,
                relevance,
                analysis: None,
            });
        }
        stats.passed_filter = scored.len() as u64;

        let threshold = self.config.score_threshold;
        let above: Vec<OpportunitySummary> = scored
            .iter()
            .filter(|item| item.relevance.meets(threshold))
            .map(|item| OpportunitySummary::from_draft(&item.draft))
            .collect();
        stats.scored_above_threshold = above.len() as u64;

        let mut analyses = match &self.analysis {
            Some(adapter) if !above.is_empty() => adapter.analyze_batch(above).await,
            _ => HashMap::new(),
        };

        let (mut created, mut updated) = (0u64, 0u64);
        for mut item in scored {
            item.analysis = analyses.remove(&item.draft.notice_id);
            let outcome = self.store.upsert_opportunity(&item, now).await?;
            if outcome.created {
                created += 1;
            } else {
                updated += 1;
            }
            stats.stored += 1;
        }

        Ok(RunOutcome::Stored {
            stats,
            created,
            updated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use govscout_adapters::{BatchConfig, FixtureAnalysisService, FixtureListingSource};
    use govscout_core::{OutagePolicy, QueryStrategy};
    use govscout_storage::MemoryStore;
    use std::path::{Path, PathBuf};

    fn fixture_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 5, 12, 0, 0).single().unwrap()
    }

    fn profile() -> TargetingProfile {
        TargetingProfile {
            naics_codes: vec!["541512".into()],
            set_aside_codes: vec!["8A".into()],
            keywords: vec!["cloud".into()],
            agencies: vec!["GENERAL SERVICES ADMINISTRATION".into()],
            notice_types: vec!["o".into(), "k".into(), "p".into(), "r".into()],
            eligible_set_asides: vec!["SBA".into(), "8A".into()],
            disallowed_notice_types: crate::filter::FilterRules::default().disallowed_notice_types,
        }
    }

    /// One query per strategy, so each fixture page is fetched once.
    fn runner(
        listing: FixtureListingSource,
        store: Arc<MemoryStore>,
        retry: RetryPolicy,
    ) -> IngestionRunner {
        runner_with(
            listing,
            store,
            IngestConfig {
                retry,
                ..IngestConfig::default()
            },
        )
    }

    fn runner_with(
        listing: FixtureListingSource,
        store: Arc<MemoryStore>,
        config: IngestConfig,
    ) -> IngestionRunner {
        let tracker = StatusTracker::new(store.clone(), OutagePolicy::default());
        let analysis = AnalysisAdapter::new(
            Arc::new(FixtureAnalysisService::from_dir(fixture_root()).unwrap()),
            RetryPolicy::immediate(0),
            BatchConfig::without_pause(5),
        );
        IngestionRunner::new(
            Arc::new(listing),
            store,
            tracker,
            profile(),
            config,
        )
        .with_analysis(analysis)
    }

    #[tokio::test]
    async fn fixture_run_dedups_filters_scores_and_stores() {
        let store = Arc::new(MemoryStore::new());
        let listing = FixtureListingSource::from_dir(fixture_root()).unwrap();
        let runner = runner(listing, store.clone(), RetryPolicy::immediate(3));

        let summary = runner.run_once(now()).await.unwrap();
        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.stats.fetched, 10);
        assert_eq!(summary.stats.deduplicated, 7);
        assert_eq!(summary.stats.skipped_malformed, 1);
        assert_eq!(summary.stats.passed_filter, 4);
        assert_eq!(summary.stats.scored_above_threshold, 2);
        assert_eq!(summary.stats.stored, 4);
        assert_eq!(summary.created, 4);

        let stored = store.all_opportunities().await;
        let ids: Vec<&str> = stored.iter().map(|o| o.listing.notice_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "f3a1c2d4e5b60001",
                "f3a1c2d4e5b60003",
                "f3a1c2d4e5b60004",
                "f3a1c2d4e5b60007"
            ]
        );
        let cloud = &stored[0];
        assert_eq!(cloud.listing.discovered_by, QueryStrategy::NaicsTargeted);
        assert_eq!(cloud.relevance.score, 85);
        assert!(cloud.analysis.is_some());
        assert_eq!(stored[2].relevance.score, 70);
        assert!(stored[3].analysis.is_none());
    }

    #[tokio::test]
    async fn reingesting_updates_in_place() {
        let store = Arc::new(MemoryStore::new());
        let listing = FixtureListingSource::from_dir(fixture_root()).unwrap();
        let runner = runner(listing, store.clone(), RetryPolicy::immediate(3));

        runner.run_once(now()).await.unwrap();
        let second = runner.run_once(now() + chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 4);
        assert_eq!(store.count_opportunities().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn transient_failures_below_threshold_are_retried() {
        let store = Arc::new(MemoryStore::new());
        let listing = FixtureListingSource::from_dir(fixture_root())
            .unwrap()
            .fail_next_pages(2);
        let runner = runner(listing, store.clone(), RetryPolicy::immediate(3));

        let summary = runner.run_once(now()).await.unwrap();
        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.stats.stored, 4);
        let run = runner.tracker().status().await.unwrap();
        assert_eq!(run.error_count, 2);
        assert_eq!(run.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn small_pages_keep_run_history_short() {
        let store = Arc::new(MemoryStore::new());
        let listing = FixtureListingSource::from_dir(fixture_root())
            .unwrap()
            .fail_next_pages(2);
        let runner = runner_with(
            listing,
            store,
            IngestConfig {
                page_size: 2,
                retry: RetryPolicy::immediate(3),
                ..IngestConfig::default()
            },
        );

        let summary = runner.run_once(now()).await.unwrap();
        assert_eq!(summary.state, RunState::Completed);

        let labels: Vec<String> = runner
            .tracker()
            .history(20)
            .await
            .unwrap()
            .into_iter()
            .map(|event| event.transition)
            .collect();
        assert_eq!(
            labels,
            vec![
                "complete",
                "fetch_succeeded",
                "fetch_failed",
                "fetch_failed",
                "start"
            ]
        );
    }

    #[tokio::test]
    async fn three_consecutive_page_failures_become_an_outage() {
        let store = Arc::new(MemoryStore::new());
        let listing = FixtureListingSource::from_dir(fixture_root())
            .unwrap()
            .fail_next_pages(3);
        let runner = runner(listing, store.clone(), RetryPolicy::immediate(5));

        let summary = runner.run_once(now()).await.unwrap();
        assert_eq!(summary.state, RunState::Outage);
        let run = runner.tracker().status().await.unwrap();
        assert!(run.outage);
        assert!(run.outage_reason.is_some());
        assert!(run.outage_detected_at.is_some());
        assert_eq!(store.count_opportunities().await.unwrap(), 0);

        let err = runner.run_once(now()).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_run_and_schedule_a_retry() {
        let store = Arc::new(MemoryStore::new());
        let listing = FixtureListingSource::from_dir(fixture_root())
            .unwrap()
            .fail_next_pages(2);
        let runner = runner(listing, store, RetryPolicy::immediate(1));

        assert!(runner.run_once(now()).await.is_err());
        let run = runner.tracker().status().await.unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert!(run.next_retry_at.is_some());
        assert!(run.last_error.is_some());
    }
}
