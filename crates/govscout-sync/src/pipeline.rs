//! Per-opportunity stage machine: scrape, enrich (+ intelligence), analyze,
//! ready. Completed stages are skipped unless forced.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use govscout_adapters::{
    description_text, process_in_groups, AnalysisAdapter, BatchConfig, ListingSource,
};
use govscout_core::{EnrichmentStatus, Opportunity, PipelineStatus, DEFAULT_SCORE_THRESHOLD};
use govscout_storage::{OpportunityStore, RetryPolicy, StatusUpdateError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::enrich::EnrichmentService;
use crate::intel::derive_signals;
use crate::jobs::{JobQueue, JobRecord};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    pub force_scrape: bool,
    pub force_enrich: bool,
    pub force_analyze: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSelection {
    Ids(Vec<Uuid>),
    /// Highest-scoring candidates at or above the score threshold.
    AutoSelect { limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemResult {
    Succeeded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemOutcome {
    pub id: Uuid,
    pub result: ItemResult,
    pub status: Option<PipelineStatus>,
    pub message: Option<String>,
}

impl ItemOutcome {
    fn new(
        id: Uuid,
        result: ItemResult,
        status: Option<PipelineStatus>,
        message: Option<String>,
    ) -> Self {
        Self {
            id,
            result,
            status,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub items: Vec<ItemOutcome>,
}

impl BatchSummary {
    fn from_items(items: Vec<ItemOutcome>) -> Self {
        let count = |result: ItemResult| items.iter().filter(|item| item.result == result).count();
        Self {
            total: items.len(),
            succeeded: count(ItemResult::Succeeded),
            failed: count(ItemResult::Failed),
            skipped: count(ItemResult::Skipped),
            items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PipelineResponse {
    Completed(BatchSummary),
    Queued { job_id: Uuid, queued: usize },
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("scrape failed: {0}")]
    Scrape(String),
    #[error("enrichment failed: {0}")]
    Enrich(String),
    #[error("analysis failed: {0}")]
    Analyze(String),
    #[error(transparent)]
    Status(#[from] StatusUpdateError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("opportunity {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    IllegalStatus(StatusUpdateError),
    #[error("pipeline job queue is full")]
    QueueFull,
    #[error("pipeline job queue is closed")]
    QueueClosed,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub score_threshold: u8,
    /// Batches larger than this go to the background queue.
    pub sync_threshold: usize,
    pub batching: BatchConfig,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            sync_threshold: 10,
            batching: BatchConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct PipelineOrchestrator {
    store: Arc<dyn OpportunityStore>,
    listing: Arc<dyn ListingSource>,
    enrichment: EnrichmentService,
    analysis: AnalysisAdapter,
    config: PipelineConfig,
    in_progress: Mutex<HashSet<Uuid>>,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<dyn OpportunityStore>,
        listing: Arc<dyn ListingSource>,
        enrichment: EnrichmentService,
        analysis: AnalysisAdapter,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            listing,
            enrichment,
            analysis,
            config,
            in_progress: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn resolve_selection(
        &self,
        selection: &BatchSelection,
    ) -> Result<Vec<Uuid>, PipelineError> {
        match selection {
            BatchSelection::Ids(ids) => {
                let mut seen = HashSet::new();
                Ok(ids.iter().copied().filter(|id| seen.insert(*id)).collect())
            }
            BatchSelection::AutoSelect { limit } => Ok(self
                .store
                .select_pipeline_candidates(self.config.score_threshold, *limit)
                .await?),
        }
    }

    /// Runs items in groups; one failure never stops the batch.
    pub async fn process_batch(&self, ids: Vec<Uuid>, options: PipelineOptions) -> BatchSummary {
        let total = ids.len();
        let items =
            process_in_groups(ids, self.config.batching, |id| self.process_one(id, options)).await;
        let summary = BatchSummary::from_items(items);
        info!(
            total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "pipeline batch finished"
        );
        summary
    }

    pub async fn process_one(&self, id: Uuid, options: PipelineOptions) -> ItemOutcome {
        if !self.in_progress.lock().await.insert(id) {
            return ItemOutcome::new(
                id,
                ItemResult::Skipped,
                None,
                Some("already in progress".into()),
            );
        }
        let outcome = self
            .process_claimed(id, options)
            .instrument(info_span!("pipeline_item", id = %id))
            .await;
        self.in_progress.lock().await.remove(&id);
        outcome
    }

    async fn process_claimed(&self, id: Uuid, options: PipelineOptions) -> ItemOutcome {
        let opportunity = match self.store.get_opportunity(id).await {
            Ok(Some(opportunity)) => opportunity,
            Ok(None) => {
                return ItemOutcome::new(id, ItemResult::Failed, None, Some("not found".into()))
            }
            Err(err) => {
                return ItemOutcome::new(id, ItemResult::Failed, None, Some(err.to_string()))
            }
        };

        let status = opportunity.pipeline_status;
        let manual = matches!(status, PipelineStatus::Flagged | PipelineStatus::Ignored);
        if manual || opportunity.flagged || opportunity.ignored {
            let reason = if opportunity.ignored { "ignored" } else { "flagged" };
            return ItemOutcome::new(id, ItemResult::Skipped, Some(status), Some(reason.into()));
        }
        if !opportunity.relevance.meets(self.config.score_threshold) {
            return ItemOutcome::new(
                id,
                ItemResult::Skipped,
                Some(status),
                Some(format!(
                    "score {} below threshold {}",
                    opportunity.relevance.score, self.config.score_threshold
                )),
            );
        }

        match self.run_stages(opportunity, options).await {
            Ok(()) => {
                ItemOutcome::new(id, ItemResult::Succeeded, Some(PipelineStatus::Ready), None)
            }
            Err(err) => {
                let message = err.to_string();
                warn!(error = %message, "pipeline item failed");
                if let Err(mark_err) = self.store.mark_error(id, &message, Utc::now()).await {
                    warn!(error = %mark_err, "could not record pipeline error");
                }
                ItemOutcome::new(id, ItemResult::Failed, Some(PipelineStatus::Error), Some(message))
            }
        }
    }

    async fn enter(&self, id: Uuid, status: PipelineStatus, force: bool) -> Result<(), StageError> {
        self.store
            .set_pipeline_status(id, status, force, Utc::now())
            .await?;
        Ok(())
    }

    async fn run_stages(
        &self,
        mut opp: Opportunity,
        options: PipelineOptions,
    ) -> Result<(), StageError> {
        let id = opp.id;

        if !opp.scraped || options.force_scrape {
            self.enter(id, PipelineStatus::Scraping, options.force_scrape).await?;
            let content = self.scrape(&opp).await?;
            self.store.record_scrape(id, &content, Utc::now()).await?;
            self.enter(id, PipelineStatus::Scraped, false).await?;
            opp.scraped_content = Some(content);
        }

        if opp.enrichment_status != EnrichmentStatus::Complete || options.force_enrich {
            self.enter(id, PipelineStatus::Enriching, options.force_enrich).await?;
            let now = Utc::now();
            let data = match self.enrichment.enrich(&opp.listing, now).await {
                Ok(data) => data,
                Err(err) => {
                    let message = err.to_string();
                    self.store.record_enrichment_failure(id, &message, now).await?;
                    return Err(StageError::Enrich(message));
                }
            };
            self.store.record_enrichment(id, &data, now).await?;
            let signals = derive_signals(&opp.listing, &data, now);
            self.store.record_intelligence(id, &signals, now).await?;
            self.enter(id, PipelineStatus::Enriched, false).await?;
        }

        if opp.analysis.is_none() || options.force_analyze {
            self.enter(id, PipelineStatus::Analyzing, options.force_analyze).await?;
            let mut summary = opp.summary();
            if summary.description.is_none() {
                summary.description = opp.scraped_content.clone();
            }
            let analysis = self
                .analysis
                .analyze_one(&summary)
                .await
                .map_err(|err| StageError::Analyze(err.to_string()))?;
            self.store.record_analysis(id, &analysis, Utc::now()).await?;
            self.enter(id, PipelineStatus::Analyzed, false).await?;
        }

        self.enter(id, PipelineStatus::Ready, false).await
    }

    /// Full description text: fetched when the listing only links to it,
    /// otherwise the inline description or the title.
    async fn scrape(&self, opp: &Opportunity) -> Result<String, StageError> {
        let listing = &opp.listing;
        match &listing.description_url {
            Some(url) => {
                let source = self.listing.as_ref();
                let body = self
                    .config
                    .retry
                    .run_fetch("description", move || source.fetch_description(url))
                    .await
                    .map_err(|err| StageError::Scrape(err.to_string()))?;
                Ok(description_text(&body))
            }
            None => Ok(listing
                .description
                .clone()
                .unwrap_or_else(|| listing.title.clone())),
        }
    }

    /// Operator-directed move: flag, ignore or requeue. Leaving `flagged` or
    /// `ignored` needs force.
    pub async fn override_status(
        &self,
        id: Uuid,
        status: PipelineStatus,
        force: bool,
    ) -> Result<PipelineStatus, PipelineError> {
        match self
            .store
            .set_pipeline_status(id, status, force, Utc::now())
            .await
        {
            Ok(previous) => {
                info!(id = %id, from = %previous, to = %status, "pipeline status overridden");
                Ok(previous)
            }
            Err(StatusUpdateError::NotFound(id)) => Err(PipelineError::NotFound(id)),
            Err(err @ StatusUpdateError::Illegal { .. }) => Err(PipelineError::IllegalStatus(err)),
            Err(StatusUpdateError::Store(err)) => Err(PipelineError::Store(err)),
        }
    }

    /// Move items left mid-stage back to the last completed stage and
    /// return their ids for reprocessing.
    pub async fn requeue_interrupted(&self) -> Result<Vec<Uuid>, PipelineError> {
        let ids = self.store.list_in_flight().await?;
        let mut requeued = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(opp) = self.store.get_opportunity(id).await? else {
                continue;
            };
            let resume_at = match opp.pipeline_status {
                PipelineStatus::Scraping => PipelineStatus::Discovered,
                PipelineStatus::Enriching => PipelineStatus::Scraped,
                PipelineStatus::Analyzing => PipelineStatus::Enriched,
                _ => continue,
            };
            match self.override_status(id, resume_at, true).await {
                Ok(_) => requeued.push(id),
                Err(PipelineError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        info!(count = requeued.len(), "interrupted pipeline items requeued");
        Ok(requeued)
    }
}

/// Entry point for callers: small batches run inline, large ones are queued.
#[derive(Clone)]
pub struct PipelineService {
    orchestrator: Arc<PipelineOrchestrator>,
    queue: JobQueue,
}

impl PipelineService {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>, queue: JobQueue) -> Self {
        Self {
            orchestrator,
            queue,
        }
    }

    pub fn orchestrator(&self) -> &Arc<PipelineOrchestrator> {
        &self.orchestrator
    }

    pub async fn run(
        &self,
        selection: BatchSelection,
        options: PipelineOptions,
    ) -> Result<PipelineResponse, PipelineError> {
        let ids = self.orchestrator.resolve_selection(&selection).await?;
        if ids.len() > self.orchestrator.config().sync_threshold {
            let queued = ids.len();
            let job_id = self.queue.submit(ids, options).await?;
            info!(job_id = %job_id, queued, "pipeline batch queued");
            return Ok(PipelineResponse::Queued { job_id, queued });
        }
        Ok(PipelineResponse::Completed(
            self.orchestrator.process_batch(ids, options).await,
        ))
    }

    pub async fn job(&self, job_id: Uuid) -> Option<JobRecord> {
        self.queue.job(job_id).await
    }

    /// Requeue interrupted items and process them like any other batch.
    pub async fn resume_interrupted(&self) -> Result<PipelineResponse, PipelineError> {
        let ids = self.orchestrator.requeue_interrupted().await?;
        self.run(BatchSelection::Ids(ids), PipelineOptions::default())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use govscout_adapters::{
        AwardQuery, FixtureAnalysisService, FixtureAwardSource, FixtureListingSource,
        HistoricalAwardSource,
    };
    use govscout_core::{
        HistoricalAward, OpportunityDraft, QueryStrategy, RelevanceScore, ScoredOpportunity,
    };
    use govscout_storage::{FetchError, MemoryStore};
    use serde_json::Value as JsonValue;
    use std::path::{Path, PathBuf};

    use crate::enrich::EnrichmentConfig;
    use crate::jobs::JobState;

    fn fixture_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 5, 12, 0, 0).single().unwrap()
    }

    /// Fails for one NAICS code, otherwise defers to the fixture awards.
    struct FailingFor {
        naics: &'static str,
        inner: FixtureAwardSource,
    }

    #[async_trait]
    impl HistoricalAwardSource for FailingFor {
        async fn search_awards(
            &self,
            query: &AwardQuery,
        ) -> Result<Vec<HistoricalAward>, FetchError> {
            if query.naics_codes.iter().any(|code| code == self.naics) {
                return Err(FetchError::HttpStatus {
                    status: 500,
                    url: "https://awards.test/search".into(),
                });
            }
            self.inner.search_awards(query).await
        }
    }

    fn draft(notice_id: &str, naics: &str) -> OpportunityDraft {
        OpportunityDraft {
            notice_id: notice_id.into(),
            source_url: None,
            title: format!("Notice {notice_id}"),
            agency: Some("GENERAL SERVICES ADMINISTRATION".into()),
            solicitation_number: None,
            notice_type: Some("Solicitation".into()),
            naics_codes: vec![naics.into()],
            psc_codes: vec![],
            set_aside_codes: vec!["SBA".into()],
            description: Some("Cloud hosting services.".into()),
            description_url: None,
            posted_at: None,
            response_deadline: None,
            estimated_value: Some(500_000.0),
            discovered_by: QueryStrategy::NaicsTargeted,
            raw_payload: JsonValue::Null,
        }
    }

    async fn seed(store: &MemoryStore, draft: OpportunityDraft, score: u8) -> Uuid {
        store
            .upsert_opportunity(
                &ScoredOpportunity {
                    draft,
                    relevance: RelevanceScore::new(score),
                    analysis: None,
                },
                ts(),
            )
            .await
            .unwrap()
            .id
    }

    fn orchestrator(
        store: Arc<MemoryStore>,
        awards: Arc<dyn HistoricalAwardSource>,
    ) -> PipelineOrchestrator {
        let root = fixture_root();
        let analysis = AnalysisAdapter::new(
            Arc::new(FixtureAnalysisService::from_dir(&root).unwrap()),
            RetryPolicy::immediate(0),
            BatchConfig::without_pause(5),
        );
        PipelineOrchestrator::new(
            store,
            Arc::new(FixtureListingSource::from_dir(&root).unwrap()),
            EnrichmentService::new(awards, EnrichmentConfig::default()),
            analysis,
            PipelineConfig {
                batching: BatchConfig::without_pause(5),
                retry: RetryPolicy::immediate(0),
                ..PipelineConfig::default()
            },
        )
    }

    fn failing_awards() -> Arc<dyn HistoricalAwardSource> {
        Arc::new(FailingFor {
            naics: "999999",
            inner: FixtureAwardSource::from_dir(fixture_root()).unwrap(),
        })
    }

    #[tokio::test]
    async fn one_failed_enrichment_does_not_stop_the_batch() {
        let store = Arc::new(MemoryStore::new());
        // analysis fixtures exist for these two notice ids
        let a = seed(&store, draft("f3a1c2d4e5b60001", "541512"), 80).await;
        let b = seed(&store, draft("f3a1c2d4e5b60004", "541519"), 70).await;
        let bad = seed(&store, draft("bad-notice", "999999"), 90).await;
        let orchestrator = orchestrator(store.clone(), failing_awards());

        let summary = orchestrator
            .process_batch(vec![a, bad, b], PipelineOptions::default())
            .await;
        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.items[1].result, ItemResult::Failed);

        for id in [a, b] {
            let opp = store.get_opportunity(id).await.unwrap().unwrap();
            assert_eq!(opp.pipeline_status, PipelineStatus::Ready);
            assert!(opp.scraped);
            assert_eq!(opp.enrichment_status, EnrichmentStatus::Complete);
            assert!(opp.intelligence.is_some());
            assert!(opp.analysis.is_some());
        }
        let failed = store.get_opportunity(bad).await.unwrap().unwrap();
        assert_eq!(failed.pipeline_status, PipelineStatus::Error);
        assert_eq!(failed.enrichment_status, EnrichmentStatus::Failed);
        assert!(failed.last_error.unwrap().contains("enrichment failed"));
    }

    #[tokio::test]
    async fn completed_stages_are_skipped_and_flagged_items_left_alone() {
        let store = Arc::new(MemoryStore::new());
        let a = seed(&store, draft("f3a1c2d4e5b60001", "541512"), 80).await;
        let flagged = seed(&store, draft("f3a1c2d4e5b60004", "541519"), 80).await;
        let low = seed(&store, draft("f3a1c2d4e5b60007", "518210"), 20).await;
        store
            .set_pipeline_status(flagged, PipelineStatus::Flagged, false, ts())
            .await
            .unwrap();
        let orchestrator = orchestrator(store.clone(), failing_awards());

        let first = orchestrator.process_one(a, PipelineOptions::default()).await;
        assert_eq!(first.result, ItemResult::Succeeded);
        let enriched_at = store
            .get_opportunity(a)
            .await
            .unwrap()
            .unwrap()
            .enrichment
            .unwrap()
            .queried_at;

        let again = orchestrator.process_one(a, PipelineOptions::default()).await;
        assert_eq!(again.result, ItemResult::Succeeded);
        let after = store.get_opportunity(a).await.unwrap().unwrap();
        assert_eq!(after.enrichment.unwrap().queried_at, enriched_at);

        let forced = orchestrator
            .process_one(
                a,
                PipelineOptions {
                    force_enrich: true,
                    ..PipelineOptions::default()
                },
            )
            .await;
        assert_eq!(forced.result, ItemResult::Succeeded);

        let skipped = orchestrator
            .process_batch(vec![flagged, low], PipelineOptions::default())
            .await;
        assert_eq!(skipped.skipped, 2);
        let still_flagged = store.get_opportunity(flagged).await.unwrap().unwrap();
        assert_eq!(still_flagged.pipeline_status, PipelineStatus::Flagged);
    }

    #[tokio::test]
    async fn description_urls_are_fetched_during_scrape() {
        let store = Arc::new(MemoryStore::new());
        let mut listing = draft("f3a1c2d4e5b60002", "541512");
        listing.description = None;
        listing.description_url = Some(
            "https://api.sam.gov/prod/opportunities/v1/noticedesc?noticeid=f3a1c2d4e5b60002"
                .into(),
        );
        let id = seed(&store, listing, 80).await;
        let orchestrator = orchestrator(store.clone(), failing_awards());

        let outcome = orchestrator.process_one(id, PipelineOptions::default()).await;
        assert_eq!(outcome.result, ItemResult::Succeeded);
        let opp = store.get_opportunity(id).await.unwrap().unwrap();
        assert!(opp.scraped_content.unwrap().len() > 20);
    }

    #[tokio::test]
    async fn interrupted_items_resume_from_their_last_completed_stage() {
        let store = Arc::new(MemoryStore::new());
        let id = seed(&store, draft("f3a1c2d4e5b60001", "541512"), 80).await;
        store
            .set_pipeline_status(id, PipelineStatus::Scraped, false, ts())
            .await
            .unwrap();
        store
            .set_pipeline_status(id, PipelineStatus::Enriching, false, ts())
            .await
            .unwrap();
        let orchestrator = Arc::new(orchestrator(store.clone(), failing_awards()));

        let requeued = orchestrator.requeue_interrupted().await.unwrap();
        assert_eq!(requeued, vec![id]);
        let opp = store.get_opportunity(id).await.unwrap().unwrap();
        assert_eq!(opp.pipeline_status, PipelineStatus::Scraped);
    }

    #[tokio::test]
    async fn large_batches_are_queued_and_pollable() {
        let store = Arc::new(MemoryStore::new());
        let mut ids = Vec::new();
        for n in 0..3 {
            ids.push(seed(&store, draft(&format!("N-{n}"), "541512"), 80).await);
        }
        let mut orchestrator = orchestrator(store.clone(), failing_awards());
        orchestrator.config.sync_threshold = 2;
        let orchestrator = Arc::new(orchestrator);
        let (queue, _worker) = JobQueue::start(orchestrator.clone(), 4);
        let service = PipelineService::new(orchestrator, queue);

        let response = service
            .run(BatchSelection::Ids(ids), PipelineOptions::default())
            .await
            .unwrap();
        let PipelineResponse::Queued { job_id, queued } = response else {
            panic!("expected a queued response");
        };
        assert_eq!(queued, 3);

        let mut record = service.job(job_id).await.unwrap();
        for _ in 0..200 {
            if record.state == JobState::Completed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            record = service.job(job_id).await.unwrap();
        }
        assert_eq!(record.state, JobState::Completed);
        let summary = record.summary.unwrap();
        assert_eq!(summary.total, 3);
        // no analysis fixtures for N-*, so analysis fails for every item
        assert_eq!(summary.failed, 3);
    }
}
