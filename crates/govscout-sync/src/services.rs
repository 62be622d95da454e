use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use govscout_adapters::{
    AnalysisAdapter, AnalysisService, FixtureAnalysisService, FixtureAwardSource,
    FixtureListingSource, HistoricalAwardSource, HttpAnalysisService, ListingSource,
    SamListingClient, UsaSpendingClient,
};
use govscout_storage::{
    HttpFetcher, MemoryStore, OpportunityStore, PageArchive, PgStore, RunStatusStore,
};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{SyncConfig, TargetingProfile};
use crate::enrich::{EnrichmentConfig, EnrichmentService};
use crate::ingest::{IngestConfig, IngestionRunner};
use crate::jobs::JobQueue;
use crate::pipeline::{PipelineConfig, PipelineOrchestrator, PipelineService};
use crate::status::StatusTracker;

pub const JOB_QUEUE_CAPACITY: usize = 32;

/// Everything the CLI and the web API drive, wired against one store.
#[derive(Clone)]
pub struct Services {
    pub config: SyncConfig,
    pub store: Arc<dyn OpportunityStore>,
    pub tracker: StatusTracker,
    pub ingestion: Arc<IngestionRunner>,
    pub pipeline: PipelineService,
    pub worker: Arc<JoinHandle<()>>,
}

struct Sources {
    listing: Arc<dyn ListingSource>,
    awards: Arc<dyn HistoricalAwardSource>,
    analysis: Arc<dyn AnalysisService>,
}

impl Services {
    /// Postgres plus the live listing, award and analysis services. Must be
    /// called inside a tokio runtime.
    pub async fn live(config: SyncConfig) -> Result<Self> {
        let profile = TargetingProfile::load(config.profile_path()).await?;
        let store = Arc::new(PgStore::connect(&config.database_url).await?);
        let http = Arc::new(HttpFetcher::new(config.http_config()).context("building http client")?);
        let listing = SamListingClient::new(
            http.clone(),
            config.listing_base_url.clone(),
            config.listing_api_key.clone(),
        )
        .with_archive(PageArchive::new(config.archive_dir.clone()));
        let sources = Sources {
            listing: Arc::new(listing),
            awards: Arc::new(UsaSpendingClient::new(
                http.clone(),
                &config.awards_base_url,
                config.retry_policy(),
            )),
            analysis: Arc::new(HttpAnalysisService::new(
                http,
                config.analysis_url.clone(),
                config.analysis_api_key.clone(),
            )),
        };
        info!(database = "postgres", "services assembled");
        Ok(Self::assemble(config, profile, store, sources))
    }

    /// In-memory store and JSON fixture sources read from `dir`.
    pub async fn from_fixtures(config: SyncConfig, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let profile = TargetingProfile::load(config.profile_path()).await?;
        let sources = Sources {
            listing: Arc::new(FixtureListingSource::from_dir(dir)?),
            awards: Arc::new(FixtureAwardSource::from_dir(dir)?),
            analysis: Arc::new(FixtureAnalysisService::from_dir(dir)?),
        };
        info!(fixtures = %dir.display(), "services assembled from fixtures");
        Ok(Self::assemble(
            config,
            profile,
            Arc::new(MemoryStore::new()),
            sources,
        ))
    }

    fn assemble<S>(config: SyncConfig, profile: TargetingProfile, store: Arc<S>, sources: Sources) -> Self
    where
        S: OpportunityStore + RunStatusStore + 'static,
    {
        let tracker = StatusTracker::new(store.clone(), config.outage_policy());
        let analysis =
            AnalysisAdapter::new(sources.analysis, config.retry_policy(), config.batch_config());
        let ingestion = IngestionRunner::new(
            sources.listing.clone(),
            store.clone(),
            tracker.clone(),
            profile,
            IngestConfig::from_sync_config(&config),
        )
        .with_analysis(analysis.clone());

        let orchestrator = Arc::new(PipelineOrchestrator::new(
            store.clone(),
            sources.listing,
            EnrichmentService::new(sources.awards, EnrichmentConfig::default()),
            analysis,
            PipelineConfig {
                score_threshold: config.score_threshold,
                sync_threshold: config.sync_threshold,
                batching: config.batch_config(),
                retry: config.retry_policy(),
            },
        ));
        let (queue, worker) = JobQueue::start(orchestrator.clone(), JOB_QUEUE_CAPACITY);

        Self {
            config,
            store,
            tracker,
            ingestion: Arc::new(ingestion),
            pipeline: PipelineService::new(orchestrator, queue),
            worker: Arc::new(worker),
        }
    }
}
