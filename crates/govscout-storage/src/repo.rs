use async_trait::async_trait;
use chrono::{DateTime, Utc};
use govscout_core::{
    AnalysisResult, EnrichmentData, IngestionRun, IntelligenceSignals, Opportunity,
    PipelineStatus, RunTransition, RunTransitionError, ScoredOpportunity,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: Uuid,
    pub created: bool,
}

#[derive(Debug, Error)]
pub enum StatusUpdateError {
    #[error("opportunity {0} not found")]
    NotFound(Uuid),
    #[error("pipeline status cannot move from {from} to {to} without force")]
    Illegal {
        from: PipelineStatus,
        to: PipelineStatus,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum RunStoreError {
    #[error(transparent)]
    Transition(#[from] RunTransitionError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl RunStoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, RunStoreError::Transition(err) if err.is_conflict())
    }
}

/// Newest run events kept; older ones are pruned on write.
pub const RUN_EVENT_RETENTION: usize = 1000;

/// One accepted run-record transition, kept as an append-only history.
/// Page-level fetch successes are left out unless they clear a failure streak.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub transition: String,
    pub snapshot: IngestionRun,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait OpportunityStore: Send + Sync {
    /// Insert or update by notice id. Pipeline state is never touched by an
    /// update.
    async fn upsert_opportunity(
        &self,
        scored: &ScoredOpportunity,
        now: DateTime<Utc>,
    ) -> anyhow::Result<UpsertOutcome>;

    async fn get_opportunity(&self, id: Uuid) -> anyhow::Result<Option<Opportunity>>;

    async fn find_by_notice_id(&self, notice_id: &str) -> anyhow::Result<Option<Opportunity>>;

    async fn count_opportunities(&self) -> anyhow::Result<u64>;

    /// Highest-scoring opportunities at or above `min_score` that are not
    /// ready, flagged or ignored.
    async fn select_pipeline_candidates(&self, min_score: u8, limit: usize)
        -> anyhow::Result<Vec<Uuid>>;

    /// Opportunities left in a scraping/enriching/analyzing state.
    async fn list_in_flight(&self) -> anyhow::Result<Vec<Uuid>>;

    /// Returns the previous status.
    async fn set_pipeline_status(
        &self,
        id: Uuid,
        status: PipelineStatus,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<PipelineStatus, StatusUpdateError>;

    async fn record_scrape(&self, id: Uuid, content: &str, now: DateTime<Utc>)
        -> anyhow::Result<()>;

    async fn record_enrichment(
        &self,
        id: Uuid,
        data: &EnrichmentData,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn record_enrichment_failure(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn record_intelligence(
        &self,
        id: Uuid,
        signals: &IntelligenceSignals,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn record_analysis(
        &self,
        id: Uuid,
        analysis: &AnalysisResult,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Move to `error` and keep the message.
    async fn mark_error(&self, id: Uuid, message: &str, now: DateTime<Utc>) -> anyhow::Result<()>;
}

/// Single-writer access to the process-wide ingestion run record.
#[async_trait]
pub trait RunStatusStore: Send + Sync {
    async fn current_run(&self) -> anyhow::Result<IngestionRun>;

    /// Atomically read, apply and persist a transition. Rejected transitions
    /// leave the stored record unchanged.
    async fn transition_run(&self, transition: RunTransition) -> Result<IngestionRun, RunStoreError>;

    /// Most recent events first.
    async fn run_history(&self, limit: usize) -> anyhow::Result<Vec<RunEvent>>;
}

pub(crate) fn manual_flags(status: PipelineStatus, flagged: bool, ignored: bool) -> (bool, bool) {
    match status {
        PipelineStatus::Flagged => (true, false),
        PipelineStatus::Ignored => (false, true),
        PipelineStatus::Error => (flagged, ignored),
        _ => (false, false),
    }
}
