//! Ingestion runs, the per-opportunity pipeline and the scheduling around
//! them.

pub mod config;
pub mod dedup;
pub mod enrich;
pub mod filter;
pub mod ingest;
pub mod intel;
pub mod jobs;
pub mod pipeline;
pub mod scheduler;
pub mod score;
pub mod services;
pub mod status;

pub use config::{SyncConfig, TargetingProfile};
pub use dedup::{DedupInsert, Deduplicator};
pub use enrich::{award_agency_name, summarize_awards, EnrichmentConfig, EnrichmentService};
pub use filter::{hard_filter, FilterDecision, FilterRules};
pub use ingest::{IngestConfig, IngestError, IngestionRunner, IngestionSummary};
pub use intel::derive_signals;
pub use jobs::{JobQueue, JobRecord, JobState};
pub use pipeline::{
    BatchSelection, BatchSummary, ItemOutcome, ItemResult, PipelineConfig, PipelineError,
    PipelineOptions, PipelineOrchestrator, PipelineResponse, PipelineService, StageError,
};
pub use scheduler::{maintenance_tick, maybe_build_scheduler, TickOutcome};
pub use score::{score, select_above_threshold, ScoringProfile};
pub use services::Services;
pub use status::StatusTracker;
