//! JSON API over ingestion run status and the opportunity pipeline.

use std::fmt::Display;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use govscout_core::{PipelineStatus, RunTransitionError};
use govscout_storage::{OpportunityStore, RunStoreError};
use govscout_sync::{
    BatchSelection, IngestError, PipelineError, PipelineOptions, PipelineResponse, Services,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "govscout-web";
pub const DEFAULT_AUTO_SELECT_LIMIT: usize = 25;
const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
}

impl AppState {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OutageRequest {
    reason: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PipelineRunRequest {
    ids: Option<Vec<Uuid>>,
    auto_select: bool,
    limit: Option<usize>,
    #[serde(flatten)]
    options: PipelineOptions,
}

impl PipelineRunRequest {
    fn selection(&self) -> Option<BatchSelection> {
        match (&self.ids, self.auto_select) {
            (Some(ids), false) => Some(BatchSelection::Ids(ids.clone())),
            (None, true) => Some(BatchSelection::AutoSelect {
                limit: self.limit.unwrap_or(DEFAULT_AUTO_SELECT_LIMIT),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OverrideQuery {
    force: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/ingestion/status", get(ingestion_status_handler))
        .route("/api/ingestion/history", get(ingestion_history_handler))
        .route("/api/ingestion/start", post(ingestion_start_handler))
        .route("/api/ingestion/outage", post(declare_outage_handler))
        .route("/api/ingestion/outage/resolve", post(resolve_outage_handler))
        .route("/api/pipeline/run", post(pipeline_run_handler))
        .route("/api/pipeline/jobs/{id}", get(pipeline_job_handler))
        .route("/api/opportunities/{id}", get(opportunity_handler))
        .route("/api/opportunities/{id}/flag", post(flag_handler))
        .route("/api/opportunities/{id}/ignore", post(ignore_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn ingestion_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.services.tracker.status().await {
        Ok(run) => Json(run).into_response(),
        Err(err) => server_error(err),
    }
}

async fn ingestion_history_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    match state.services.tracker.history(limit).await {
        Ok(events) => Json(events).into_response(),
        Err(err) => server_error(err),
    }
}

/// Claims the run record, then drives the run in the background.
async fn ingestion_start_handler(State(state): State<Arc<AppState>>) -> Response {
    let runner = state.services.ingestion.clone();
    let run = match runner.begin(Utc::now()).await {
        Ok(run) => run,
        Err(IngestError::Run(err)) => return run_store_error(err),
        Err(err) => return server_error(err.into()),
    };

    let claimed = run.clone();
    tokio::spawn(async move {
        if let Err(err) = runner.execute(&claimed, Utc::now()).await {
            warn!(error = %err, "background ingestion run failed");
        }
    });
    (
        StatusCode::ACCEPTED,
        Json(json!({ "run_id": run.run_id, "state": run.state })),
    )
        .into_response()
}

async fn declare_outage_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OutageRequest>,
) -> Response {
    let reason = request.reason.trim();
    if reason.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "an outage requires a non-empty reason");
    }
    match state.services.tracker.declare_outage(reason, Utc::now()).await {
        Ok(run) => Json(run).into_response(),
        Err(err) => run_store_error(err),
    }
}

async fn resolve_outage_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.services.tracker.resolve_outage(Utc::now()).await {
        Ok(run) => Json(run).into_response(),
        Err(err) => run_store_error(err),
    }
}

async fn pipeline_run_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PipelineRunRequest>,
) -> Response {
    let Some(selection) = request.selection() else {
        return api_error(
            StatusCode::BAD_REQUEST,
            "provide either `ids` or `auto_select: true`",
        );
    };
    match state.services.pipeline.run(selection, request.options).await {
        Ok(response @ PipelineResponse::Completed(_)) => Json(response).into_response(),
        Ok(response @ PipelineResponse::Queued { .. }) => {
            (StatusCode::ACCEPTED, Json(response)).into_response()
        }
        Err(err) => pipeline_error(err),
    }
}

async fn pipeline_job_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.services.pipeline.job(id).await {
        Some(record) => Json(record).into_response(),
        None => api_error(StatusCode::NOT_FOUND, format!("pipeline job {id} not found")),
    }
}

async fn opportunity_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.services.store.get_opportunity(id).await {
        Ok(Some(opportunity)) => Json(opportunity).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, format!("opportunity {id} not found")),
        Err(err) => server_error(err),
    }
}

async fn flag_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<OverrideQuery>,
) -> Response {
    override_status(&state, id, PipelineStatus::Flagged, query.force).await
}

async fn ignore_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<OverrideQuery>,
) -> Response {
    override_status(&state, id, PipelineStatus::Ignored, query.force).await
}

async fn override_status(state: &AppState, id: Uuid, status: PipelineStatus, force: bool) -> Response {
    let orchestrator = state.services.pipeline.orchestrator();
    if let Err(err) = orchestrator.override_status(id, status, force).await {
        return pipeline_error(err);
    }
    match state.services.store.get_opportunity(id).await {
        Ok(Some(opportunity)) => Json(opportunity).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, format!("opportunity {id} not found")),
        Err(err) => server_error(err),
    }
}

fn run_store_error(err: RunStoreError) -> Response {
    match err {
        RunStoreError::Transition(RunTransitionError::MissingReason) => {
            api_error(StatusCode::BAD_REQUEST, RunTransitionError::MissingReason)
        }
        RunStoreError::Transition(err) => api_error(StatusCode::CONFLICT, err),
        RunStoreError::Store(err) => server_error(err),
    }
}

fn pipeline_error(err: PipelineError) -> Response {
    match err {
        PipelineError::NotFound(_) => api_error(StatusCode::NOT_FOUND, err),
        PipelineError::IllegalStatus(_) => api_error(StatusCode::CONFLICT, err),
        PipelineError::QueueFull | PipelineError::QueueClosed => {
            api_error(StatusCode::SERVICE_UNAVAILABLE, err)
        }
        PipelineError::Store(err) => server_error(err),
    }
}

fn api_error(status: StatusCode, message: impl Display) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %format!("{err:#}"), "api request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}
