use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::pipeline::{BatchSummary, PipelineError, PipelineOptions, PipelineOrchestrator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub state: JobState,
    pub queued: usize,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Option<BatchSummary>,
}

struct Job {
    id: Uuid,
    ids: Vec<Uuid>,
    options: PipelineOptions,
}

type Registry = Arc<RwLock<HashMap<Uuid, JobRecord>>>;

pub const FINISHED_JOB_TTL_MINUTES: i64 = 60;
pub const MAX_FINISHED_JOBS: usize = 256;

/// Drops completed records older than `ttl`, then the oldest completed ones
/// past `cap`. Queued and running records are never dropped.
pub fn prune_finished(
    jobs: &mut HashMap<Uuid, JobRecord>,
    now: DateTime<Utc>,
    ttl: Duration,
    cap: usize,
) -> usize {
    let before = jobs.len();
    jobs.retain(|_, record| match (record.state, record.finished_at) {
        (JobState::Completed, Some(finished)) => now - finished <= ttl,
        _ => true,
    });

    let mut finished: Vec<(DateTime<Utc>, Uuid)> = jobs
        .values()
        .filter(|record| record.state == JobState::Completed)
        .map(|record| (record.finished_at.unwrap_or(record.submitted_at), record.job_id))
        .collect();
    if finished.len() > cap {
        finished.sort();
        for (_, id) in &finished[..finished.len() - cap] {
            jobs.remove(id);
        }
    }
    before - jobs.len()
}

fn prune_registry(jobs: &mut HashMap<Uuid, JobRecord>) {
    let dropped = prune_finished(
        jobs,
        Utc::now(),
        Duration::minutes(FINISHED_JOB_TTL_MINUTES),
        MAX_FINISHED_JOBS,
    );
    if dropped > 0 {
        debug!(dropped, "pruned finished pipeline jobs");
    }
}

/// Bounded queue of pipeline batches drained by one worker task. Finished
/// jobs stay pollable for [`FINISHED_JOB_TTL_MINUTES`], up to
/// [`MAX_FINISHED_JOBS`] of them.
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<Job>,
    registry: Registry,
}

impl JobQueue {
    /// Must be called inside a tokio runtime.
    pub fn start(orchestrator: Arc<PipelineOrchestrator>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let registry: Registry = Arc::default();
        let worker = tokio::spawn(run_worker(orchestrator, receiver, registry.clone()));
        (Self { sender, registry }, worker)
    }

    pub async fn submit(
        &self,
        ids: Vec<Uuid>,
        options: PipelineOptions,
    ) -> Result<Uuid, PipelineError> {
        let id = Uuid::new_v4();
        let record = JobRecord {
            job_id: id,
            state: JobState::Queued,
            queued: ids.len(),
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            summary: None,
        };
        // Registered first so the worker always finds the record.
        {
            let mut jobs = self.registry.write().await;
            prune_registry(&mut jobs);
            jobs.insert(id, record);
        }
        let sent = self.sender.try_send(Job { id, ids, options });
        if let Err(err) = sent {
            self.registry.write().await.remove(&id);
            return Err(match err {
                mpsc::error::TrySendError::Full(_) => PipelineError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => PipelineError::QueueClosed,
            });
        }
        Ok(id)
    }

    pub async fn job(&self, id: Uuid) -> Option<JobRecord> {
        self.registry.read().await.get(&id).cloned()
    }
}

async fn run_worker(
    orchestrator: Arc<PipelineOrchestrator>,
    mut receiver: mpsc::Receiver<Job>,
    registry: Registry,
) {
    while let Some(job) = receiver.recv().await {
        if let Some(record) = registry.write().await.get_mut(&job.id) {
            record.state = JobState::Running;
            record.started_at = Some(Utc::now());
        }
        let summary = orchestrator
            .process_batch(job.ids, job.options)
            .instrument(info_span!("pipeline_job", job_id = %job.id))
            .await;
        info!(
            job_id = %job.id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "pipeline job completed"
        );
        let mut jobs = registry.write().await;
        if let Some(record) = jobs.get_mut(&job.id) {
            record.state = JobState::Completed;
            record.finished_at = Some(Utc::now());
            record.summary = Some(summary);
        }
        prune_registry(&mut jobs);
    }
    info!("pipeline job queue closed");
}
