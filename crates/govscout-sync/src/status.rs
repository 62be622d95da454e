use std::sync::Arc;

use chrono::{DateTime, Utc};
use govscout_core::{IngestionRun, OutagePolicy, RunStats, RunTransition};
use govscout_storage::{RunEvent, RunStatusStore, RunStoreError};
use tracing::{error, info, warn};
use uuid::Uuid;

/// The only writer of the ingestion run record. Every call is one
/// transition applied atomically by the store.
#[derive(Clone)]
pub struct StatusTracker {
    store: Arc<dyn RunStatusStore>,
    policy: OutagePolicy,
}

impl StatusTracker {
    pub fn new(store: Arc<dyn RunStatusStore>, policy: OutagePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> OutagePolicy {
        self.policy
    }

    pub async fn status(&self) -> anyhow::Result<IngestionRun> {
        self.store.current_run().await
    }

    pub async fn history(&self, limit: usize) -> anyhow::Result<Vec<RunEvent>> {
        self.store.run_history(limit).await
    }

    /// Rejected with a conflict while a run is in progress or an outage is
    /// unresolved.
    pub async fn start_run(&self, now: DateTime<Utc>) -> Result<IngestionRun, RunStoreError> {
        let run_id = Uuid::new_v4();
        let run = self
            .store
            .transition_run(RunTransition::Start { run_id, at: now })
            .await?;
        info!(run_id = %run_id, "ingestion run started");
        Ok(run)
    }

    pub async fn fetch_succeeded(&self, now: DateTime<Utc>) -> Result<IngestionRun, RunStoreError> {
        self.store
            .transition_run(RunTransition::FetchSucceeded { at: now })
            .await
    }

    /// Count a transient fetch failure. The returned record is in `outage`
    /// once the consecutive failure threshold is reached.
    pub async fn fetch_failed(
        &self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<IngestionRun, RunStoreError> {
        let run = self
            .store
            .transition_run(RunTransition::FetchFailed {
                reason: reason.to_string(),
                at: now,
                policy: self.policy,
            })
            .await?;
        if run.in_outage() {
            error!(
                reason = run.outage_reason.as_deref().unwrap_or_default(),
                next_probe = ?run.next_retry_at,
                "listing source outage detected"
            );
        } else {
            warn!(
                consecutive = run.consecutive_failures,
                reason, "listing fetch failed"
            );
        }
        Ok(run)
    }

    pub async fn complete(
        &self,
        stats: RunStats,
        now: DateTime<Utc>,
    ) -> Result<IngestionRun, RunStoreError> {
        let run = self
            .store
            .transition_run(RunTransition::Complete { stats, at: now })
            .await?;
        info!(
            fetched = stats.fetched,
            deduplicated = stats.deduplicated,
            passed_filter = stats.passed_filter,
            above_threshold = stats.scored_above_threshold,
            stored = stats.stored,
            skipped = stats.skipped_malformed,
            "ingestion run completed"
        );
        Ok(run)
    }

    pub async fn fail(&self, message: &str, now: DateTime<Utc>) -> Result<IngestionRun, RunStoreError> {
        let run = self
            .store
            .transition_run(RunTransition::Fail {
                error: message.to_string(),
                at: now,
                policy: self.policy,
            })
            .await?;
        error!(error = message, next_retry = ?run.next_retry_at, "ingestion run failed");
        Ok(run)
    }

    pub async fn declare_outage(
        &self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<IngestionRun, RunStoreError> {
        let run = self
            .store
            .transition_run(RunTransition::DeclareOutage {
                reason: reason.to_string(),
                at: now,
                policy: self.policy,
            })
            .await?;
        warn!(reason, "listing source outage declared");
        Ok(run)
    }

    pub async fn resolve_outage(&self, now: DateTime<Utc>) -> Result<IngestionRun, RunStoreError> {
        let run = self
            .store
            .transition_run(RunTransition::ResolveOutage {
                at: now,
                policy: self.policy,
            })
            .await?;
        info!(
            retry_count = run.retry_count,
            next_retry = ?run.next_retry_at,
            "listing source outage resolved"
        );
        Ok(run)
    }

    pub async fn probe_failed(
        &self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<IngestionRun, RunStoreError> {
        let run = self
            .store
            .transition_run(RunTransition::OutageProbeFailed {
                reason: reason.to_string(),
                at: now,
                policy: self.policy,
            })
            .await?;
        warn!(reason, next_probe = ?run.next_retry_at, "outage probe failed");
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use govscout_core::RunState;
    use govscout_storage::MemoryStore;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 8, minute, 0).single().unwrap()
    }

    fn tracker() -> StatusTracker {
        StatusTracker::new(Arc::new(MemoryStore::new()), OutagePolicy::default())
    }

    #[tokio::test]
    async fn second_start_is_a_conflict_and_leaves_the_record() {
        let tracker = tracker();
        let first = tracker.start_run(at(0)).await.unwrap();
        let err = tracker.start_run(at(1)).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(tracker.status().await.unwrap(), first);
    }

    #[tokio::test]
    async fn three_consecutive_failures_enter_outage() {
        let tracker = tracker();
        tracker.start_run(at(0)).await.unwrap();
        tracker.fetch_failed("http status 503", at(1)).await.unwrap();
        tracker.fetch_succeeded(at(2)).await.unwrap();
        for minute in 3..5 {
            let run = tracker.fetch_failed("http status 503", at(minute)).await.unwrap();
            assert_eq!(run.state, RunState::Running);
        }
        let run = tracker.fetch_failed("http status 503", at(5)).await.unwrap();
        assert_eq!(run.state, RunState::Outage);
        assert!(run.outage_reason.is_some());
        assert_eq!(run.outage_detected_at, Some(at(5)));
        assert_eq!(run.error_count, 4);

        let err = tracker.start_run(at(6)).await.unwrap_err();
        assert!(err.is_conflict());

        let resolved = tracker.resolve_outage(at(7)).await.unwrap();
        assert_eq!(resolved.state, RunState::Idle);
        assert_eq!(resolved.retry_count, 1);
        assert!(resolved.next_retry_at.is_some());
        tracker.start_run(at(8)).await.unwrap();

        let history = tracker.history(3).await.unwrap();
        assert_eq!(history[0].transition, "start");
        assert_eq!(history[1].transition, "resolve_outage");
    }

    #[tokio::test]
    async fn declaring_an_outage_needs_a_reason() {
        let tracker = tracker();
        assert!(tracker.declare_outage("  ", at(0)).await.is_err());
        let run = tracker.declare_outage("maintenance window", at(0)).await.unwrap();
        assert!(run.in_outage());
        assert_eq!(run.outage_reason.as_deref(), Some("maintenance window"));
    }
}
