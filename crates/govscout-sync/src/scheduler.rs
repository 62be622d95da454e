use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use govscout_core::RunState;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::ingest::{IngestionRunner, IngestionSummary};

pub const MAINTENANCE_CRON: &str = "0 * * * * *";

#[derive(Debug)]
pub enum TickOutcome {
    NothingDue,
    OutageResolved,
    ProbeFailed(String),
    Retried(IngestionSummary),
}

/// One pass of outage probing and retry scheduling. Probes the listing
/// source while an outage is due for a check; reruns ingestion once a
/// scheduled retry is due.
pub async fn maintenance_tick(runner: &IngestionRunner, now: DateTime<Utc>) -> Result<TickOutcome> {
    let tracker = runner.tracker();
    let run = tracker.status().await.context("loading ingestion run")?;

    if run.in_outage() {
        if !run.retry_due(now) {
            return Ok(TickOutcome::NothingDue);
        }
        return match runner.listing().probe().await {
            Ok(()) => {
                tracker
                    .resolve_outage(now)
                    .await
                    .context("resolving outage after probe")?;
                Ok(TickOutcome::OutageResolved)
            }
            Err(err) => {
                let reason = err.to_string();
                tracker
                    .probe_failed(&reason, now)
                    .await
                    .context("recording failed outage probe")?;
                Ok(TickOutcome::ProbeFailed(reason))
            }
        };
    }

    let retryable = matches!(run.state, RunState::Failed | RunState::Idle);
    if !retryable || !run.retry_due(now) {
        return Ok(TickOutcome::NothingDue);
    }
    info!(retry_count = run.retry_count, "scheduled ingestion retry due");
    let summary = runner
        .run_once(now)
        .await
        .context("running scheduled ingestion retry")?;
    Ok(TickOutcome::Retried(summary))
}

/// Two daily ingestion jobs plus a once-a-minute maintenance tick. `None`
/// when scheduling is disabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    runner: Arc<IngestionRunner>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.ingest_cron_1, &config.ingest_cron_2] {
        let runner = runner.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let runner = runner.clone();
            Box::pin(async move {
                match runner.run_once(Utc::now()).await {
                    Ok(summary) => info!(
                        run_id = ?summary.run_id,
                        state = ?summary.state,
                        stored = summary.stats.stored,
                        "scheduled ingestion finished"
                    ),
                    Err(err) if err.is_conflict() => {
                        info!(error = %err, "scheduled ingestion skipped")
                    }
                    Err(err) => warn!(error = %err, "scheduled ingestion failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }

    let job = Job::new_async(MAINTENANCE_CRON, move |_uuid, _l| {
        let runner = runner.clone();
        Box::pin(async move {
            match maintenance_tick(&runner, Utc::now()).await {
                Ok(TickOutcome::NothingDue) => {}
                Ok(outcome) => info!(?outcome, "maintenance tick"),
                Err(err) => warn!(error = %format!("{err:#}"), "maintenance tick failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {MAINTENANCE_CRON}"))?;
    sched.add(job).await.context("adding scheduler job")?;

    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetingProfile;
    use crate::ingest::IngestConfig;
    use crate::status::StatusTracker;
    use chrono::Duration;
    use govscout_adapters::FixtureListingSource;
    use govscout_core::OutagePolicy;
    use govscout_storage::{MemoryStore, RetryPolicy};
    use std::path::Path;

    fn runner(listing: FixtureListingSource) -> IngestionRunner {
        let store = Arc::new(MemoryStore::new());
        let tracker = StatusTracker::new(store.clone(), OutagePolicy::default());
        let profile = TargetingProfile {
            naics_codes: vec!["541512".into()],
            ..TargetingProfile::default()
        };
        IngestionRunner::new(
            Arc::new(listing),
            store,
            tracker,
            profile,
            IngestConfig {
                retry: RetryPolicy::immediate(5),
                ..IngestConfig::default()
            },
        )
    }

    fn listing() -> FixtureListingSource {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
        FixtureListingSource::from_dir(root).unwrap()
    }

    #[tokio::test]
    async fn fresh_record_has_nothing_due() {
        let runner = runner(listing());
        let outcome = maintenance_tick(&runner, Utc::now()).await.unwrap();
        assert!(matches!(outcome, TickOutcome::NothingDue));
    }

    #[tokio::test]
    async fn successful_probe_resolves_outage_then_retry_runs() {
        let runner = runner(listing().fail_next_pages(3));
        let summary = runner.run_once(Utc::now()).await.unwrap();
        assert_eq!(summary.state, RunState::Outage);

        let probe_at = Utc::now() + Duration::hours(1);
        let outcome = maintenance_tick(&runner, probe_at).await.unwrap();
        assert!(matches!(outcome, TickOutcome::OutageResolved));
        let run = runner.tracker().status().await.unwrap();
        assert_eq!(run.state, RunState::Idle);
        assert_eq!(run.retry_count, 1);

        let early = maintenance_tick(&runner, probe_at).await.unwrap();
        assert!(matches!(early, TickOutcome::NothingDue));

        let retry_at = probe_at + Duration::minutes(10);
        match maintenance_tick(&runner, retry_at).await.unwrap() {
            TickOutcome::Retried(summary) => assert_eq!(summary.state, RunState::Completed),
            other => panic!("expected a retried run, got {other:?}"),
        }
        let run = runner.tracker().status().await.unwrap();
        assert!(run.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn failed_probe_keeps_outage_and_pushes_next_check() {
        let runner = runner(listing().fail_next_pages(3).fail_next_probes(1));
        runner.run_once(Utc::now()).await.unwrap();
        let before = runner.tracker().status().await.unwrap().next_retry_at;

        let probe_at = Utc::now() + Duration::hours(1);
        let outcome = maintenance_tick(&runner, probe_at).await.unwrap();
        assert!(matches!(outcome, TickOutcome::ProbeFailed(_)));

        let run = runner.tracker().status().await.unwrap();
        assert_eq!(run.state, RunState::Outage);
        assert!(run.next_retry_at > before);
    }

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let mut config = SyncConfig::from_env();
        config.scheduler_enabled = false;
        let built = maybe_build_scheduler(&config, Arc::new(runner(listing())))
            .await
            .unwrap();
        assert!(built.is_none());
    }
}
