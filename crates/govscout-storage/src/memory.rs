use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use govscout_core::{
    AnalysisResult, EnrichmentData, EnrichmentStatus, IngestionRun, IntelligenceSignals,
    Opportunity, PipelineStatus, RunTransition, ScoredOpportunity,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::repo::{
    manual_flags, OpportunityStore, RunEvent, RunStatusStore, RunStoreError, StatusUpdateError,
    UpsertOutcome, RUN_EVENT_RETENTION,
};

/// In-process store used by fixture runs and tests. The run record sits
/// behind one mutex so transitions are serialized the same way the row lock
/// serializes them in Postgres.
#[derive(Debug)]
pub struct MemoryStore {
    opportunities: Mutex<HashMap<Uuid, Opportunity>>,
    run: Mutex<RunLog>,
}

#[derive(Debug)]
struct RunLog {
    current: IngestionRun,
    events: Vec<RunEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            opportunities: Mutex::new(HashMap::new()),
            run: Mutex::new(RunLog {
                current: IngestionRun::idle(Utc::now()),
                events: Vec::new(),
            }),
        }
    }

    pub async fn all_opportunities(&self) -> Vec<Opportunity> {
        let map = self.opportunities.lock().await;
        let mut all: Vec<_> = map.values().cloned().collect();
        all.sort_by(|a, b| a.listing.notice_id.cmp(&b.listing.notice_id));
        all
    }

    async fn with_opportunity<F>(&self, id: Uuid, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut Opportunity) + Send,
    {
        let mut map = self.opportunities.lock().await;
        let opp = map
            .get_mut(&id)
            .ok_or_else(|| anyhow!("opportunity {id} not found"))?;
        f(opp);
        Ok(())
    }
}

#[async_trait]
impl OpportunityStore for MemoryStore {
    async fn upsert_opportunity(
        &self,
        scored: &ScoredOpportunity,
        now: DateTime<Utc>,
    ) -> anyhow::Result<UpsertOutcome> {
        let id = Opportunity::id_for(&scored.draft.notice_id);
        let mut map = self.opportunities.lock().await;
        let created = match map.get_mut(&id) {
            Some(existing) => {
                existing.apply_listing_update(scored, now);
                false
            }
            None => {
                map.insert(id, Opportunity::discovered(scored, now));
                true
            }
        };
        Ok(UpsertOutcome { id, created })
    }

    async fn get_opportunity(&self, id: Uuid) -> anyhow::Result<Option<Opportunity>> {
        Ok(self.opportunities.lock().await.get(&id).cloned())
    }

    async fn find_by_notice_id(&self, notice_id: &str) -> anyhow::Result<Option<Opportunity>> {
        self.get_opportunity(Opportunity::id_for(notice_id)).await
    }

    async fn count_opportunities(&self) -> anyhow::Result<u64> {
        Ok(self.opportunities.lock().await.len() as u64)
    }

    async fn select_pipeline_candidates(
        &self,
        min_score: u8,
        limit: usize,
    ) -> anyhow::Result<Vec<Uuid>> {
        let map = self.opportunities.lock().await;
        let mut candidates: Vec<_> = map
            .values()
            .filter(|opp| {
                opp.relevance.score >= min_score
                    && !opp.flagged
                    && !opp.ignored
                    && !matches!(
                        opp.pipeline_status,
                        PipelineStatus::Ready | PipelineStatus::Flagged | PipelineStatus::Ignored
                    )
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.relevance
                .score
                .cmp(&a.relevance.score)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(candidates.into_iter().take(limit).map(|opp| opp.id).collect())
    }

    async fn list_in_flight(&self) -> anyhow::Result<Vec<Uuid>> {
        let map = self.opportunities.lock().await;
        Ok(map
            .values()
            .filter(|opp| opp.pipeline_status.is_in_flight())
            .map(|opp| opp.id)
            .collect())
    }

    async fn set_pipeline_status(
        &self,
        id: Uuid,
        status: PipelineStatus,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<PipelineStatus, StatusUpdateError> {
        let mut map = self.opportunities.lock().await;
        let opp = map.get_mut(&id).ok_or(StatusUpdateError::NotFound(id))?;
        let previous = opp.pipeline_status;
        if !previous.can_transition_to(status, force) {
            return Err(StatusUpdateError::Illegal {
                from: previous,
                to: status,
            });
        }
        let (flagged, ignored) = manual_flags(status, opp.flagged, opp.ignored);
        opp.pipeline_status = status;
        opp.flagged = flagged;
        opp.ignored = ignored;
        opp.updated_at = now;
        Ok(previous)
    }

    async fn record_scrape(
        &self,
        id: Uuid,
        content: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let content = content.to_string();
        self.with_opportunity(id, move |opp| {
            opp.scraped = true;
            opp.scraped_content = Some(content);
            opp.scraped_at = Some(now);
            opp.updated_at = now;
        })
        .await
    }

    async fn record_enrichment(
        &self,
        id: Uuid,
        data: &EnrichmentData,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let data = data.clone();
        self.with_opportunity(id, move |opp| {
            opp.enrichment_status = EnrichmentStatus::Complete;
            opp.enrichment = Some(data);
            opp.enrichment_error = None;
            opp.updated_at = now;
        })
        .await
    }

    async fn record_enrichment_failure(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let error = error.to_string();
        self.with_opportunity(id, move |opp| {
            opp.enrichment_status = EnrichmentStatus::Failed;
            opp.enrichment_error = Some(error);
            opp.updated_at = now;
        })
        .await
    }

    async fn record_intelligence(
        &self,
        id: Uuid,
        signals: &IntelligenceSignals,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let signals = signals.clone();
        self.with_opportunity(id, move |opp| {
            opp.intelligence = Some(signals);
            opp.updated_at = now;
        })
        .await
    }

    async fn record_analysis(
        &self,
        id: Uuid,
        analysis: &AnalysisResult,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let analysis = analysis.clone();
        self.with_opportunity(id, move |opp| {
            opp.analysis = Some(analysis);
            opp.updated_at = now;
        })
        .await
    }

    async fn mark_error(&self, id: Uuid, message: &str, now: DateTime<Utc>) -> anyhow::Result<()> {
        let message = message.to_string();
        self.with_opportunity(id, move |opp| {
            opp.pipeline_status = PipelineStatus::Error;
            opp.last_error = Some(message);
            opp.updated_at = now;
        })
        .await
    }
}

#[async_trait]
impl RunStatusStore for MemoryStore {
    async fn current_run(&self) -> anyhow::Result<IngestionRun> {
        Ok(self.run.lock().await.current.clone())
    }

    async fn transition_run(
        &self,
        transition: RunTransition,
    ) -> Result<IngestionRun, RunStoreError> {
        let mut log = self.run.lock().await;
        let label = transition.label();
        let record = transition.records_event(&log.current);
        let mut next = log.current.clone();
        next.apply(transition)?;
        log.current = next.clone();
        if record {
            log.events.push(RunEvent {
                transition: label.to_string(),
                snapshot: next.clone(),
                recorded_at: next.updated_at,
            });
            let excess = log.events.len().saturating_sub(RUN_EVENT_RETENTION);
            log.events.drain(..excess);
        }
        Ok(next)
    }

    async fn run_history(&self, limit: usize) -> anyhow::Result<Vec<RunEvent>> {
        let log = self.run.lock().await;
        Ok(log.events.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use govscout_core::{
        OpportunityDraft, OutagePolicy, QueryStrategy, RelevanceScore, RunState,
        RunTransitionError,
    };
    use std::sync::Arc;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, minute, 0).single().unwrap()
    }

    fn scored(notice_id: &str, score: u8) -> ScoredOpportunity {
        ScoredOpportunity {
            draft: OpportunityDraft {
                notice_id: notice_id.to_string(),
                source_url: None,
                title: format!("Notice {notice_id}"),
                agency: Some("GENERAL SERVICES ADMINISTRATION".into()),
                solicitation_number: None,
                notice_type: Some("o".into()),
                naics_codes: vec!["541512".into()],
                psc_codes: vec![],
                set_aside_codes: vec![],
                description: None,
                description_url: None,
                posted_at: None,
                response_deadline: None,
                estimated_value: None,
                discovered_by: QueryStrategy::KeywordSearch,
                raw_payload: serde_json::json!({}),
            },
            relevance: RelevanceScore::new(score),
            analysis: None,
        }
    }

    #[tokio::test]
    async fn upsert_updates_listing_but_keeps_pipeline_status() {
        let store = MemoryStore::new();
        let first = store.upsert_opportunity(&scored("A-1", 60), ts(0)).await.unwrap();
        assert!(first.created);

        store
            .set_pipeline_status(first.id, PipelineStatus::Enriched, false, ts(1))
            .await
            .unwrap();

        let second = store.upsert_opportunity(&scored("A-1", 80), ts(2)).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.id, first.id);

        let stored = store.get_opportunity(first.id).await.unwrap().unwrap();
        assert_eq!(stored.pipeline_status, PipelineStatus::Enriched);
        assert_eq!(stored.relevance.score, 80);
        assert_eq!(store.count_opportunities().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn regressing_status_needs_force() {
        let store = MemoryStore::new();
        let id = store.upsert_opportunity(&scored("A-2", 60), ts(0)).await.unwrap().id;
        store
            .set_pipeline_status(id, PipelineStatus::Ready, false, ts(1))
            .await
            .unwrap();

        let err = store
            .set_pipeline_status(id, PipelineStatus::Scraping, false, ts(2))
            .await
            .unwrap_err();
        assert!(matches!(err, StatusUpdateError::Illegal { .. }));

        let previous = store
            .set_pipeline_status(id, PipelineStatus::Scraping, true, ts(3))
            .await
            .unwrap();
        assert_eq!(previous, PipelineStatus::Ready);
    }

    #[tokio::test]
    async fn candidates_skip_ready_and_ignored_and_sort_by_score() {
        let store = MemoryStore::new();
        let low = store.upsert_opportunity(&scored("C-1", 55), ts(0)).await.unwrap().id;
        let high = store.upsert_opportunity(&scored("C-2", 90), ts(0)).await.unwrap().id;
        let ready = store.upsert_opportunity(&scored("C-3", 95), ts(0)).await.unwrap().id;
        let ignored = store.upsert_opportunity(&scored("C-4", 99), ts(0)).await.unwrap().id;
        store.upsert_opportunity(&scored("C-5", 20), ts(0)).await.unwrap();

        store
            .set_pipeline_status(ready, PipelineStatus::Ready, false, ts(1))
            .await
            .unwrap();
        store
            .set_pipeline_status(ignored, PipelineStatus::Ignored, false, ts(1))
            .await
            .unwrap();

        let candidates = store.select_pipeline_candidates(50, 10).await.unwrap();
        assert_eq!(candidates, vec![high, low]);

        let stored = store.get_opportunity(ignored).await.unwrap().unwrap();
        assert!(stored.ignored);
        assert!(!stored.flagged);
    }

    #[tokio::test]
    async fn concurrent_starts_admit_exactly_one_run() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .transition_run(RunTransition::Start {
                        run_id: Uuid::new_v4(),
                        at: ts(5),
                    })
                    .await
            }));
        }

        let mut started = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => started += 1,
                Err(err) => {
                    assert!(err.is_conflict());
                    conflicts += 1;
                }
            }
        }
        assert_eq!(started, 1);
        assert_eq!(conflicts, 7);
        assert_eq!(store.run_history(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_transition_is_not_recorded() {
        let store = MemoryStore::new();
        let err = store
            .transition_run(RunTransition::ResolveOutage {
                at: ts(1),
                policy: OutagePolicy::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RunStoreError::Transition(RunTransitionError::NotInOutage)
        ));
        assert_eq!(store.current_run().await.unwrap().state, RunState::Idle);
        assert!(store.run_history(10).await.unwrap().is_empty());
    }

    fn fetch_failed(minute: u32) -> RunTransition {
        RunTransition::FetchFailed {
            reason: "HTTP 503".into(),
            at: ts(minute),
            policy: OutagePolicy::default(),
        }
    }

    #[tokio::test]
    async fn page_successes_stay_out_of_history() {
        let store = MemoryStore::new();
        store
            .transition_run(RunTransition::Start {
                run_id: Uuid::new_v4(),
                at: ts(1),
            })
            .await
            .unwrap();
        for minute in 2..12 {
            store
                .transition_run(RunTransition::FetchSucceeded { at: ts(minute) })
                .await
                .unwrap();
        }
        store.transition_run(fetch_failed(12)).await.unwrap();
        for minute in 13..20 {
            store
                .transition_run(RunTransition::FetchSucceeded { at: ts(minute) })
                .await
                .unwrap();
        }
        store
            .transition_run(RunTransition::Complete {
                stats: Default::default(),
                at: ts(20),
            })
            .await
            .unwrap();

        let labels: Vec<String> = store
            .run_history(20)
            .await
            .unwrap()
            .into_iter()
            .map(|event| event.transition)
            .collect();
        assert_eq!(
            labels,
            vec!["complete", "fetch_succeeded", "fetch_failed", "start"]
        );
        let run = store.current_run().await.unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.updated_at, ts(20));
    }

    #[tokio::test]
    async fn history_is_capped() {
        let store = MemoryStore::new();
        for _ in 0..(RUN_EVENT_RETENTION / 2 + 1) {
            store
                .transition_run(RunTransition::Start {
                    run_id: Uuid::new_v4(),
                    at: ts(1),
                })
                .await
                .unwrap();
            store
                .transition_run(RunTransition::Complete {
                    stats: Default::default(),
                    at: ts(2),
                })
                .await
                .unwrap();
        }
        let history = store.run_history(usize::MAX).await.unwrap();
        assert_eq!(history.len(), RUN_EVENT_RETENTION);
        assert_eq!(history[0].transition, "complete");
    }
}
