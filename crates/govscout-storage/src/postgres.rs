use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use govscout_core::{
    AgencyBehaviorProfile, AnalysisResult, EnrichmentData, IngestionRun, IntelFlag,
    IntelligenceSignals, Opportunity, OpportunityDraft, PipelineStatus, RelevanceScore,
    RunTransition, ScoredOpportunity, SetAsideEnforcement,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::repo::{
    manual_flags, OpportunityStore, RunEvent, RunStatusStore, RunStoreError, StatusUpdateError,
    UpsertOutcome, RUN_EVENT_RETENTION,
};

const OPPORTUNITY_COLUMNS: &str = r#"
    id, notice_id, source_url, title, agency, solicitation_number, notice_type,
    naics_codes, psc_codes, set_aside_codes, description, description_url,
    posted_at, response_deadline, estimated_value, discovered_by, raw_payload,
    relevance_score, pipeline_status, scraped, scraped_content, scraped_at,
    enrichment_status, enrichment, enrichment_error, analysis,
    incumbent_concentration_score, award_size_realism_ratio, recompete_likelihood,
    agency_behavior_profile, set_aside_enforcement, intel_flags, intel_calculated_at,
    flagged, ignored, last_error, created_at, updated_at
"#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        info!("database migrations applied");
        Ok(())
    }

    async fn fetch_one_where(
        &self,
        predicate: &str,
        bind: OpportunityKey<'_>,
    ) -> anyhow::Result<Option<Opportunity>> {
        let sql = format!("SELECT {OPPORTUNITY_COLUMNS} FROM opportunities WHERE {predicate}");
        let query = sqlx::query_as::<_, OpportunityRow>(&sql);
        let query = match bind {
            OpportunityKey::Id(id) => query.bind(id),
            OpportunityKey::NoticeId(notice_id) => query.bind(notice_id),
        };
        let row = query
            .fetch_optional(&self.pool)
            .await
            .context("loading opportunity")?;
        row.map(Opportunity::try_from).transpose()
    }
}

fn ensure_updated(result: sqlx::postgres::PgQueryResult, id: Uuid) -> anyhow::Result<()> {
    if result.rows_affected() == 0 {
        return Err(anyhow!("opportunity {id} not found"));
    }
    Ok(())
}

enum OpportunityKey<'a> {
    Id(Uuid),
    NoticeId(&'a str),
}

#[derive(Debug, FromRow)]
struct OpportunityRow {
    id: Uuid,
    notice_id: String,
    source_url: Option<String>,
    title: String,
    agency: Option<String>,
    solicitation_number: Option<String>,
    notice_type: Option<String>,
    naics_codes: Vec<String>,
    psc_codes: Vec<String>,
    set_aside_codes: Vec<String>,
    description: Option<String>,
    description_url: Option<String>,
    posted_at: Option<DateTime<Utc>>,
    response_deadline: Option<DateTime<Utc>>,
    estimated_value: Option<f64>,
    discovered_by: String,
    raw_payload: Json<JsonValue>,
    relevance_score: i16,
    pipeline_status: String,
    scraped: bool,
    scraped_content: Option<String>,
    scraped_at: Option<DateTime<Utc>>,
    enrichment_status: String,
    enrichment: Option<Json<EnrichmentData>>,
    enrichment_error: Option<String>,
    analysis: Option<Json<AnalysisResult>>,
    incumbent_concentration_score: Option<f64>,
    award_size_realism_ratio: Option<f64>,
    recompete_likelihood: Option<f64>,
    agency_behavior_profile: Option<Json<AgencyBehaviorProfile>>,
    set_aside_enforcement: Option<Json<SetAsideEnforcement>>,
    intel_flags: Option<Vec<String>>,
    intel_calculated_at: Option<DateTime<Utc>>,
    flagged: bool,
    ignored: bool,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OpportunityRow> for Opportunity {
    type Error = anyhow::Error;

    fn try_from(row: OpportunityRow) -> anyhow::Result<Self> {
        let intelligence = match row.intel_calculated_at {
            Some(calculated_at) => Some(IntelligenceSignals {
                incumbent_concentration_score: row.incumbent_concentration_score,
                award_size_realism_ratio: row.award_size_realism_ratio,
                recompete_likelihood: row.recompete_likelihood,
                agency_behavior_profile: row.agency_behavior_profile.map(|j| j.0),
                set_aside_enforcement: row.set_aside_enforcement.map(|j| j.0),
                flags: row
                    .intel_flags
                    .unwrap_or_default()
                    .iter()
                    .map(|flag| flag.parse::<IntelFlag>())
                    .collect::<Result<_, _>>()?,
                calculated_at,
            }),
            None => None,
        };
        let score = u8::try_from(row.relevance_score)
            .map_err(|_| anyhow!("relevance score {} out of range", row.relevance_score))?;

        Ok(Opportunity {
            id: row.id,
            listing: OpportunityDraft {
                notice_id: row.notice_id,
                source_url: row.source_url,
                title: row.title,
                agency: row.agency,
                solicitation_number: row.solicitation_number,
                notice_type: row.notice_type,
                naics_codes: row.naics_codes,
                psc_codes: row.psc_codes,
                set_aside_codes: row.set_aside_codes,
                description: row.description,
                description_url: row.description_url,
                posted_at: row.posted_at,
                response_deadline: row.response_deadline,
                estimated_value: row.estimated_value,
                discovered_by: row.discovered_by.parse()?,
                raw_payload: row.raw_payload.0,
            },
            relevance: RelevanceScore::new(score),
            pipeline_status: row.pipeline_status.parse()?,
            scraped: row.scraped,
            scraped_content: row.scraped_content,
            scraped_at: row.scraped_at,
            enrichment_status: row.enrichment_status.parse()?,
            enrichment: row.enrichment.map(|j| j.0),
            enrichment_error: row.enrichment_error,
            analysis: row.analysis.map(|j| j.0),
            intelligence,
            flagged: row.flagged,
            ignored: row.ignored,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl OpportunityStore for PgStore {
    async fn upsert_opportunity(
        &self,
        scored: &ScoredOpportunity,
        now: DateTime<Utc>,
    ) -> anyhow::Result<UpsertOutcome> {
        let draft = &scored.draft;
        let row = sqlx::query(
            r#"
            INSERT INTO opportunities (
                id, notice_id, source_url, title, agency, solicitation_number, notice_type,
                naics_codes, psc_codes, set_aside_codes, description, description_url,
                posted_at, response_deadline, estimated_value, discovered_by, raw_payload,
                relevance_score, relevance_tier, analysis, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $21)
            ON CONFLICT (notice_id) DO UPDATE SET
                source_url = EXCLUDED.source_url,
                title = EXCLUDED.title,
                agency = EXCLUDED.agency,
                solicitation_number = EXCLUDED.solicitation_number,
                notice_type = EXCLUDED.notice_type,
                naics_codes = EXCLUDED.naics_codes,
                psc_codes = EXCLUDED.psc_codes,
                set_aside_codes = EXCLUDED.set_aside_codes,
                description = EXCLUDED.description,
                description_url = EXCLUDED.description_url,
                posted_at = EXCLUDED.posted_at,
                response_deadline = EXCLUDED.response_deadline,
                estimated_value = EXCLUDED.estimated_value,
                discovered_by = EXCLUDED.discovered_by,
                raw_payload = EXCLUDED.raw_payload,
                relevance_score = EXCLUDED.relevance_score,
                relevance_tier = EXCLUDED.relevance_tier,
                analysis = COALESCE(EXCLUDED.analysis, opportunities.analysis),
                updated_at = EXCLUDED.updated_at
            RETURNING id, (xmax = 0) AS created
            "#,
        )
        .bind(Opportunity::id_for(&draft.notice_id))
        .bind(&draft.notice_id)
        .bind(&draft.source_url)
        .bind(&draft.title)
        .bind(&draft.agency)
        .bind(&draft.solicitation_number)
        .bind(&draft.notice_type)
        .bind(&draft.naics_codes)
        .bind(&draft.psc_codes)
        .bind(&draft.set_aside_codes)
        .bind(&draft.description)
        .bind(&draft.description_url)
        .bind(draft.posted_at)
        .bind(draft.response_deadline)
        .bind(draft.estimated_value)
        .bind(draft.discovered_by.as_str())
        .bind(Json(&draft.raw_payload))
        .bind(i16::from(scored.relevance.score))
        .bind(scored.relevance.tier.as_str())
        .bind(scored.analysis.as_ref().map(Json))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upserting opportunity {}", draft.notice_id))?;

        let outcome = UpsertOutcome {
            id: row.try_get("id")?,
            created: row.try_get("created")?,
        };
        debug!(notice_id = %draft.notice_id, created = outcome.created, "opportunity upserted");
        Ok(outcome)
    }

    async fn get_opportunity(&self, id: Uuid) -> anyhow::Result<Option<Opportunity>> {
        self.fetch_one_where("id = $1", OpportunityKey::Id(id)).await
    }

    async fn find_by_notice_id(&self, notice_id: &str) -> anyhow::Result<Option<Opportunity>> {
        self.fetch_one_where("notice_id = $1", OpportunityKey::NoticeId(notice_id))
            .await
    }

    async fn count_opportunities(&self) -> anyhow::Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM opportunities")
            .fetch_one(&self.pool)
            .await
            .context("counting opportunities")?;
        Ok(count.max(0) as u64)
    }

    async fn select_pipeline_candidates(
        &self,
        min_score: u8,
        limit: usize,
    ) -> anyhow::Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT id
              FROM opportunities
             WHERE relevance_score >= $1
               AND NOT flagged
               AND NOT ignored
               AND pipeline_status NOT IN ('ready', 'flagged', 'ignored')
             ORDER BY relevance_score DESC, created_at ASC
             LIMIT $2
            "#,
        )
        .bind(i16::from(min_score))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("selecting pipeline candidates")?;
        Ok(ids)
    }

    async fn list_in_flight(&self) -> anyhow::Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT id
              FROM opportunities
             WHERE pipeline_status IN ('scraping', 'enriching', 'analyzing')
             ORDER BY updated_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing in-flight opportunities")?;
        Ok(ids)
    }

    async fn set_pipeline_status(
        &self,
        id: Uuid,
        status: PipelineStatus,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<PipelineStatus, StatusUpdateError> {
        let mut tx = self.pool.begin().await.context("opening status transaction")?;
        let row = sqlx::query(
            "SELECT pipeline_status, flagged, ignored FROM opportunities WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .context("locking opportunity status")?
        .ok_or(StatusUpdateError::NotFound(id))?;

        let current: String = row.try_get("pipeline_status").context("reading status")?;
        let previous: PipelineStatus = current.parse().map_err(anyhow::Error::from)?;
        if !previous.can_transition_to(status, force) {
            return Err(StatusUpdateError::Illegal {
                from: previous,
                to: status,
            });
        }
        let flagged: bool = row.try_get("flagged").context("reading flagged")?;
        let ignored: bool = row.try_get("ignored").context("reading ignored")?;
        let (flagged, ignored) = manual_flags(status, flagged, ignored);

        sqlx::query(
            r#"
            UPDATE opportunities
               SET pipeline_status = $2, flagged = $3, ignored = $4, updated_at = $5
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(flagged)
        .bind(ignored)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("updating pipeline status")?;
        tx.commit().await.context("committing status update")?;
        Ok(previous)
    }

    async fn record_scrape(
        &self,
        id: Uuid,
        content: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE opportunities
               SET scraped = TRUE, scraped_content = $2, scraped_at = $3, updated_at = $3
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(content)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("recording scrape")?;
        ensure_updated(result, id)
    }

    async fn record_enrichment(
        &self,
        id: Uuid,
        data: &EnrichmentData,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE opportunities
               SET enrichment_status = 'complete', enrichment = $2,
                   enrichment_error = NULL, updated_at = $3
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Json(data))
        .bind(now)
        .execute(&self.pool)
        .await
        .context("recording enrichment")?;
        ensure_updated(result, id)
    }

    async fn record_enrichment_failure(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE opportunities
               SET enrichment_status = 'failed', enrichment_error = $2, updated_at = $3
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("recording enrichment failure")?;
        ensure_updated(result, id)
    }

    async fn record_intelligence(
        &self,
        id: Uuid,
        signals: &IntelligenceSignals,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let flags: Vec<String> = signals.flags.iter().map(|f| f.as_str().to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE opportunities
               SET incumbent_concentration_score = $2,
                   award_size_realism_ratio = $3,
                   recompete_likelihood = $4,
                   agency_behavior_profile = $5,
                   set_aside_enforcement = $6,
                   intel_flags = $7,
                   intel_calculated_at = $8,
                   updated_at = $9
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(signals.incumbent_concentration_score)
        .bind(signals.award_size_realism_ratio)
        .bind(signals.recompete_likelihood)
        .bind(signals.agency_behavior_profile.as_ref().map(Json))
        .bind(signals.set_aside_enforcement.as_ref().map(Json))
        .bind(flags)
        .bind(signals.calculated_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("recording intelligence signals")?;
        ensure_updated(result, id)
    }

    async fn record_analysis(
        &self,
        id: Uuid,
        analysis: &AnalysisResult,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let result = sqlx::query("UPDATE opportunities SET analysis = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(Json(analysis))
            .bind(now)
            .execute(&self.pool)
            .await
            .context("recording analysis")?;
        ensure_updated(result, id)
    }

    async fn mark_error(&self, id: Uuid, message: &str, now: DateTime<Utc>) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE opportunities
               SET pipeline_status = 'error', last_error = $2, updated_at = $3
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(message)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("marking opportunity as errored")?;
        ensure_updated(result, id)
    }
}

#[async_trait]
impl RunStatusStore for PgStore {
    async fn current_run(&self) -> anyhow::Result<IngestionRun> {
        let record: Option<Json<IngestionRun>> =
            sqlx::query_scalar("SELECT record FROM ingestion_status WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .context("loading ingestion status")?;
        Ok(record
            .map(|Json(run)| run)
            .unwrap_or_else(|| IngestionRun::idle(Utc::now())))
    }

    async fn transition_run(
        &self,
        transition: RunTransition,
    ) -> Result<IngestionRun, RunStoreError> {
        let label = transition.label();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("opening ingestion status transaction")?;

        let seed = IngestionRun::idle(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO ingestion_status (id, state, record, updated_at)
            VALUES (1, $1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(seed.state.as_str())
        .bind(Json(&seed))
        .bind(seed.updated_at)
        .execute(&mut *tx)
        .await
        .context("seeding ingestion status")?;

        let Json(mut run): Json<IngestionRun> =
            sqlx::query_scalar("SELECT record FROM ingestion_status WHERE id = 1 FOR UPDATE")
                .fetch_one(&mut *tx)
                .await
                .context("locking ingestion status")?;

        let record = transition.records_event(&run);
        // Dropping the transaction on a rejected transition rolls back the lock.
        run.apply(transition)?;

        sqlx::query(
            "UPDATE ingestion_status SET state = $1, record = $2, updated_at = $3 WHERE id = 1",
        )
        .bind(run.state.as_str())
        .bind(Json(&run))
        .bind(run.updated_at)
        .execute(&mut *tx)
        .await
        .context("saving ingestion status")?;

        if record {
            sqlx::query(
                r#"
                INSERT INTO ingestion_run_events (transition, state, snapshot, recorded_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(label)
            .bind(run.state.as_str())
            .bind(Json(&run))
            .bind(run.updated_at)
            .execute(&mut *tx)
            .await
            .context("appending ingestion run event")?;

            sqlx::query(
                r#"
                DELETE FROM ingestion_run_events
                 WHERE id < (SELECT id FROM ingestion_run_events ORDER BY id DESC OFFSET $1 LIMIT 1)
                "#,
            )
            .bind(RUN_EVENT_RETENTION as i64 - 1)
            .execute(&mut *tx)
            .await
            .context("pruning ingestion run events")?;
        }

        tx.commit().await.context("committing ingestion status")?;
        debug!(transition = label, state = %run.state, "ingestion status updated");
        Ok(run)
    }

    async fn run_history(&self, limit: usize) -> anyhow::Result<Vec<RunEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT transition, snapshot, recorded_at
              FROM ingestion_run_events
             ORDER BY id DESC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("loading ingestion run history")?;

        rows.into_iter()
            .map(|row| -> anyhow::Result<RunEvent> {
                let Json(snapshot): Json<IngestionRun> = row.try_get("snapshot")?;
                Ok(RunEvent {
                    transition: row.try_get("transition")?,
                    snapshot,
                    recorded_at: row.try_get("recorded_at")?,
                })
            })
            .collect()
    }
}
