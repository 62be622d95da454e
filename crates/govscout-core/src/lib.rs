//! Core domain model for contract opportunity discovery, scoring and enrichment.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

/// Minimum relevance score an opportunity needs before it is scraped,
/// enriched or sent for analysis.
pub const DEFAULT_SCORE_THRESHOLD: u8 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

mod run;

pub use run::{IngestionRun, OutagePolicy, RunState, RunStats, RunTransition, RunTransitionError};

/// Discovery strategies in their fixed enumeration order. Deduplication
/// attributes a notice to the first strategy in this order that found it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStrategy {
    NaicsTargeted,
    SetAsideTargeted,
    KeywordSearch,
    AgencyTargeted,
}

text_enum!(QueryStrategy, "query strategy", {
    NaicsTargeted => "naics_targeted",
    SetAsideTargeted => "set_aside_targeted",
    KeywordSearch => "keyword_search",
    AgencyTargeted => "agency_targeted",
});

impl QueryStrategy {
    pub const ALL: [QueryStrategy; 4] = [
        QueryStrategy::NaicsTargeted,
        QueryStrategy::SetAsideTargeted,
        QueryStrategy::KeywordSearch,
        QueryStrategy::AgencyTargeted,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    High,
    Medium,
    Low,
}

text_enum!(Tier, "tier", {
    High => "high",
    Medium => "medium",
    Low => "low",
});

impl Tier {
    pub fn from_score(score: u8) -> Self {
        if score >= 70 {
            Tier::High
        } else if score >= 40 {
            Tier::Medium
        } else {
            Tier::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelevanceScore {
    pub score: u8,
    pub tier: Tier,
}

impl RelevanceScore {
    pub fn new(score: u8) -> Self {
        let score = score.min(100);
        Self {
            score,
            tier: Tier::from_score(score),
        }
    }

    pub fn meets(&self, threshold: u8) -> bool {
        self.score >= threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Discovered,
    Scraping,
    Scraped,
    Enriching,
    Enriched,
    Analyzing,
    Analyzed,
    Ready,
    Flagged,
    Ignored,
    Error,
}

text_enum!(PipelineStatus, "pipeline status", {
    Discovered => "discovered",
    Scraping => "scraping",
    Scraped => "scraped",
    Enriching => "enriching",
    Enriched => "enriched",
    Analyzing => "analyzing",
    Analyzed => "analyzed",
    Ready => "ready",
    Flagged => "flagged",
    Ignored => "ignored",
    Error => "error",
});

impl PipelineStatus {
    fn stage_rank(self) -> Option<u8> {
        match self {
            PipelineStatus::Discovered => Some(0),
            PipelineStatus::Scraping => Some(1),
            PipelineStatus::Scraped => Some(2),
            PipelineStatus::Enriching => Some(3),
            PipelineStatus::Enriched => Some(4),
            PipelineStatus::Analyzing => Some(5),
            PipelineStatus::Analyzed => Some(6),
            PipelineStatus::Ready => Some(7),
            PipelineStatus::Flagged | PipelineStatus::Ignored | PipelineStatus::Error => None,
        }
    }

    /// A stage was entered but its completion was never recorded.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            PipelineStatus::Scraping | PipelineStatus::Enriching | PipelineStatus::Analyzing
        )
    }

    /// Forward moves along the stage chain are always allowed, as is entering
    /// `error` or a manual side branch. Anything that would move an item back
    /// to an earlier stage, or out of `flagged`/`ignored`, needs `force`.
    /// Items in `error` may re-enter any stage.
    pub fn can_transition_to(self, next: PipelineStatus, force: bool) -> bool {
        if self == next || force || next == PipelineStatus::Error || self == PipelineStatus::Error {
            return true;
        }
        match (self.stage_rank(), next.stage_rank()) {
            (Some(from), Some(to)) => to > from,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Pending,
    Complete,
    Failed,
}

text_enum!(EnrichmentStatus, "enrichment status", {
    Pending => "pending",
    Complete => "complete",
    Failed => "failed",
});

/// Canonical listing shape produced by the normalizer, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityDraft {
    /// External notice identifier, or `url:<source url>` when the source
    /// omitted one.
    pub notice_id: String,
    pub source_url: Option<String>,
    pub title: String,
    pub agency: Option<String>,
    pub solicitation_number: Option<String>,
    pub notice_type: Option<String>,
    #[serde(default)]
    pub naics_codes: Vec<String>,
    #[serde(default)]
    pub psc_codes: Vec<String>,
    #[serde(default)]
    pub set_aside_codes: Vec<String>,
    pub description: Option<String>,
    pub description_url: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub response_deadline: Option<DateTime<Utc>>,
    pub estimated_value: Option<f64>,
    pub discovered_by: QueryStrategy,
    pub raw_payload: JsonValue,
}

/// A normalized listing that passed the hard filter, with its score and an
/// optional analysis produced during ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredOpportunity {
    pub draft: OpportunityDraft,
    pub relevance: RelevanceScore,
    pub analysis: Option<AnalysisResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub listing: OpportunityDraft,
    pub relevance: RelevanceScore,
    pub pipeline_status: PipelineStatus,
    pub scraped: bool,
    pub scraped_content: Option<String>,
    pub scraped_at: Option<DateTime<Utc>>,
    pub enrichment_status: EnrichmentStatus,
    pub enrichment: Option<EnrichmentData>,
    pub enrichment_error: Option<String>,
    pub analysis: Option<AnalysisResult>,
    pub intelligence: Option<IntelligenceSignals>,
    pub flagged: bool,
    pub ignored: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Opportunity {
    /// Stable internal id derived from the external identity key.
    pub fn id_for(notice_id: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("govscout:notice:{notice_id}").as_bytes())
    }

    pub fn discovered(scored: &ScoredOpportunity, now: DateTime<Utc>) -> Self {
        Self {
            id: Self::id_for(&scored.draft.notice_id),
            listing: scored.draft.clone(),
            relevance: scored.relevance,
            pipeline_status: PipelineStatus::Discovered,
            scraped: false,
            scraped_content: None,
            scraped_at: None,
            enrichment_status: EnrichmentStatus::Pending,
            enrichment: None,
            enrichment_error: None,
            analysis: scored.analysis.clone(),
            intelligence: None,
            flagged: false,
            ignored: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Re-ingestion overwrites listing data and score; pipeline state is
    /// left alone and an existing analysis survives an empty update.
    pub fn apply_listing_update(&mut self, scored: &ScoredOpportunity, now: DateTime<Utc>) {
        self.listing = scored.draft.clone();
        self.relevance = scored.relevance;
        if let Some(analysis) = &scored.analysis {
            self.analysis = Some(analysis.clone());
        }
        self.updated_at = now;
    }

    pub fn summary(&self) -> OpportunitySummary {
        OpportunitySummary::from_draft(&self.listing)
    }
}

/// Compact view of an opportunity sent to the analysis service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunitySummary {
    pub notice_id: String,
    pub title: String,
    pub agency: Option<String>,
    pub naics_codes: Vec<String>,
    pub set_aside_codes: Vec<String>,
    pub description: Option<String>,
}

impl OpportunitySummary {
    pub fn from_draft(draft: &OpportunityDraft) -> Self {
        Self {
            notice_id: draft.notice_id.clone(),
            title: draft.title.clone(),
            agency: draft.agency.clone(),
            naics_codes: draft.naics_codes.clone(),
            set_aside_codes: draft.set_aside_codes.clone(),
            description: draft.description.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Pursue,
    Monitor,
    Pass,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub capability_tags: Vec<String>,
    pub recommended_action: RecommendedAction,
    #[serde(default)]
    pub relevance_summary: String,
}

/// One past award from the historical spending source. Read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalAward {
    pub award_id: String,
    pub recipient: String,
    pub awarding_agency: Option<String>,
    pub obligated_amount: f64,
    pub naics_code: Option<String>,
    pub psc_code: Option<String>,
    pub set_aside_type: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AwardStats {
    pub count: usize,
    pub average_obligation: Option<f64>,
    pub min_obligation: Option<f64>,
    pub max_obligation: Option<f64>,
    pub unique_recipients: Vec<String>,
    pub unique_agencies: Vec<String>,
    pub typical_duration_days: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentData {
    pub matched: AwardStats,
    /// Awards matching the opportunity's codes and agency, largest first.
    pub awards: Vec<HistoricalAward>,
    /// Awards by the same agency regardless of code, for agency-level signals.
    pub agency_awards: Vec<HistoricalAward>,
    pub queried_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgencyBehaviorProfile {
    pub new_vendor_acceptance_rate: f64,
    pub typical_award_size_avg: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnforcementStrength {
    Strict,
    Moderate,
    Weak,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetAsideEnforcement {
    pub enforcement_strength: EnforcementStrength,
    pub compliance_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntelFlag {
    HighIncumbentLockIn,
    SamValueInflated,
    LikelyRecompete,
    AgencyRarelyAwardsToNewVendors,
    SetAsideEnforcementWeak,
}

text_enum!(IntelFlag, "intelligence flag", {
    HighIncumbentLockIn => "HIGH_INCUMBENT_LOCK_IN",
    SamValueInflated => "SAM_VALUE_INFLATED",
    LikelyRecompete => "LIKELY_RECOMPETE",
    AgencyRarelyAwardsToNewVendors => "AGENCY_RARELY_AWARDS_TO_NEW_VENDORS",
    SetAsideEnforcementWeak => "SET_ASIDE_ENFORCEMENT_WEAK",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntelligenceSignals {
    pub incumbent_concentration_score: Option<f64>,
    pub award_size_realism_ratio: Option<f64>,
    pub recompete_likelihood: Option<f64>,
    pub agency_behavior_profile: Option<AgencyBehaviorProfile>,
    pub set_aside_enforcement: Option<SetAsideEnforcement>,
    #[serde(default)]
    pub flags: Vec<IntelFlag>,
    pub calculated_at: DateTime<Utc>,
}

impl IntelligenceSignals {
    pub fn has_flag(&self, flag: IntelFlag) -> bool {
        self.flags.contains(&flag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn no_delay(max_retries: usize) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}
