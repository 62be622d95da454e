use std::sync::Arc;

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use govscout_adapters::{AwardQuery, HistoricalAwardSource};
use govscout_core::{AwardStats, EnrichmentData, HistoricalAward, OpportunityDraft};
use govscout_storage::FetchError;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrichmentConfig {
    pub award_limit: usize,
    pub lookback_years: u32,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            award_limit: 100,
            lookback_years: 5,
        }
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|existing| existing == value) {
        list.push(value.to_string());
    }
}

pub fn summarize_awards(awards: &[HistoricalAward]) -> AwardStats {
    if awards.is_empty() {
        return AwardStats::default();
    }
    let amounts = awards.iter().map(|award| award.obligated_amount);
    let total: f64 = amounts.clone().sum();
    let min = amounts.clone().fold(f64::INFINITY, f64::min);
    let max = amounts.fold(f64::NEG_INFINITY, f64::max);

    let mut unique_recipients = Vec::new();
    let mut unique_agencies = Vec::new();
    for award in awards {
        push_unique(&mut unique_recipients, &award.recipient);
        if let Some(agency) = &award.awarding_agency {
            push_unique(&mut unique_agencies, agency);
        }
    }

    let durations: Vec<f64> = awards
        .iter()
        .filter_map(|award| match (award.start_date, award.end_date) {
            (Some(start), Some(end)) if end >= start => Some((end - start).num_days() as f64),
            _ => None,
        })
        .collect();
    let typical_duration_days =
        (!durations.is_empty()).then(|| durations.iter().sum::<f64>() / durations.len() as f64);

    AwardStats {
        count: awards.len(),
        average_obligation: Some(total / awards.len() as f64),
        min_obligation: Some(min),
        max_obligation: Some(max),
        unique_recipients,
        unique_agencies,
        typical_duration_days,
    }
}

/// Listing agencies arrive as `HEALTH AND HUMAN SERVICES, DEPARTMENT OF`;
/// award data names the same agency `Department of Health and Human Services`.
pub fn award_agency_name(agency: &str) -> String {
    let agency = agency.trim();
    match agency.strip_suffix(", DEPARTMENT OF") {
        Some(name) => format!("DEPARTMENT OF {}", name.trim()),
        None => agency.to_string(),
    }
}

fn window_start(today: NaiveDate, years: u32) -> NaiveDate {
    today
        .checked_sub_months(Months::new(years * 12))
        .unwrap_or_else(|| {
            NaiveDate::from_ymd_opt(today.year() - years as i32, 1, 1).unwrap_or(today)
        })
}

/// Historical award lookups for one opportunity: awards matching its codes
/// and agency, plus the agency's awards regardless of code.
#[derive(Clone)]
pub struct EnrichmentService {
    source: Arc<dyn HistoricalAwardSource>,
    config: EnrichmentConfig,
}

impl EnrichmentService {
    pub fn new(source: Arc<dyn HistoricalAwardSource>, config: EnrichmentConfig) -> Self {
        Self { source, config }
    }

    pub fn matched_query(&self, listing: &OpportunityDraft, today: NaiveDate) -> AwardQuery {
        AwardQuery {
            naics_codes: listing.naics_codes.clone(),
            psc_codes: listing.psc_codes.clone(),
            agencies: listing.agency.iter().map(|a| award_agency_name(a)).collect(),
            start_date: window_start(today, self.config.lookback_years),
            end_date: today,
            limit: self.config.award_limit,
        }
    }

    pub async fn enrich(
        &self,
        listing: &OpportunityDraft,
        now: DateTime<Utc>,
    ) -> Result<EnrichmentData, FetchError> {
        let matched_query = self.matched_query(listing, now.date_naive());
        let awards = self.source.search_awards(&matched_query).await?;

        let agency_awards = if matched_query.agencies.is_empty() {
            Vec::new()
        } else {
            let agency_query = AwardQuery {
                naics_codes: Vec::new(),
                psc_codes: Vec::new(),
                ..matched_query.clone()
            };
            self.source.search_awards(&agency_query).await?
        };

        debug!(
            notice_id = %listing.notice_id,
            matched = awards.len(),
            agency = agency_awards.len(),
            "historical awards collected"
        );
        Ok(EnrichmentData {
            matched: summarize_awards(&awards),
            awards,
            agency_awards,
            queried_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use govscout_adapters::FixtureAwardSource;
    use govscout_core::QueryStrategy;
    use serde_json::Value as JsonValue;

    fn award(amount: f64, recipient: &str) -> HistoricalAward {
        HistoricalAward {
            award_id: format!("A-{amount}"),
            recipient: recipient.into(),
            awarding_agency: Some("General Services Administration".into()),
            obligated_amount: amount,
            naics_code: Some("541512".into()),
            psc_code: None,
            set_aside_type: None,
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1),
            end_date: NaiveDate::from_ymd_opt(2024, 12, 31),
        }
    }

    #[test]
    fn obligation_statistics() {
        let stats = summarize_awards(&[
            award(100_000.0, "ACME"),
            award(150_000.0, "BEACON"),
            award(200_000.0, "ACME"),
        ]);
        assert_eq!(stats.count, 3);
        assert_eq!(stats.average_obligation, Some(150_000.0));
        assert_eq!(stats.min_obligation, Some(100_000.0));
        assert_eq!(stats.max_obligation, Some(200_000.0));
        assert_eq!(stats.unique_recipients, vec!["ACME", "BEACON"]);
        assert_eq!(stats.unique_agencies, vec!["General Services Administration"]);
        assert_eq!(stats.typical_duration_days, Some(365.0));
    }

    #[test]
    fn no_awards_means_empty_stats() {
        let stats = summarize_awards(&[]);
        assert_eq!(stats.count, 0);
        assert!(stats.average_obligation.is_none());
        assert!(stats.typical_duration_days.is_none());
    }

    #[test]
    fn department_suffix_is_reordered() {
        assert_eq!(
            award_agency_name("HEALTH AND HUMAN SERVICES, DEPARTMENT OF"),
            "DEPARTMENT OF HEALTH AND HUMAN SERVICES"
        );
        assert_eq!(
            award_agency_name("GENERAL SERVICES ADMINISTRATION"),
            "GENERAL SERVICES ADMINISTRATION"
        );
    }

    #[tokio::test]
    async fn fixture_enrichment_collects_matched_and_agency_awards() {
        let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
        let service = EnrichmentService::new(
            Arc::new(FixtureAwardSource::from_dir(root).unwrap()),
            EnrichmentConfig::default(),
        );
        let listing = OpportunityDraft {
            notice_id: "N-1".into(),
            source_url: None,
            title: "Cloud hosting".into(),
            agency: Some("GENERAL SERVICES ADMINISTRATION".into()),
            solicitation_number: None,
            notice_type: None,
            naics_codes: vec!["541512".into()],
            psc_codes: vec!["DA01".into()],
            set_aside_codes: vec!["SBA".into()],
            description: None,
            description_url: None,
            posted_at: None,
            response_deadline: None,
            estimated_value: Some(500_000.0),
            discovered_by: QueryStrategy::NaicsTargeted,
            raw_payload: JsonValue::Null,
        };
        let now = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).single().unwrap();
        let data = service.enrich(&listing, now).await.unwrap();

        assert_eq!(data.matched.count, 4);
        assert_eq!(data.matched.average_obligation, Some(162_500.0));
        assert_eq!(data.awards[0].obligated_amount, 200_000.0);
        assert_eq!(data.agency_awards.len(), 5);
        assert_eq!(data.queried_at, now);
    }
}
