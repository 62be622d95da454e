//! Secondary bid/no-bid signals derived from enrichment output. Every function
//! here is pure; missing inputs give `None` and raise no flag.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use govscout_core::{
    AgencyBehaviorProfile, EnforcementStrength, EnrichmentData, HistoricalAward, IntelFlag,
    IntelligenceSignals, OpportunityDraft, SetAsideEnforcement,
};

use crate::enrich::award_agency_name;
use crate::score::agency_matches;

const INCUMBENT_LOCK_IN: f64 = 0.5;
const VALUE_INFLATED: f64 = 2.0;
const RECOMPETE_LIKELY: f64 = 0.6;
const RECOMPETE_HORIZON_YEARS: f64 = 5.0;
const NEW_VENDOR_RARE: f64 = 0.2;

fn set_aside_recorded(award: &HistoricalAward) -> Option<bool> {
    let value = award.set_aside_type.as_deref()?.trim();
    if value.is_empty() {
        return None;
    }
    Some(!matches!(
        value.to_ascii_uppercase().as_str(),
        "NONE" | "NO SET ASIDE USED." | "NO SET ASIDE USED"
    ))
}

/// Top recipient's share of the total matched obligation.
pub fn incumbent_concentration(awards: &[HistoricalAward]) -> Option<f64> {
    let total: f64 = awards.iter().map(|a| a.obligated_amount).sum();
    if awards.is_empty() || total <= 0.0 {
        return None;
    }
    let mut by_recipient: HashMap<&str, f64> = HashMap::new();
    for award in awards {
        *by_recipient.entry(award.recipient.as_str()).or_default() += award.obligated_amount;
    }
    let top = by_recipient.values().copied().fold(0.0, f64::max);
    Some((top / total).clamp(0.0, 1.0))
}

/// Listing estimate over the historical average obligation.
pub fn award_size_realism(
    estimated_value: Option<f64>,
    historical_average: Option<f64>,
) -> Option<f64> {
    match (estimated_value, historical_average) {
        (Some(estimate), Some(average)) if average > 0.0 => Some(estimate / average),
        _ => None,
    }
}

fn years_between(earlier: NaiveDate, later: NaiveDate) -> f64 {
    (later - earlier).num_days().max(0) as f64 / 365.25
}

/// Weighted mix of the top recipient's win share and how recently it last
/// won, over awards at the opportunity's agency. Needs at least two awards.
/// Both agency names are put in award form before matching.
pub fn recompete_likelihood(
    awards: &[HistoricalAward],
    agency: Option<&str>,
    today: NaiveDate,
) -> Option<f64> {
    let agency = award_agency_name(agency?);
    let at_agency: Vec<&HistoricalAward> = awards
        .iter()
        .filter(|award| {
            award
                .awarding_agency
                .as_deref()
                .is_some_and(|awarding| agency_matches(&award_agency_name(awarding), &agency))
        })
        .collect();
    if at_agency.len() < 2 {
        return None;
    }

    let mut wins: HashMap<&str, (usize, Option<NaiveDate>)> = HashMap::new();
    for award in &at_agency {
        let entry = wins.entry(award.recipient.as_str()).or_insert((0, None));
        entry.0 += 1;
        if let Some(start) = award.start_date {
            entry.1 = Some(entry.1.map_or(start, |seen| seen.max(start)));
        }
    }
    // Ties on win count go to the most recent winner.
    let (top_wins, last_win) = wins
        .into_values()
        .max_by_key(|(count, last)| (*count, *last))?;

    let share = top_wins as f64 / at_agency.len() as f64;
    let recency = last_win
        .map(|date| (1.0 - years_between(date, today) / RECOMPETE_HORIZON_YEARS).max(0.0))
        .unwrap_or(0.0);
    Some((0.6 * share + 0.4 * recency).clamp(0.0, 1.0))
}

pub fn agency_behavior(agency_awards: &[HistoricalAward]) -> Option<AgencyBehaviorProfile> {
    if agency_awards.is_empty() {
        return None;
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for award in agency_awards {
        *counts.entry(award.recipient.as_str()).or_default() += 1;
    }
    let single_award_recipients = counts.values().filter(|count| **count == 1).count();
    let total = agency_awards.len() as f64;
    Some(AgencyBehaviorProfile {
        new_vendor_acceptance_rate: single_award_recipients as f64 / total,
        typical_award_size_avg: agency_awards.iter().map(|a| a.obligated_amount).sum::<f64>()
            / total,
    })
}

/// Only meaningful for set-aside opportunities.
pub fn set_aside_enforcement(
    opportunity_set_asides: &[String],
    awards: &[HistoricalAward],
) -> Option<SetAsideEnforcement> {
    let set_aside = opportunity_set_asides
        .iter()
        .any(|code| !code.trim().is_empty() && !code.eq_ignore_ascii_case("NONE"));
    if !set_aside {
        return None;
    }
    let recorded: Vec<bool> = awards.iter().filter_map(set_aside_recorded).collect();
    if recorded.is_empty() {
        return None;
    }
    let compliance_rate =
        recorded.iter().filter(|carried| **carried).count() as f64 / recorded.len() as f64;
    let enforcement_strength = if compliance_rate >= 0.8 {
        EnforcementStrength::Strict
    } else if compliance_rate >= 0.5 {
        EnforcementStrength::Moderate
    } else {
        EnforcementStrength::Weak
    };
    Some(SetAsideEnforcement {
        enforcement_strength,
        compliance_rate,
    })
}

pub fn derive_signals(
    listing: &OpportunityDraft,
    enrichment: &EnrichmentData,
    now: DateTime<Utc>,
) -> IntelligenceSignals {
    let incumbent_concentration_score = incumbent_concentration(&enrichment.awards);
    let award_size_realism_ratio =
        award_size_realism(listing.estimated_value, enrichment.matched.average_obligation);
    let recompete =
        recompete_likelihood(&enrichment.awards, listing.agency.as_deref(), now.date_naive());
    let agency_behavior_profile = agency_behavior(&enrichment.agency_awards);
    let enforcement = set_aside_enforcement(&listing.set_aside_codes, &enrichment.awards);

    let mut flags = Vec::new();
    if incumbent_concentration_score.is_some_and(|score| score > INCUMBENT_LOCK_IN) {
        flags.push(IntelFlag::HighIncumbentLockIn);
    }
    if award_size_realism_ratio.is_some_and(|ratio| ratio > VALUE_INFLATED) {
        flags.push(IntelFlag::SamValueInflated);
    }
    if recompete.is_some_and(|likelihood| likelihood > RECOMPETE_LIKELY) {
        flags.push(IntelFlag::LikelyRecompete);
    }
    if agency_behavior_profile
        .as_ref()
        .is_some_and(|profile| profile.new_vendor_acceptance_rate < NEW_VENDOR_RARE)
    {
        flags.push(IntelFlag::AgencyRarelyAwardsToNewVendors);
    }
    if enforcement
        .as_ref()
        .is_some_and(|e| e.enforcement_strength == EnforcementStrength::Weak)
    {
        flags.push(IntelFlag::SetAsideEnforcementWeak);
    }

    IntelligenceSignals {
        incumbent_concentration_score,
        award_size_realism_ratio,
        recompete_likelihood: recompete,
        agency_behavior_profile,
        set_aside_enforcement: enforcement,
        flags,
        calculated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use govscout_core::{AwardStats, QueryStrategy};
    use serde_json::Value as JsonValue;

    use crate::enrich::summarize_awards;

    fn award(
        recipient: &str,
        amount: f64,
        start: (i32, u32, u32),
        set_aside: Option<&str>,
    ) -> HistoricalAward {
        award_at("General Services Administration", recipient, amount, start, set_aside)
    }

    fn award_at(
        agency: &str,
        recipient: &str,
        amount: f64,
        start: (i32, u32, u32),
        set_aside: Option<&str>,
    ) -> HistoricalAward {
        HistoricalAward {
            award_id: format!("{recipient}-{amount}"),
            recipient: recipient.into(),
            awarding_agency: Some(agency.into()),
            obligated_amount: amount,
            naics_code: Some("541512".into()),
            psc_code: Some("DA01".into()),
            set_aside_type: set_aside.map(ToString::to_string),
            start_date: NaiveDate::from_ymd_opt(start.0, start.1, start.2),
            end_date: None,
        }
    }

    fn listing(estimated_value: Option<f64>) -> OpportunityDraft {
        listing_at("GENERAL SERVICES ADMINISTRATION", estimated_value)
    }

    fn listing_at(agency: &str, estimated_value: Option<f64>) -> OpportunityDraft {
        OpportunityDraft {
            notice_id: "N-1".into(),
            source_url: None,
            title: "Cloud hosting".into(),
            agency: Some(agency.into()),
            solicitation_number: None,
            notice_type: None,
            naics_codes: vec!["541512".into()],
            psc_codes: vec![],
            set_aside_codes: vec!["SBA".into()],
            description: None,
            description_url: None,
            posted_at: None,
            response_deadline: None,
            estimated_value,
            discovered_by: QueryStrategy::NaicsTargeted,
            raw_payload: JsonValue::Null,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).single().unwrap()
    }

    #[test]
    fn inflated_estimate_is_flagged() {
        let ratio = award_size_realism(Some(500_000.0), Some(150_000.0)).unwrap();
        assert!((ratio - 3.333).abs() < 0.01);

        let enrichment = EnrichmentData {
            matched: AwardStats {
                count: 1,
                average_obligation: Some(150_000.0),
                ..AwardStats::default()
            },
            awards: vec![],
            agency_awards: vec![],
            queried_at: now(),
        };
        let signals = derive_signals(&listing(Some(500_000.0)), &enrichment, now());
        assert!(signals.has_flag(IntelFlag::SamValueInflated));
        assert_eq!(signals.flags, vec![IntelFlag::SamValueInflated]);
    }

    #[test]
    fn dominant_recent_incumbent_raises_lock_in_and_recompete() {
        let awards = vec![
            award("ACME", 120_000.0, (2022, 1, 1), Some("SBA")),
            award("ACME", 180_000.0, (2023, 2, 1), Some("SBA")),
            award("BEACON", 150_000.0, (2024, 3, 1), Some("SBA")),
            award("ACME", 200_000.0, (2025, 4, 1), Some("NONE")),
        ];
        let concentration = incumbent_concentration(&awards).unwrap();
        assert!((concentration - 500.0 / 650.0).abs() < 1e-9);

        let likelihood = recompete_likelihood(
            &awards,
            Some("GENERAL SERVICES ADMINISTRATION"),
            now().date_naive(),
        )
        .unwrap();
        assert!(likelihood > 0.6, "likelihood {likelihood}");

        let enforcement = set_aside_enforcement(&["SBA".to_string()], &awards).unwrap();
        assert_eq!(enforcement.enforcement_strength, EnforcementStrength::Moderate);
        assert!((enforcement.compliance_rate - 0.75).abs() < 1e-9);

        let enrichment = EnrichmentData {
            matched: summarize_awards(&awards),
            awards: awards.clone(),
            agency_awards: awards,
            queried_at: now(),
        };
        let signals = derive_signals(&listing(Some(500_000.0)), &enrichment, now());
        assert!(signals.has_flag(IntelFlag::HighIncumbentLockIn));
        assert!(signals.has_flag(IntelFlag::LikelyRecompete));
        assert!(signals.has_flag(IntelFlag::SamValueInflated));
        assert!(!signals.has_flag(IntelFlag::SetAsideEnforcementWeak));
        // one single-award recipient out of four awards
        let behavior = signals.agency_behavior_profile.unwrap();
        assert!((behavior.new_vendor_acceptance_rate - 0.25).abs() < 1e-9);
    }

    #[test]
    fn department_of_suffix_matches_award_agency_names() {
        let awards = vec![
            award_at("Department of Health and Human Services", "ACME", 90_000.0, (2024, 2, 1), None),
            award_at("Department of Health and Human Services", "ACME", 95_000.0, (2025, 3, 1), None),
            award_at("Department of Health and Human Services", "ACME", 99_000.0, (2026, 4, 1), None),
        ];
        let today = now().date_naive();
        let listing_form =
            recompete_likelihood(&awards, Some("HEALTH AND HUMAN SERVICES, DEPARTMENT OF"), today)
                .unwrap();
        let award_form =
            recompete_likelihood(&awards, Some("DEPARTMENT OF HEALTH AND HUMAN SERVICES"), today)
                .unwrap();
        assert!((listing_form - award_form).abs() < 1e-9);
        assert!(listing_form > 0.9, "likelihood {listing_form}");

        let enrichment = EnrichmentData {
            matched: summarize_awards(&awards),
            awards: awards.clone(),
            agency_awards: awards,
            queried_at: now(),
        };
        let signals = derive_signals(
            &listing_at("HEALTH AND HUMAN SERVICES, DEPARTMENT OF", None),
            &enrichment,
            now(),
        );
        assert!(signals.has_flag(IntelFlag::LikelyRecompete));
        assert!(signals.has_flag(IntelFlag::HighIncumbentLockIn));
    }

    #[test]
    fn awards_at_other_agencies_do_not_count_toward_recompete() {
        let awards = vec![
            award_at("Department of Defense", "ACME", 100_000.0, (2025, 1, 1), None),
            award_at("Department of Defense", "ACME", 100_000.0, (2026, 1, 1), None),
            award_at("Department of Veterans Affairs", "ACME", 100_000.0, (2026, 2, 1), None),
        ];
        let today = now().date_naive();
        assert!(recompete_likelihood(&awards, Some("VETERANS AFFAIRS, DEPARTMENT OF"), today).is_none());
        assert!(recompete_likelihood(&awards, Some("DEFENSE, DEPARTMENT OF"), today).is_some());
        assert!(recompete_likelihood(&awards, None, today).is_none());
    }

    #[test]
    fn missing_inputs_give_no_signals() {
        let enrichment = EnrichmentData {
            matched: AwardStats::default(),
            awards: vec![],
            agency_awards: vec![],
            queried_at: now(),
        };
        let signals = derive_signals(&listing(None), &enrichment, now());
        assert!(signals.incumbent_concentration_score.is_none());
        assert!(signals.award_size_realism_ratio.is_none());
        assert!(signals.recompete_likelihood.is_none());
        assert!(signals.agency_behavior_profile.is_none());
        assert!(signals.set_aside_enforcement.is_none());
        assert!(signals.flags.is_empty());
        assert_eq!(signals.calculated_at, now());
    }

    #[test]
    fn weak_enforcement_and_closed_agencies_are_flagged() {
        let awards = vec![
            award("ACME", 100_000.0, (2024, 1, 1), Some("NONE")),
            award("ACME", 100_000.0, (2024, 6, 1), Some("NONE")),
            award("ACME", 100_000.0, (2025, 1, 1), Some("SBA")),
        ];
        let enforcement = set_aside_enforcement(&["SBA".to_string()], &awards).unwrap();
        assert_eq!(enforcement.enforcement_strength, EnforcementStrength::Weak);
        assert!(set_aside_enforcement(&[], &awards).is_none());

        let behavior = agency_behavior(&awards).unwrap();
        assert_eq!(behavior.new_vendor_acceptance_rate, 0.0);
        assert_eq!(behavior.typical_award_size_avg, 100_000.0);
    }
}
