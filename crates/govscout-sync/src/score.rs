//! Deterministic relevance scoring against the targeting profile.

use govscout_core::{OpportunityDraft, RelevanceScore};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

const KEYWORD_WEIGHT: f64 = 40.0;
const NAICS_EXACT: f64 = 30.0;
const NAICS_PREFIX: f64 = 15.0;
const SET_ASIDE_WEIGHT: f64 = 15.0;
const AGENCY_WEIGHT: f64 = 15.0;
/// Distinct keyword hits that earn the full keyword weight.
const KEYWORD_SATURATION: usize = 4;
const AGENCY_SIMILARITY: f64 = 0.92;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringProfile {
    pub keywords: Vec<String>,
    pub naics_codes: Vec<String>,
    pub set_aside_codes: Vec<String>,
    pub agencies: Vec<String>,
}

fn normalize_fragment(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn keyword_points(draft: &OpportunityDraft, keywords: &[String]) -> f64 {
    let wanted: Vec<String> = keywords
        .iter()
        .map(|k| normalize_fragment(k))
        .filter(|k| !k.is_empty())
        .collect();
    if wanted.is_empty() {
        return 0.0;
    }
    let haystack = format!(
        " {} {} ",
        normalize_fragment(&draft.title),
        normalize_fragment(draft.description.as_deref().unwrap_or_default())
    );
    let hits = wanted
        .iter()
        .filter(|keyword| haystack.contains(&format!(" {keyword} ")))
        .count();
    let saturation = wanted.len().min(KEYWORD_SATURATION) as f64;
    KEYWORD_WEIGHT * (hits as f64 / saturation).min(1.0)
}

fn naics_points(draft: &OpportunityDraft, targets: &[String]) -> f64 {
    let exact = draft
        .naics_codes
        .iter()
        .any(|code| targets.iter().any(|target| target == code));
    if exact {
        return NAICS_EXACT;
    }
    let prefix = |code: &str| code.get(..4).map(ToString::to_string);
    let target_prefixes: Vec<String> = targets.iter().filter_map(|t| prefix(t)).collect();
    let prefix_hit = draft
        .naics_codes
        .iter()
        .filter_map(|code| prefix(code))
        .any(|p| target_prefixes.contains(&p));
    if prefix_hit {
        NAICS_PREFIX
    } else {
        0.0
    }
}

fn set_aside_points(draft: &OpportunityDraft, targets: &[String]) -> f64 {
    let hit = draft
        .set_aside_codes
        .iter()
        .any(|code| targets.iter().any(|t| t.eq_ignore_ascii_case(code)));
    if hit {
        SET_ASIDE_WEIGHT
    } else {
        0.0
    }
}

/// Case-insensitive containment either way, or near-identical names.
pub fn agency_matches(agency: &str, target: &str) -> bool {
    let agency = normalize_fragment(agency);
    let target = normalize_fragment(target);
    if agency.is_empty() || target.is_empty() {
        return false;
    }
    agency.contains(&target)
        || target.contains(&agency)
        || jaro_winkler(&agency, &target) >= AGENCY_SIMILARITY
}

fn agency_points(draft: &OpportunityDraft, targets: &[String]) -> f64 {
    let hit = draft
        .agency
        .as_deref()
        .is_some_and(|agency| targets.iter().any(|t| agency_matches(agency, t)));
    if hit {
        AGENCY_WEIGHT
    } else {
        0.0
    }
}

pub fn score(draft: &OpportunityDraft, profile: &ScoringProfile) -> RelevanceScore {
    let total = keyword_points(draft, &profile.keywords)
        + naics_points(draft, &profile.naics_codes)
        + set_aside_points(draft, &profile.set_aside_codes)
        + agency_points(draft, &profile.agencies);
    RelevanceScore::new(total.round().clamp(0.0, 100.0) as u8)
}

/// Items whose score meets `threshold`, input order kept.
pub fn select_above_threshold<T>(
    items: impl IntoIterator<Item = T>,
    threshold: u8,
    score_of: impl Fn(&T) -> RelevanceScore,
) -> Vec<T> {
    items
        .into_iter()
        .filter(|item| score_of(item).meets(threshold))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use govscout_core::{QueryStrategy, Tier, DEFAULT_SCORE_THRESHOLD};
    use serde_json::Value as JsonValue;

    fn profile() -> ScoringProfile {
        ScoringProfile {
            keywords: vec!["cloud".into(), "cybersecurity".into(), "help desk".into()],
            naics_codes: vec!["541512".into()],
            set_aside_codes: vec!["SBA".into()],
            agencies: vec!["GENERAL SERVICES ADMINISTRATION".into()],
        }
    }

    fn draft() -> OpportunityDraft {
        OpportunityDraft {
            notice_id: "N-1".into(),
            source_url: None,
            title: "Cloud hosting and help desk support".into(),
            agency: Some("General Services Administration".into()),
            solicitation_number: None,
            notice_type: None,
            naics_codes: vec!["541512".into()],
            psc_codes: vec![],
            set_aside_codes: vec!["SBA".into()],
            description: Some("Includes cybersecurity monitoring.".into()),
            description_url: None,
            posted_at: None,
            response_deadline: None,
            estimated_value: None,
            discovered_by: QueryStrategy::NaicsTargeted,
            raw_payload: JsonValue::Null,
        }
    }

    #[test]
    fn full_match_scores_one_hundred() {
        let result = score(&draft(), &profile());
        assert_eq!(result.score, 100);
        assert_eq!(result.tier, Tier::High);
    }

    #[test]
    fn naics_prefix_earns_half_credit() {
        let mut d = draft();
        d.naics_codes = vec!["541519".into()];
        d.set_aside_codes.clear();
        d.agency = None;
        d.title = "Unrelated".into();
        d.description = None;
        let result = score(&d, &profile());
        assert_eq!(result.score, 15);
        assert_eq!(result.tier, Tier::Low);
    }

    #[test]
    fn keyword_density_scales_with_hits() {
        let mut d = draft();
        d.description = None;
        d.title = "Cloud migration".into();
        d.naics_codes.clear();
        d.set_aside_codes.clear();
        d.agency = None;
        // one of three keywords
        assert_eq!(score(&d, &profile()).score, 13);
    }

    #[test]
    fn agency_names_match_fuzzily() {
        assert!(agency_matches(
            "GENERAL SERVICES ADMINISTRATION.FEDERAL ACQUISITION SERVICE",
            "General Services Administration"
        ));
        assert!(agency_matches(
            "Department of Veterans Affairs",
            "Department of Veteran Affairs"
        ));
        assert!(!agency_matches("Department of the Army", "General Services Administration"));
    }

    #[test]
    fn scoring_is_pure() {
        let d = draft();
        assert_eq!(score(&d, &profile()), score(&d, &profile()));
    }

    #[test]
    fn threshold_keeps_only_scores_at_or_above() {
        let scores: Vec<RelevanceScore> =
            [30, 55, 71, 49, 90].into_iter().map(RelevanceScore::new).collect();
        let kept = select_above_threshold(scores, DEFAULT_SCORE_THRESHOLD, |s| *s);
        let kept: Vec<u8> = kept.iter().map(|s| s.score).collect();
        assert_eq!(kept, vec![55, 71, 90]);
    }
}
