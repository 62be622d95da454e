//! Hard eligibility filter. Pure; reasons are stable strings kept for audit.

use chrono::{DateTime, Utc};
use govscout_core::OpportunityDraft;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRules {
    /// Set-aside codes the business may bid on. Empty means any.
    pub eligible_set_asides: Vec<String>,
    /// Listing notice type codes or case-insensitive name fragments.
    pub disallowed_notice_types: Vec<String>,
}

impl Default for FilterRules {
    fn default() -> Self {
        Self {
            eligible_set_asides: Vec::new(),
            disallowed_notice_types: [
                "award notice",
                "justification",
                "sale of surplus",
                "intent to bundle",
            ]
            .into_iter()
            .map(ToString::to_string)
            .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterDecision {
    pub passed: bool,
    pub reason: Option<String>,
}

impl FilterDecision {
    fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
        }
    }

    fn exclude(reason: String) -> Self {
        Self {
            passed: false,
            reason: Some(reason),
        }
    }
}

fn is_unrestricted(codes: &[String]) -> bool {
    codes
        .iter()
        .all(|code| code.trim().is_empty() || code.eq_ignore_ascii_case("NONE"))
}

fn notice_type_disallowed<'a>(notice_type: &str, rules: &'a FilterRules) -> Option<&'a str> {
    let lowered = notice_type.trim().to_lowercase();
    rules
        .disallowed_notice_types
        .iter()
        .map(String::as_str)
        .find(|entry| {
            let entry = entry.trim().to_lowercase();
            !entry.is_empty() && (lowered == entry || lowered.contains(&entry))
        })
}

pub fn hard_filter(
    draft: &OpportunityDraft,
    now: DateTime<Utc>,
    rules: &FilterRules,
) -> FilterDecision {
    if !rules.eligible_set_asides.is_empty() && !is_unrestricted(&draft.set_aside_codes) {
        let eligible = draft.set_aside_codes.iter().any(|code| {
            rules
                .eligible_set_asides
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(code.trim()))
        });
        if !eligible {
            return FilterDecision::exclude(format!(
                "set_aside_ineligible:{}",
                draft.set_aside_codes.join(",")
            ));
        }
    }

    if let Some(notice_type) = draft.notice_type.as_deref() {
        if let Some(entry) = notice_type_disallowed(notice_type, rules) {
            return FilterDecision::exclude(format!("notice_type_disallowed:{entry}"));
        }
    }

    if let Some(deadline) = draft.response_deadline {
        if deadline < now {
            return FilterDecision::exclude(format!(
                "deadline_passed:{}",
                deadline.format("%Y-%m-%d")
            ));
        }
    }

    FilterDecision::pass()
}
