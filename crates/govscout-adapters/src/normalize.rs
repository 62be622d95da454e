//! Raw listing record -> canonical draft. Listing payloads disagree on field
//! shapes across notice types, so every accessor here is lenient.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use govscout_core::{OpportunityDraft, QueryStrategy};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::html::html_to_text;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record has neither a notice id nor a source url")]
    MissingIdentity,
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str().map(str::trim).filter(|s| !s.is_empty())
}

fn json_string(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_str(value, path).map(ToString::to_string)
}

/// Accepts a single string (optionally comma separated) or an array of
/// strings.
fn json_string_list(value: &JsonValue, key: &str) -> Vec<String> {
    let split = |s: &str| -> Vec<String> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(ToString::to_string)
            .collect()
    };
    match value.get(key) {
        Some(JsonValue::String(s)) => split(s),
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(JsonValue::as_str)
            .flat_map(split)
            .collect(),
        _ => Vec::new(),
    }
}

fn merge_unique(target: &mut Vec<String>, extra: Vec<String>) {
    for item in extra {
        if !target.contains(&item) {
            target.push(item);
        }
    }
}

fn parse_amount(value: &JsonValue) -> Option<f64> {
    let amount = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| !matches!(c, '$' | ',' | ' '))
                .collect();
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    };
    amount.filter(|amount| amount.is_finite() && *amount >= 0.0)
}

/// RFC3339, ISO date-time without offset (UTC), ISO date or `MM/dd/yyyy`.
pub fn parse_listing_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt.and_utc());
        }
    }
    for format in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }
    None
}

fn source_url(raw: &JsonValue) -> Option<String> {
    json_string(raw, &["uiLink"]).or_else(|| json_string(raw, &["url"]))
}

/// Dedup key: the notice id, or `url:<source url>` when the source omitted it.
pub fn identity_key(raw: &JsonValue) -> Option<String> {
    json_string(raw, &["noticeId"]).or_else(|| source_url(raw).map(|url| format!("url:{url}")))
}

fn agency(raw: &JsonValue) -> Option<String> {
    json_string(raw, &["department"])
        .or_else(|| {
            json_str(raw, &["fullParentPathName"])
                .and_then(|path| path.split('.').next())
                .map(|s| s.trim().to_string())
        })
        .or_else(|| json_string(raw, &["organizationName"]))
        .filter(|s| !s.is_empty())
}

pub fn normalize_record(
    raw: &JsonValue,
    discovered_by: QueryStrategy,
) -> Result<OpportunityDraft, NormalizeError> {
    if !raw.is_object() {
        return Err(NormalizeError::NotAnObject);
    }
    let notice_id = identity_key(raw).ok_or(NormalizeError::MissingIdentity)?;

    let mut naics_codes = json_string_list(raw, "naicsCode");
    merge_unique(&mut naics_codes, json_string_list(raw, "naicsCodes"));

    let (description, description_url) = match json_str(raw, &["description"]) {
        Some(text) if text.starts_with("http://") || text.starts_with("https://") => {
            (None, Some(text.to_string()))
        }
        Some(text) => (Some(html_to_text(text)).filter(|s| !s.is_empty()), None),
        None => (None, None),
    };

    let estimated_value = raw
        .get("award")
        .and_then(|award| award.get("amount"))
        .and_then(parse_amount)
        .or_else(|| raw.get("estimatedValue").and_then(parse_amount));

    Ok(OpportunityDraft {
        notice_id,
        source_url: source_url(raw),
        title: json_string(raw, &["title"]).unwrap_or_default(),
        agency: agency(raw),
        solicitation_number: json_string(raw, &["solicitationNumber"]),
        notice_type: json_string(raw, &["type"]).or_else(|| json_string(raw, &["baseType"])),
        naics_codes,
        psc_codes: json_string_list(raw, "classificationCode"),
        set_aside_codes: json_string_list(raw, "typeOfSetAside"),
        description,
        description_url,
        posted_at: json_str(raw, &["postedDate"]).and_then(parse_listing_date),
        response_deadline: json_str(raw, &["responseDeadLine"]).and_then(parse_listing_date),
        estimated_value,
        discovered_by,
        raw_payload: raw.clone(),
    })
}
