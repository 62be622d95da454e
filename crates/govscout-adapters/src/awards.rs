use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use govscout_core::HistoricalAward;
use govscout_storage::{FetchError, HttpFetcher, RetryPolicy};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

/// Definitive contracts and purchase orders.
pub const AWARD_TYPE_CODES: [&str; 4] = ["A", "B", "C", "D"];

const AWARD_FIELDS: [&str; 9] = [
    "Award ID",
    "Recipient Name",
    "Award Amount",
    "Awarding Agency",
    "Start Date",
    "End Date",
    "NAICS",
    "PSC",
    "Type of Set Aside",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwardQuery {
    pub naics_codes: Vec<String>,
    pub psc_codes: Vec<String>,
    pub agencies: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub limit: usize,
}

impl AwardQuery {
    pub fn request_body(&self) -> JsonValue {
        let mut filters = serde_json::Map::new();
        filters.insert("award_type_codes".into(), json!(AWARD_TYPE_CODES));
        filters.insert(
            "time_period".into(),
            json!([{
                "start_date": self.start_date.format("%Y-%m-%d").to_string(),
                "end_date": self.end_date.format("%Y-%m-%d").to_string(),
            }]),
        );
        if !self.naics_codes.is_empty() {
            filters.insert("naics_codes".into(), json!(self.naics_codes));
        }
        if !self.psc_codes.is_empty() {
            filters.insert("psc_codes".into(), json!(self.psc_codes));
        }
        if !self.agencies.is_empty() {
            let agencies: Vec<_> = self
                .agencies
                .iter()
                .map(|name| json!({"type": "awarding", "tier": "toptier", "name": name}))
                .collect();
            filters.insert("agencies".into(), JsonValue::Array(agencies));
        }

        json!({
            "filters": filters,
            "fields": AWARD_FIELDS,
            "page": 1,
            "limit": self.limit,
            "sort": "Award Amount",
            "order": "desc",
        })
    }

    /// Whether a stored award would have been returned by this query.
    pub fn matches(&self, award: &HistoricalAward) -> bool {
        let in_list = |list: &[String], value: Option<&str>| {
            list.is_empty() || value.is_some_and(|v| list.iter().any(|item| item == v))
        };
        let agency_ok = self.agencies.is_empty()
            || award.awarding_agency.as_deref().is_some_and(|agency| {
                self.agencies
                    .iter()
                    .any(|wanted| wanted.eq_ignore_ascii_case(agency))
            });
        let date_ok = award
            .start_date
            .map_or(true, |start| start >= self.start_date && start <= self.end_date);

        in_list(&self.naics_codes, award.naics_code.as_deref())
            && in_list(&self.psc_codes, award.psc_code.as_deref())
            && agency_ok
            && date_ok
    }
}

#[async_trait]
pub trait HistoricalAwardSource: Send + Sync {
    /// Awards matching `query`, largest obligation first, at most
    /// `query.limit`.
    async fn search_awards(&self, query: &AwardQuery) -> Result<Vec<HistoricalAward>, FetchError>;
}

#[derive(Debug, Deserialize)]
struct AwardSearchResponse {
    #[serde(default)]
    results: Vec<JsonValue>,
}

fn field_str<'a>(row: &'a JsonValue, key: &str) -> Option<&'a str> {
    match row.get(key)? {
        JsonValue::String(s) => Some(s.trim()).filter(|s| !s.is_empty()),
        // Newer responses nest codes as {"code": .., "description": ..}.
        JsonValue::Object(map) => map
            .get("code")
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty()),
        _ => None,
    }
}

fn field_date(row: &JsonValue, key: &str) -> Option<NaiveDate> {
    field_str(row, key).and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
}

fn parse_award(row: &JsonValue) -> Option<HistoricalAward> {
    let award_id = field_str(row, "Award ID")?.to_string();
    let obligated_amount = row.get("Award Amount").and_then(JsonValue::as_f64)?;
    Some(HistoricalAward {
        award_id,
        recipient: field_str(row, "Recipient Name").unwrap_or("UNKNOWN").to_string(),
        awarding_agency: field_str(row, "Awarding Agency").map(ToString::to_string),
        obligated_amount,
        naics_code: field_str(row, "NAICS").map(ToString::to_string),
        psc_code: field_str(row, "PSC").map(ToString::to_string),
        set_aside_type: field_str(row, "Type of Set Aside").map(ToString::to_string),
        start_date: field_date(row, "Start Date"),
        end_date: field_date(row, "End Date"),
    })
}

pub struct UsaSpendingClient {
    http: Arc<HttpFetcher>,
    endpoint: String,
    retry: RetryPolicy,
}

impl UsaSpendingClient {
    pub fn new(http: Arc<HttpFetcher>, base_url: &str, retry: RetryPolicy) -> Self {
        Self {
            http,
            endpoint: format!(
                "{}/api/v2/search/spending_by_award/",
                base_url.trim_end_matches('/')
            ),
            retry,
        }
    }
}

#[async_trait]
impl HistoricalAwardSource for UsaSpendingClient {
    async fn search_awards(&self, query: &AwardQuery) -> Result<Vec<HistoricalAward>, FetchError> {
        let body = query.request_body();
        let (http, endpoint, body) = (self.http.as_ref(), self.endpoint.as_str(), &body);
        let response: AwardSearchResponse = self
            .retry
            .run_fetch("awards", move || http.post_json("awards", endpoint, body, None))
            .await?;

        let total = response.results.len();
        let mut awards: Vec<HistoricalAward> =
            response.results.iter().filter_map(parse_award).collect();
        if awards.len() < total {
            warn!(
                skipped = total - awards.len(),
                "award rows without id or amount were skipped"
            );
        }
        awards.sort_by(|a, b| b.obligated_amount.total_cmp(&a.obligated_amount));
        awards.truncate(query.limit);
        debug!(count = awards.len(), "historical awards fetched");
        Ok(awards)
    }
}
