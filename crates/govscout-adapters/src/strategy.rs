use chrono::{Duration, NaiveDate};
use govscout_core::QueryStrategy;
use serde::{Deserialize, Serialize};

/// Targeting dimensions each discovery strategy expands into queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryProfile {
    #[serde(default)]
    pub naics_codes: Vec<String>,
    #[serde(default)]
    pub set_aside_codes: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub agencies: Vec<String>,
    /// Listing `ptype` codes requested on every query.
    #[serde(default)]
    pub notice_types: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub posted_from: NaiveDate,
    pub posted_to: NaiveDate,
}

impl DateWindow {
    pub fn lookback(today: NaiveDate, days: u32) -> Self {
        Self {
            posted_from: today - Duration::days(i64::from(days)),
            posted_to: today,
        }
    }
}

/// One parameter set for the listing search endpoint, minus paging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingQuery {
    pub strategy: QueryStrategy,
    /// The profile value this query targets (a code, keyword or agency).
    pub target: String,
    pub params: Vec<(String, String)>,
}

impl ListingQuery {
    pub fn paged_params(&self, limit: usize, offset: usize) -> Vec<(String, String)> {
        let mut params = self.params.clone();
        params.push(("limit".into(), limit.to_string()));
        params.push(("offset".into(), offset.to_string()));
        params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn wire_date(date: NaiveDate) -> String {
    date.format("%m/%d/%Y").to_string()
}

fn base_params(profile: &QueryProfile, window: DateWindow) -> Vec<(String, String)> {
    let mut params = Vec::with_capacity(4);
    if !profile.notice_types.is_empty() {
        params.push(("ptype".into(), profile.notice_types.join(",")));
    }
    params.push(("postedFrom".into(), wire_date(window.posted_from)));
    params.push(("postedTo".into(), wire_date(window.posted_to)));
    params
}

pub fn build_queries(
    strategy: QueryStrategy,
    profile: &QueryProfile,
    window: DateWindow,
) -> Vec<ListingQuery> {
    let (key, values) = match strategy {
        QueryStrategy::NaicsTargeted => ("ncode", &profile.naics_codes),
        QueryStrategy::SetAsideTargeted => ("typeOfSetAside", &profile.set_aside_codes),
        QueryStrategy::KeywordSearch => ("title", &profile.keywords),
        QueryStrategy::AgencyTargeted => ("organizationName", &profile.agencies),
    };

    values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(|value| {
            let mut params = base_params(profile, window);
            params.push((key.to_string(), value.to_string()));
            ListingQuery {
                strategy,
                target: value.to_string(),
                params,
            }
        })
        .collect()
}

/// Queries for every strategy, in strategy enumeration order.
pub fn build_all_queries(profile: &QueryProfile, window: DateWindow) -> Vec<ListingQuery> {
    QueryStrategy::ALL
        .iter()
        .flat_map(|strategy| build_queries(*strategy, profile, window))
        .collect()
}
