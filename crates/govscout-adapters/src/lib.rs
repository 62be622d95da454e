//! Upstream adapters: listing search, historical awards, analysis service,
//! plus the fixture-backed sources used for offline runs.

mod analysis;
mod awards;
mod batch;
mod fixtures;
mod html;
mod listing;
mod normalize;
mod paginate;
mod strategy;

pub use analysis::{AnalysisAdapter, AnalysisService, HttpAnalysisService};
pub use awards::{AwardQuery, HistoricalAwardSource, UsaSpendingClient, AWARD_TYPE_CODES};
pub use batch::{process_in_groups, BatchConfig};
pub use fixtures::{FixtureAnalysisService, FixtureAwardSource, FixtureListingSource};
pub use html::{description_text, html_to_text};
pub use listing::{ListingPage, ListingSource, SamListingClient};
pub use normalize::{identity_key, normalize_record, parse_listing_date, NormalizeError};
pub use paginate::{Paginator, DEFAULT_PAGE_CAP};
pub use strategy::{build_all_queries, build_queries, DateWindow, ListingQuery, QueryProfile};
