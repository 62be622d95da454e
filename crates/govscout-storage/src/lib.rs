//! Persistence, upstream HTTP access and retry utilities for govscout.

mod archive;
mod http;
mod memory;
mod postgres;
mod repo;
mod retry;

pub use archive::{ArchivedPage, PageArchive};
pub use http::{
    FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RequestBudget,
    RequestBudgetConfig,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use repo::{
    OpportunityStore, RunEvent, RunStatusStore, RunStoreError, StatusUpdateError, UpsertOutcome,
    RUN_EVENT_RETENTION,
};
pub use retry::RetryPolicy;
