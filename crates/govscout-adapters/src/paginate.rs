use futures::stream::{self, Stream, TryStreamExt};
use govscout_storage::FetchError;
use serde_json::Value as JsonValue;
use tracing::info;

use crate::listing::ListingSource;
use crate::strategy::ListingQuery;

/// Safety cap on records pulled for a single query.
pub const DEFAULT_PAGE_CAP: usize = 10_000;

/// Walks one query through offset pages until a short page or the cap. A
/// failed page leaves the offset where it was so the caller can ask again.
pub struct Paginator<'a, S: ListingSource + ?Sized> {
    source: &'a S,
    query: &'a ListingQuery,
    page_size: usize,
    cap: usize,
    offset: usize,
    done: bool,
}

impl<'a, S: ListingSource + ?Sized> Paginator<'a, S> {
    pub fn new(source: &'a S, query: &'a ListingQuery, page_size: usize) -> Self {
        Self {
            source,
            query,
            page_size: page_size.max(1),
            cap: DEFAULT_PAGE_CAP,
            offset: 0,
            done: false,
        }
    }

    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = cap;
        self
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<JsonValue>>, FetchError> {
        if self.done {
            return Ok(None);
        }
        let limit = self.page_size.min(self.cap.saturating_sub(self.offset));
        if limit == 0 {
            self.done = true;
            return Ok(None);
        }

        let mut records = self
            .source
            .fetch_page(self.query, limit, self.offset)
            .await?
            .records;
        records.truncate(limit);

        let received = records.len();
        self.offset += received;
        if received < self.page_size || self.offset >= self.cap {
            self.done = true;
            if self.offset >= self.cap {
                info!(
                    strategy = %self.query.strategy,
                    target = %self.query.target,
                    cap = self.cap,
                    "page cap reached"
                );
            }
        }

        if received == 0 {
            Ok(None)
        } else {
            Ok(Some(records))
        }
    }

    /// Lazy stream of individual records; stops at the first error.
    pub fn into_record_stream(self) -> impl Stream<Item = Result<JsonValue, FetchError>> + 'a {
        stream::try_unfold(self, |mut paginator| async move {
            let page = paginator.next_page().await?;
            Ok::<_, FetchError>(page.map(|page| (page, paginator)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
        .try_flatten()
    }
}
