//! Lazy pagination over one query's search results.
//!
//! A [`PageStream`] issues the first search request on the first call to
//! `next` and follows the `next` continuation URL on every later call. Nothing
//! is requested ahead of time, so a consumer that stops iterating (because its
//! result cap was reached) never triggers another request.

use tracing::{debug, warn};

use crate::domain::Query;
use crate::error::CollectorError;
use crate::mgrast::{MgRastClient, RawPage};

enum Cursor {
    Start,
    Next(String),
    Done,
}

pub struct PageStream<'a, C: MgRastClient + ?Sized> {
    client: &'a C,
    query: &'a Query,
    cursor: Cursor,
    pages: usize,
}

impl<'a, C: MgRastClient + ?Sized> PageStream<'a, C> {
    pub fn new(client: &'a C, query: &'a Query) -> Self {
        Self {
            client,
            query,
            cursor: Cursor::Start,
            pages: 0,
        }
    }

    /// Pages successfully fetched so far.
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.cursor, Cursor::Done)
    }
}

impl<C: MgRastClient + ?Sized> Iterator for PageStream<'_, C> {
    type Item = Result<RawPage, CollectorError>;

    fn next(&mut self) -> Option<Self::Item> {
        let result = match std::mem::replace(&mut self.cursor, Cursor::Done) {
            Cursor::Done => return None,
            Cursor::Start => self.client.search(self.query),
            Cursor::Next(url) => self.client.follow(&url),
        };

        match result {
            Ok(page) => {
                self.pages += 1;
                if let Some(next) = page.next_url() {
                    self.cursor = Cursor::Next(next.to_string());
                }
                debug!(
                    query = self.query.sequence(),
                    page = self.pages,
                    records = page.data.len(),
                    has_next = !self.is_exhausted(),
                    "fetched page"
                );
                Some(Ok(page))
            }
            Err(err) => {
                warn!(
                    query = self.query.sequence(),
                    error = %err,
                    "page fetch failed; ending pagination for this query"
                );
                Some(Err(err))
            }
        }
    }
}
