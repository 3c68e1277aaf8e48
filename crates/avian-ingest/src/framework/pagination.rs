//! Cursor-driven pagination as a lazy record stream
//!
//! A [`PageSource`] knows how to fetch one page given an opaque cursor.
//! [`PaginatedFetcher`] turns it into a stream of items:
//!
//! - the first page is requested without a cursor
//! - `rate_limit` is slept between pages (never before the first or after
//!   the last), so N pages cost N-1 sleeps
//! - the stream ends when a page reports no next page, when an empty page
//!   arrives with no cursor in hand, or when the server fails to advance the
//!   cursor
//! - a failure is yielded once as an `Err` item and ends the stream; items
//!   already yielded stay delivered
//! - the cancel token is checked before every request, the first included
//!
//! There is no mid-stream resume. A fetch restarts from the first page.

use crate::error::{IngestError, TransportError};
use crate::framework::clock::Clock;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One page of a listing
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
    pub has_next: bool,
}

impl<T> Page<T> {
    /// A page with more to follow at `cursor`
    pub fn with_next(items: Vec<T>, cursor: impl Into<String>) -> Self {
        Self {
            items,
            next_cursor: Some(cursor.into()),
            has_next: true,
        }
    }

    /// The final page
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
            has_next: false,
        }
    }
}

/// A listing endpoint addressed by opaque cursor tokens
#[async_trait]
pub trait PageSource: Send + Sync + 'static {
    type Item: Send + 'static;

    async fn fetch_page(&self, cursor: Option<String>) -> Result<Page<Self::Item>, TransportError>;
}

/// Drives a [`PageSource`] to exhaustion
pub struct PaginatedFetcher<P: PageSource> {
    label: String,
    source: Arc<P>,
    clock: Arc<dyn Clock>,
    rate_limit: Duration,
    cancel: CancellationToken,
}

struct Cursor {
    token: Option<String>,
    pages: usize,
    items: usize,
}

impl<P: PageSource> PaginatedFetcher<P> {
    pub fn new(label: impl Into<String>, source: P, clock: Arc<dyn Clock>) -> Self {
        Self {
            label: label.into(),
            source: Arc::new(source),
            clock,
            rate_limit: Duration::ZERO,
            cancel: CancellationToken::new(),
        }
    }

    /// Delay between consecutive page requests
    pub fn rate_limit(mut self, delay: Duration) -> Self {
        self.rate_limit = delay;
        self
    }

    /// Stop before the next request once `token` is cancelled
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<P::Item, IngestError>> {
        let Self {
            label,
            source,
            clock,
            rate_limit,
            cancel,
        } = self;
        let label: Arc<str> = Arc::from(label);

        let start = Cursor {
            token: None,
            pages: 0,
            items: 0,
        };

        stream::unfold(Some(start), move |state| {
            let source = Arc::clone(&source);
            let clock = Arc::clone(&clock);
            let cancel = cancel.clone();
            let label = Arc::clone(&label);
            async move {
                let mut state = state?;

                if cancel.is_cancelled() {
                    info!(listing = %label, pages = state.pages, "Pagination cancelled");
                    return Some((vec![Err(IngestError::Cancelled)], None));
                }
                if state.pages > 0 {
                    clock.sleep(rate_limit).await;
                }

                let page = match source.fetch_page(state.token.clone()).await {
                    Ok(page) => page,
                    Err(err) => {
                        warn!(listing = %label, pages = state.pages, items = state.items, error = %err, "Page fetch failed");
                        return Some((vec![Err(IngestError::from(err))], None));
                    },
                };

                state.pages += 1;
                state.items += page.items.len();
                debug!(listing = %label, page = state.pages, items = page.items.len(), has_next = page.has_next, "Fetched page");

                let next = next_cursor(&label, state.token.as_deref(), &page);
                let items: Vec<_> = page.items.into_iter().map(Ok).collect();
                match next {
                    Some(token) => {
                        state.token = Some(token);
                        Some((items, Some(state)))
                    },
                    None => {
                        info!(listing = %label, pages = state.pages, items = state.items, "Listing exhausted");
                        Some((items, None))
                    },
                }
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }
}

/// Cursor for the next request, or `None` when the listing is finished
fn next_cursor<T>(label: &str, current: Option<&str>, page: &Page<T>) -> Option<String> {
    if page.items.is_empty() && current.is_none() {
        return None;
    }
    if !page.has_next {
        return None;
    }
    match page.next_cursor.as_deref() {
        None => {
            warn!(listing = label, "Server signalled another page without a cursor");
            None
        },
        Some(next) if Some(next) == current => {
            warn!(listing = label, cursor = next, "Cursor did not advance, stopping");
            None
        },
        Some(next) => Some(next.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::clock::ManualClock;
    use chrono::Utc;
    use futures::TryStreamExt;
    use std::sync::Mutex;

    /// Serves scripted pages and remembers the cursors it was asked for
    struct Scripted {
        pages: Mutex<Vec<Result<Page<u32>, TransportError>>>,
        cursors: Arc<Mutex<Vec<Option<String>>>>,
    }

    impl Scripted {
        fn new(pages: Vec<Result<Page<u32>, TransportError>>) -> (Self, Arc<Mutex<Vec<Option<String>>>>) {
            let cursors = Arc::new(Mutex::new(Vec::new()));
            let mut pages = pages;
            pages.reverse();
            (
                Self {
                    pages: Mutex::new(pages),
                    cursors: cursors.clone(),
                },
                cursors,
            )
        }
    }

    #[async_trait]
    impl PageSource for Scripted {
        type Item = u32;

        async fn fetch_page(&self, cursor: Option<String>) -> Result<Page<u32>, TransportError> {
            self.cursors.lock().unwrap().push(cursor);
            self.pages
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(TransportError::terminal("fetched past the last page")))
        }
    }

    fn fetcher(pages: Vec<Result<Page<u32>, TransportError>>) -> (PaginatedFetcher<Scripted>, Arc<ManualClock>, Arc<Mutex<Vec<Option<String>>>>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (source, cursors) = Scripted::new(pages);
        let fetcher = PaginatedFetcher::new("numbers", source, clock.clone())
            .rate_limit(Duration::from_millis(100));
        (fetcher, clock, cursors)
    }

    #[tokio::test]
    async fn test_yields_union_of_all_pages() {
        let (fetcher, clock, cursors) = fetcher(vec![
            Ok(Page::with_next(vec![1, 2], "c1")),
            Ok(Page::with_next(vec![3], "c2")),
            Ok(Page::last(vec![4, 5])),
        ]);

        let items: Vec<u32> = fetcher.into_stream().try_collect().await.unwrap();

        assert_eq!(items, vec![1, 2, 3, 4, 5]);
        assert_eq!(
            *cursors.lock().unwrap(),
            vec![None, Some("c1".to_string()), Some("c2".to_string())]
        );
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(100); 2]);
    }

    #[tokio::test]
    async fn test_empty_first_page_ends_stream() {
        let (fetcher, clock, cursors) = fetcher(vec![Ok(Page::with_next(vec![], "c1"))]);

        let items: Vec<u32> = fetcher.into_stream().try_collect().await.unwrap();

        assert!(items.is_empty());
        assert_eq!(cursors.lock().unwrap().len(), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_cursor_terminates() {
        let (fetcher, _clock, cursors) = fetcher(vec![
            Ok(Page::with_next(vec![1], "same")),
            Ok(Page::with_next(vec![2], "same")),
        ]);

        let items: Vec<u32> = fetcher.into_stream().try_collect().await.unwrap();

        assert_eq!(items, vec![1, 2]);
        assert_eq!(cursors.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_cursor_terminates() {
        let page = Page {
            items: vec![1],
            next_cursor: None,
            has_next: true,
        };
        let (fetcher, _clock, _cursors) = fetcher(vec![Ok(page)]);

        let items: Vec<u32> = fetcher.into_stream().try_collect().await.unwrap();
        assert_eq!(items, vec![1]);
    }

    #[tokio::test]
    async fn test_failure_keeps_delivered_prefix() {
        let (fetcher, _clock, _cursors) = fetcher(vec![
            Ok(Page::with_next(vec![1, 2], "c1")),
            Err(TransportError::terminal("HTTP 403")),
        ]);

        let results: Vec<Result<u32, IngestError>> = fetcher.into_stream().collect().await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), &1);
        assert_eq!(results[1].as_ref().unwrap(), &2);
        assert!(matches!(results[2], Err(IngestError::Transport(TransportError::Terminal(_)))));
    }

    #[tokio::test]
    async fn test_cancelled_token_makes_no_request() {
        let (fetcher, clock, cursors) = fetcher(vec![
            Ok(Page::with_next(vec![1], "c1")),
            Ok(Page::last(vec![2])),
        ]);
        let token = CancellationToken::new();
        token.cancel();

        let results: Vec<Result<u32, IngestError>> =
            fetcher.cancel_on(token).into_stream().collect().await;

        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(IngestError::Cancelled)));
        assert!(cursors.lock().unwrap().is_empty());
        assert!(clock.sleeps().is_empty());
    }

    /// Cancels the shared token as soon as the first page is served
    struct CancelAfterFirst {
        inner: Scripted,
        token: CancellationToken,
    }

    #[async_trait]
    impl PageSource for CancelAfterFirst {
        type Item = u32;

        async fn fetch_page(&self, cursor: Option<String>) -> Result<Page<u32>, TransportError> {
            let page = self.inner.fetch_page(cursor).await;
            self.token.cancel();
            page
        }
    }

    #[tokio::test]
    async fn test_cancellation_between_pages() {
        let (inner, cursors) = Scripted::new(vec![
            Ok(Page::with_next(vec![1], "c1")),
            Ok(Page::last(vec![2])),
        ]);
        let token = CancellationToken::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let source = CancelAfterFirst {
            inner,
            token: token.clone(),
        };

        let results: Vec<Result<u32, IngestError>> = PaginatedFetcher::new("numbers", source, clock.clone())
            .rate_limit(Duration::from_millis(100))
            .cancel_on(token)
            .into_stream()
            .collect()
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap(), &1);
        assert!(matches!(results[1], Err(IngestError::Cancelled)));
        assert_eq!(cursors.lock().unwrap().len(), 1);
        assert!(clock.sleeps().is_empty());
    }
}
