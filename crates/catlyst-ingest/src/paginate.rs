//! Cursor-based pagination over a single endpoint.
//!
//! Pages look like `{"data": [...], "pagination": {"nextCursor": "...",
//! "totalItems": N}}`; some endpoints put the cursor in a top-level
//! `nextPageToken` instead. A missing, null or empty cursor ends the
//! sequence.

use futures_util::Stream;
use futures_util::stream;
use serde_json::Value;
use tracing::debug;

use crate::error::{IngestError, IngestResult};
use crate::transport::{ApiRequest, ApiTransport};

/// One page of results.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub next_cursor: Option<String>,
    pub total_items: Option<u64>,
}

impl Page {
    /// Parse a page body.
    ///
    /// # Errors
    /// Returns `IngestError::Protocol` if `data` is present but not an array.
    pub fn from_json(body: &Value) -> IngestResult<Self> {
        let items = match body.get("data") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                return Err(IngestError::Protocol(format!(
                    "expected 'data' to be an array, got {}",
                    json_kind(other)
                )));
            }
        };

        let pagination = body.get("pagination");
        let next_cursor = pagination
            .and_then(|p| p.get("nextCursor"))
            .or_else(|| body.get("nextPageToken"))
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(String::from);
        let total_items = pagination
            .and_then(|p| p.get("totalItems"))
            .and_then(Value::as_u64);

        Ok(Self {
            items,
            next_cursor,
            total_items,
        })
    }
}

/// Lazy page sequence over one endpoint.
pub struct Paginator<'a> {
    transport: &'a dyn ApiTransport,
    request: ApiRequest,
    limit: u32,
    cursor: Option<String>,
    pending_error: Option<IngestError>,
    pages: u32,
    done: bool,
}

impl<'a> Paginator<'a> {
    /// Paginate `request` with `limit` items per page.
    #[must_use]
    pub fn new(transport: &'a dyn ApiTransport, request: ApiRequest, limit: u32) -> Self {
        Self {
            transport,
            request,
            limit: limit.max(1),
            cursor: None,
            pending_error: None,
            pages: 0,
            done: false,
        }
    }

    /// Pages fetched so far.
    #[must_use]
    pub const fn pages(&self) -> u32 {
        self.pages
    }

    /// Fetch the next page. `Ok(None)` marks the end of data.
    ///
    /// After an error the sequence is finished.
    ///
    /// # Errors
    /// Transport errors for the page, or `IngestError::Protocol` when the
    /// body is malformed or the server hands back the cursor it was given.
    pub async fn next_page(&mut self) -> IngestResult<Option<Page>> {
        if let Some(err) = self.pending_error.take() {
            self.done = true;
            return Err(err);
        }
        if self.done {
            return Ok(None);
        }

        let mut request = self.request.clone();
        request.set_query("limit", self.limit.to_string());
        if let Some(cursor) = &self.cursor {
            request.set_query("cursor", cursor.clone());
        }

        let page = match self.transport.execute(&request).await {
            Ok(body) => Page::from_json(&body),
            Err(err) => Err(err),
        };
        let page = match page {
            Ok(page) => page,
            Err(err) => {
                self.done = true;
                return Err(err);
            }
        };
        self.pages += 1;

        debug!(
            path = %self.request.path,
            page = self.pages,
            items = page.items.len(),
            has_next = page.next_cursor.is_some(),
            "fetched page"
        );

        match &page.next_cursor {
            None => self.done = true,
            Some(next) if self.cursor.as_deref() == Some(next.as_str()) => {
                self.pending_error = Some(IngestError::Protocol(format!(
                    "cursor '{next}' repeated on {}",
                    self.request.path
                )));
            }
            Some(next) => self.cursor = Some(next.clone()),
        }

        Ok(Some(page))
    }

    /// Expose the pages as a stream. The stream ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = IngestResult<Page>> + 'a {
        stream::unfold(self, |mut paginator| async move {
            match paginator.next_page().await {
                Ok(Some(page)) => Some((Ok(page), paginator)),
                Ok(None) => None,
                Err(err) => Some((Err(err), paginator)),
            }
        })
    }

    /// Drain every page, keeping what was fetched before any failure.
    pub async fn collect_all(mut self) -> PartialListing<Value> {
        let mut listing = PartialListing::default();
        loop {
            match self.next_page().await {
                Ok(Some(page)) => {
                    if listing.total_hint.is_none() {
                        listing.total_hint = page.total_items;
                    }
                    listing.items.extend(page.items);
                }
                Ok(None) => break,
                Err(err) => {
                    listing.error = Some(err);
                    break;
                }
            }
        }
        listing.pages = self.pages;
        listing
    }
}

/// Items gathered from a page sequence plus the error that ended it early,
/// if any.
#[derive(Debug)]
pub struct PartialListing<T> {
    pub items: Vec<T>,
    pub pages: u32,
    pub total_hint: Option<u64>,
    pub error: Option<IngestError>,
}

impl<T> Default for PartialListing<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            pages: 0,
            total_hint: None,
            error: None,
        }
    }
}

impl<T> PartialListing<T> {
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    /// Treat any failure as fatal.
    ///
    /// # Errors
    /// Returns `IngestError::Listing` wrapping the page error.
    pub fn into_result(self) -> IngestResult<Vec<T>> {
        match self.error {
            None => Ok(self.items),
            Some(source) => Err(IngestError::Listing {
                pages: self.pages,
                items: self.items.len(),
                source: Box::new(source),
            }),
        }
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
