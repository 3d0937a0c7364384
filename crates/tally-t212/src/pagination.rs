//! Cursor pagination for the history endpoints.
//!
//! History responses look like `{ "items": [...], "nextPagePath": "..." }`.
//! The cursor comes in several shapes (absolute URL, `/api/v0/...` path, bare
//! query string) and is normalised into a path relative to the API root plus
//! query pairs before it is followed.

use std::collections::HashSet;

use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use tally_core::{
  fetch::FetchContext,
  record::{NaturalKey, RawPage},
};

use crate::{ApiClient, Error, Result};

pub const DEFAULT_PAGE_LIMIT: u32 = 50;

const API_PREFIX: &str = "api/v0/";

/// How far a history collection may page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingLimits {
  /// `limit` query parameter of the first request.
  pub page_limit:          u32,
  /// Stop after this many pages and leave the rest for the next run.
  pub max_pages:           Option<usize>,
  /// Stop once a page holds nothing the store does not already have.
  pub stop_when_caught_up: bool,
}

impl PagingLimits {
  /// Walk every page.
  pub fn full() -> Self {
    Self { page_limit: DEFAULT_PAGE_LIMIT, max_pages: None, stop_when_caught_up: false }
  }

  /// Fetch only what is new since the last run, within `max_pages`.
  pub fn incremental(max_pages: usize) -> Self {
    Self { page_limit: DEFAULT_PAGE_LIMIT, max_pages: Some(max_pages), stop_when_caught_up: true }
  }

  pub fn with_page_limit(mut self, page_limit: u32) -> Self {
    self.page_limit = page_limit;
    self
  }
}

impl Default for PagingLimits {
  fn default() -> Self { Self::full() }
}

/// Endpoint-specific cursor handling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorQuirks {
  /// Drop the `time` parameter the API echoes into the cursor.
  pub drop_time_param:    bool,
  /// Treat HTTP 400/404 on a follow-up page as the end of the data.
  pub end_on_client_error: bool,
}

/// One request to make: path relative to the API root and query pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
  pub path:  String,
  pub query: Vec<(String, String)>,
}

impl PageRequest {
  pub fn first(path: &str, limit: u32) -> Self {
    Self { path: path.to_owned(), query: vec![("limit".to_owned(), limit.to_string())] }
  }
}

/// Why a pagination walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
  /// The last page carried no cursor.
  Exhausted,
  /// A page came back empty.
  EmptyPage,
  /// A page held no keys unknown to the store.
  CaughtUp,
  /// The API answered a follow-up page with 400/404.
  EndOfData,
  /// The cursor pointed at a page already visited.
  LoopDetected,
  /// `max_pages` was reached; the rest waits for the next run.
  PageLimit,
}

/// Items and raw pages gathered by one walk.
#[derive(Debug)]
pub struct Collected {
  pub items: Vec<Value>,
  pub pages: Vec<RawPage>,
  pub stop:  StopReason,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page {
  #[serde(default)]
  items:          Vec<Value>,
  next_page_path: Option<String>,
}

fn strip_api_prefix(path: &str) -> String {
  let trimmed = path.trim_start_matches('/');
  trimmed.strip_prefix(API_PREFIX).unwrap_or(trimmed).to_owned()
}

/// Turn a `nextPagePath` into the request that follows it.
///
/// Accepted shapes: `https://host/api/v0/path?q`, `/api/v0/path?q`, `?q` and
/// a bare `a=b&c=d`. Anything else repeats `base_path` without a query.
pub fn normalise_next_page(base_path: &str, next: &str, quirks: CursorQuirks) -> Result<PageRequest> {
  let url = if next.starts_with("http://") || next.starts_with("https://") {
    Url::parse(next)
  } else {
    let root = Url::parse("http://cursor.invalid/").map_err(|e| Error::Url(e.to_string()))?;
    let relative = if next.starts_with('/') {
      next.to_owned()
    } else if let Some(query) = next.strip_prefix('?') {
      format!("/{base_path}?{query}")
    } else if next.contains('=') {
      format!("/{base_path}?{next}")
    } else {
      format!("/{base_path}")
    };
    root.join(&relative)
  }
  .map_err(|e| Error::Url(format!("{next:?}: {e}")))?;

  let query = url
    .query_pairs()
    .filter(|(key, _)| !(quirks.drop_time_param && key == "time"))
    .map(|(key, value)| (key.into_owned(), value.into_owned()))
    .collect();

  Ok(PageRequest { path: strip_api_prefix(url.path()), query })
}

/// Walk the pages of `base_path`, pacing every request through `cx`.
///
/// `key_of` extracts the natural key of an item so the walk can tell new items
/// from ones the store already holds.
pub async fn collect_pages<F>(
  client: &ApiClient,
  cx: &FetchContext<'_>,
  base_path: &str,
  limits: PagingLimits,
  quirks: CursorQuirks,
  key_of: F,
) -> Result<Collected>
where
  F: Fn(&Value) -> Option<NaturalKey>,
{
  let mut request = PageRequest::first(base_path, limits.page_limit);
  let mut seen_cursors = HashSet::new();
  let mut batch_keys = HashSet::new();
  let mut items = Vec::new();
  let mut pages = Vec::new();
  let mut page_no = 0usize;

  let stop = loop {
    page_no += 1;

    let body = match cx.pacer.call(|| client.get_json(&request.path, &request.query)).await {
      Ok(body) => body,
      Err(e)
        if page_no > 1 && quirks.end_on_client_error && matches!(e.status(), Some(400 | 404)) =>
      {
        tracing::info!(endpoint = base_path, status = ?e.status(), "end of data reached");
        break StopReason::EndOfData;
      }
      Err(e) => return Err(e),
    };

    let page: Page = serde_json::from_value(body.clone())
      .map_err(|source| Error::Decode { path: request.path.clone(), source })?;
    pages.push(RawPage::new(base_path, body));

    if page.items.is_empty() {
      break StopReason::EmptyPage;
    }

    let mut fresh = 0usize;
    for item in &page.items {
      if let Some(key) = key_of(item)
        && !cx.is_known(&key)
        && batch_keys.insert(key)
      {
        fresh += 1;
      }
    }
    tracing::info!(endpoint = base_path, page = page_no, items = page.items.len(), fresh, "page fetched");
    items.extend(page.items);

    if limits.stop_when_caught_up && cx.has_known_keys() && fresh == 0 {
      tracing::info!(endpoint = base_path, "no new records on page; stopping");
      break StopReason::CaughtUp;
    }

    let Some(next) = page.next_page_path.filter(|p| !p.is_empty()) else {
      break StopReason::Exhausted;
    };
    if !seen_cursors.insert(next.clone()) {
      tracing::warn!(endpoint = base_path, cursor = %next, "pagination loop detected; stopping");
      break StopReason::LoopDetected;
    }
    if limits.max_pages.is_some_and(|max| page_no >= max) {
      tracing::warn!(endpoint = base_path, pages = page_no, "page limit reached; will continue next run");
      break StopReason::PageLimit;
    }

    request = normalise_next_page(base_path, &next, quirks)?;
  };

  tracing::info!(endpoint = base_path, pages = pages.len(), items = items.len(), ?stop, "pagination finished");
  Ok(Collected { items, pages, stop })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pairs(query: &[(&str, &str)]) -> Vec<(String, String)> {
    query.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
  }

  const TRANSACTIONS: CursorQuirks = CursorQuirks { drop_time_param: true, end_on_client_error: true };

  #[test]
  fn absolute_urls_lose_host_and_api_prefix() {
    let req = normalise_next_page(
      "history/dividends",
      "https://live.trading212.com/api/v0/history/dividends?limit=50&cursor=123",
      CursorQuirks::default(),
    )
    .unwrap();
    assert_eq!(req.path, "history/dividends");
    assert_eq!(req.query, pairs(&[("limit", "50"), ("cursor", "123")]));
  }

  #[test]
  fn rooted_paths_lose_api_prefix() {
    let req = normalise_next_page(
      "equity/history/orders",
      "/api/v0/equity/history/orders?cursor=9&ticker=",
      CursorQuirks::default(),
    )
    .unwrap();
    assert_eq!(req.path, "equity/history/orders");
    assert_eq!(req.query, pairs(&[("cursor", "9"), ("ticker", "")]));
  }

  #[test]
  fn bare_queries_reuse_the_base_path() {
    let with_mark = normalise_next_page("history/dividends", "?cursor=5", CursorQuirks::default()).unwrap();
    let without = normalise_next_page("history/dividends", "cursor=5", CursorQuirks::default()).unwrap();
    assert_eq!(with_mark, without);
    assert_eq!(with_mark.path, "history/dividends");

    let opaque = normalise_next_page("history/dividends", "abc", CursorQuirks::default()).unwrap();
    assert!(opaque.query.is_empty());
  }

  #[test]
  fn time_parameter_is_dropped_for_transactions_only() {
    let next = "/api/v0/history/transactions?limit=50&cursor=77&time=2024-05-01T10:00:00Z";
    let req = normalise_next_page("history/transactions", next, TRANSACTIONS).unwrap();
    assert_eq!(req.query, pairs(&[("limit", "50"), ("cursor", "77")]));

    let kept = normalise_next_page("history/transactions", next, CursorQuirks::default()).unwrap();
    assert_eq!(kept.query.len(), 3);
  }

  #[test]
  fn encoded_query_values_are_decoded() {
    let req = normalise_next_page("history/dividends", "?cursor=a%2Bb", CursorQuirks::default()).unwrap();
    assert_eq!(req.query, pairs(&[("cursor", "a+b")]));
  }
}
