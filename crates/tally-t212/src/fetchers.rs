//! [`EndpointFetcher`] implementations, one per collected endpoint.
//!
//! Every API call goes through [`FetchContext::pacer`]; every response body
//! is returned as a raw page alongside the converted records.

use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;
use tally_core::{
  fetch::{EndpointFetcher, FetchCause, FetchContext, FetchError, Fetched},
  limiter::EndpointClass,
  record::{
    Dimension, HistoryBatch, HistoryEntry, RawPage, RecordSet, SnapshotEntry, SnapshotRow,
    SnapshotSet,
  },
};

use crate::{
  ApiClient,
  pagination::{CursorQuirks, PagingLimits, collect_pages},
  payload::{
    self, CashBalance, Dividend, OrderFill, PendingOrder, PieAllocation, Position, Transaction,
  },
};

pub const CASH: &str = "equity/account/cash";
pub const PORTFOLIO: &str = "equity/portfolio";
pub const ORDERS: &str = "equity/orders";
pub const PIES: &str = "equity/pies";
pub const ORDER_HISTORY: &str = "equity/history/orders";
pub const DIVIDENDS: &str = "history/dividends";
pub const TRANSACTIONS: &str = "history/transactions";
pub const EXCHANGES: &str = "equity/metadata/exchanges";
pub const INSTRUMENTS: &str = "equity/metadata/instruments";

fn parse_error(endpoint: &str, err: impl std::fmt::Display) -> FetchError {
  FetchError::new(endpoint, FetchCause::Parse(err.to_string()))
}

/// Endpoints answer with either one object or an array of them.
fn into_items(body: &Value) -> Vec<Value> {
  match body {
    Value::Array(items) => items.clone(),
    Value::Null => Vec::new(),
    other => vec![other.clone()],
  }
}

// ─── Snapshots ───────────────────────────────────────────────────────────────

/// One unrestricted GET whose body is the whole snapshot set.
pub struct SnapshotFetcher<T> {
  client:   ApiClient,
  endpoint: &'static str,
  _entry:   PhantomData<fn() -> T>,
}

pub type CashFetcher = SnapshotFetcher<CashBalance>;
pub type PositionsFetcher = SnapshotFetcher<Position>;
pub type PendingOrdersFetcher = SnapshotFetcher<PendingOrder>;

impl<T> SnapshotFetcher<T> {
  fn at(client: ApiClient, endpoint: &'static str) -> Self {
    Self { client, endpoint, _entry: PhantomData }
  }
}

impl CashFetcher {
  pub fn new(client: ApiClient) -> Self { Self::at(client, CASH) }
}

impl PositionsFetcher {
  pub fn new(client: ApiClient) -> Self { Self::at(client, PORTFOLIO) }
}

impl PendingOrdersFetcher {
  pub fn new(client: ApiClient) -> Self { Self::at(client, ORDERS) }
}

#[async_trait]
impl<T: SnapshotEntry> EndpointFetcher for SnapshotFetcher<T> {
  fn endpoint(&self) -> &str { self.endpoint }

  fn class(&self) -> EndpointClass { EndpointClass::Unrestricted }

  async fn fetch(&self, cx: &FetchContext<'_>) -> Result<Fetched, FetchError> {
    let body = cx
      .pacer
      .call(|| self.client.get_json(self.endpoint, &[]))
      .await
      .map_err(|e| e.into_fetch_error(self.endpoint))?;

    let set = SnapshotSet::from_payloads::<T>(into_items(&body))
      .map_err(|e| parse_error(self.endpoint, e))?;

    Ok(
      Fetched::new(RecordSet::Snapshot(set))
        .with_pages(vec![RawPage::new(self.endpoint, body)]),
    )
  }
}

/// Pie allocations: the pie list, then one detail call per pie.
pub struct PiesFetcher {
  client: ApiClient,
}

impl PiesFetcher {
  pub fn new(client: ApiClient) -> Self { Self { client } }
}

#[async_trait]
impl EndpointFetcher for PiesFetcher {
  fn endpoint(&self) -> &str { PIES }

  fn class(&self) -> EndpointClass { EndpointClass::Restricted }

  async fn fetch(&self, cx: &FetchContext<'_>) -> Result<Fetched, FetchError> {
    let list = cx
      .pacer
      .call(|| self.client.get_json(PIES, &[]))
      .await
      .map_err(|e| e.into_fetch_error(PIES))?;
    let ids = payload::pie_ids(&list).map_err(|e| parse_error(PIES, e))?;
    tracing::debug!(pies = ids.len(), "fetching pie details");

    let mut pages = vec![RawPage::new(PIES, list)];
    let mut rows = Vec::new();
    for id in ids {
      let path = format!("{PIES}/{id}");
      let detail = cx
        .pacer
        .call(|| self.client.get_json(&path, &[]))
        .await
        .map_err(|e| e.into_fetch_error(&path))?;

      for slot in payload::pie_allocation_rows(&detail).map_err(|e| parse_error(&path, e))? {
        rows.push(SnapshotRow::from_entry::<PieAllocation>(slot).map_err(|e| parse_error(&path, e))?);
      }
      pages.push(RawPage::new(path, detail));
    }

    Ok(
      Fetched::new(RecordSet::Snapshot(SnapshotSet::new(PieAllocation::KIND, rows)))
        .with_pages(pages),
    )
  }
}

// ─── History ─────────────────────────────────────────────────────────────────

/// A paginated history endpoint.
pub struct HistoryFetcher<T> {
  client:   ApiClient,
  endpoint: &'static str,
  limits:   PagingLimits,
  quirks:   CursorQuirks,
  _entry:   PhantomData<fn() -> T>,
}

impl<T> HistoryFetcher<T> {
  fn at(client: ApiClient, endpoint: &'static str, limits: PagingLimits) -> Self {
    Self { client, endpoint, limits, quirks: CursorQuirks::default(), _entry: PhantomData }
  }
}

impl HistoryFetcher<Transaction> {
  pub fn transactions(client: ApiClient, limits: PagingLimits) -> Self {
    Self {
      quirks: CursorQuirks { drop_time_param: true, end_on_client_error: true },
      ..Self::at(client, TRANSACTIONS, limits)
    }
  }
}

impl HistoryFetcher<OrderFill> {
  pub fn order_fills(client: ApiClient, limits: PagingLimits) -> Self {
    Self::at(client, ORDER_HISTORY, limits)
  }
}

impl HistoryFetcher<Dividend> {
  pub fn dividends(client: ApiClient, limits: PagingLimits) -> Self {
    Self::at(client, DIVIDENDS, limits)
  }
}

#[async_trait]
impl<T: HistoryEntry> EndpointFetcher for HistoryFetcher<T> {
  fn endpoint(&self) -> &str { self.endpoint }

  fn class(&self) -> EndpointClass { EndpointClass::Restricted }

  async fn fetch(&self, cx: &FetchContext<'_>) -> Result<Fetched, FetchError> {
    let collected = collect_pages(&self.client, cx, self.endpoint, self.limits, self.quirks, |item| {
      T::deserialize(item).ok().map(|entry| entry.natural_key())
    })
    .await
    .map_err(|e| e.into_fetch_error(self.endpoint))?;

    let batch = HistoryBatch::from_payloads::<T>(collected.items)
      .map_err(|e| parse_error(self.endpoint, e))?;

    Ok(Fetched::new(RecordSet::History(batch)).with_pages(collected.pages))
  }
}

// ─── Reference data ──────────────────────────────────────────────────────────

type Convert = fn(Vec<Value>) -> tally_core::Result<Vec<Dimension>>;

/// A metadata list converted into reference dimensions.
pub struct MetadataFetcher {
  client:   ApiClient,
  endpoint: &'static str,
  convert:  Convert,
}

impl MetadataFetcher {
  pub fn exchanges(client: ApiClient) -> Self {
    Self { client, endpoint: EXCHANGES, convert: payload::exchange_dimensions }
  }

  pub fn instruments(client: ApiClient) -> Self {
    Self { client, endpoint: INSTRUMENTS, convert: payload::instrument_dimensions }
  }
}

#[async_trait]
impl EndpointFetcher for MetadataFetcher {
  fn endpoint(&self) -> &str { self.endpoint }

  fn class(&self) -> EndpointClass { EndpointClass::Restricted }

  async fn fetch(&self, cx: &FetchContext<'_>) -> Result<Fetched, FetchError> {
    let body = cx
      .pacer
      .call(|| self.client.get_json(self.endpoint, &[]))
      .await
      .map_err(|e| e.into_fetch_error(self.endpoint))?;

    let dims = (self.convert)(into_items(&body)).map_err(|e| parse_error(self.endpoint, e))?;

    Ok(
      Fetched::new(RecordSet::Reference(dims))
        .with_pages(vec![RawPage::new(self.endpoint, body)]),
    )
  }
}
