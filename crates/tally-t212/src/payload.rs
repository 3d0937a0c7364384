//! Typed views over Trading 212 payloads.
//!
//! Only the fields that identify a record are modelled; the raw JSON object is
//! what gets stored. Field names follow the API's `camelCase`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use tally_core::{
  Error, Result,
  record::{
    AccountContext, Dimension, DimensionKind, HistoryEntry, HistoryKind, NaturalKey,
    SnapshotEntry, SnapshotKind,
  },
};

/// Timestamps the API sometimes omits or sends in odd shapes; anything that
/// is not RFC 3339 reads as absent.
fn lenient_datetime<'de, D>(de: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
  D: Deserializer<'de>,
{
  let raw = Option::<String>::deserialize(de)?;
  Ok(raw.and_then(|s| {
    DateTime::parse_from_rfc3339(&s)
      .ok()
      .map(|dt| dt.with_timezone(&Utc))
  }))
}

// ─── Account ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
  pub id:            i64,
  #[serde(default)]
  pub currency_code: String,
}

impl AccountInfo {
  pub fn into_context(self) -> AccountContext {
    AccountContext {
      account_id:    self.id,
      currency_code: self.currency_code.to_ascii_uppercase(),
    }
  }
}

// ─── Snapshots ───────────────────────────────────────────────────────────────

/// `equity/account/cash`: one row per capture.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashBalance {
  pub free:  Option<f64>,
  pub total: Option<f64>,
}

impl SnapshotEntry for CashBalance {
  const KIND: SnapshotKind = SnapshotKind::AccountCash;

  fn row_key(&self) -> String { "cash".to_owned() }
}

/// One element of `equity/portfolio`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
  pub ticker:   String,
  pub quantity: Option<f64>,
}

impl SnapshotEntry for Position {
  const KIND: SnapshotKind = SnapshotKind::Positions;

  fn row_key(&self) -> String { self.ticker.clone() }

  fn references(&self) -> Vec<Dimension> {
    vec![Dimension::reference(DimensionKind::Instrument, &self.ticker)]
  }
}

/// One element of `equity/orders`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrder {
  pub id:     i64,
  pub ticker: String,
  pub status: Option<String>,
}

impl SnapshotEntry for PendingOrder {
  const KIND: SnapshotKind = SnapshotKind::PendingOrders;

  fn row_key(&self) -> String { self.id.to_string() }

  fn references(&self) -> Vec<Dimension> {
    vec![Dimension::reference(DimensionKind::Instrument, &self.ticker)]
  }
}

/// One instrument slot of a pie, flattened with its pie id by
/// [`pie_allocation_rows`].
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PieAllocation {
  pub pie_id:         i64,
  pub ticker:         String,
  pub expected_share: Option<f64>,
}

impl SnapshotEntry for PieAllocation {
  const KIND: SnapshotKind = SnapshotKind::PieAllocations;

  fn row_key(&self) -> String { format!("{}/{}", self.pie_id, self.ticker) }

  fn references(&self) -> Vec<Dimension> {
    vec![Dimension::reference(DimensionKind::Instrument, &self.ticker)]
  }
}

/// The `id` of each element of `equity/pies`.
pub fn pie_ids(list: &Value) -> Result<Vec<i64>> {
  #[derive(Deserialize)]
  struct PieSummary {
    id: i64,
  }

  let pies: Vec<PieSummary> = Vec::deserialize(list)
    .map_err(|source| Error::Payload { entity: "pies", source })?;
  Ok(pies.into_iter().map(|p| p.id).collect())
}

/// Flatten an `equity/pies/{id}` detail into one payload per instrument, each
/// carrying the pie id.
pub fn pie_allocation_rows(detail: &Value) -> Result<Vec<Value>> {
  #[derive(Deserialize)]
  struct Settings {
    id: i64,
  }

  #[derive(Deserialize)]
  struct PieDetail {
    settings:    Settings,
    #[serde(default)]
    instruments: Vec<serde_json::Map<String, Value>>,
  }

  let detail = PieDetail::deserialize(detail)
    .map_err(|source| Error::Payload { entity: "pie detail", source })?;

  Ok(
    detail
      .instruments
      .into_iter()
      .map(|mut slot| {
        slot.insert("pieId".to_owned(), json!(detail.settings.id));
        Value::Object(slot)
      })
      .collect(),
  )
}

// ─── History ─────────────────────────────────────────────────────────────────

/// One item of `history/transactions`. Identified by `(reference, type)`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
  pub reference: Option<String>,
  #[serde(rename = "type")]
  pub kind:      Option<String>,
  #[serde(default, deserialize_with = "lenient_datetime")]
  pub date_time: Option<DateTime<Utc>>,
}

impl HistoryEntry for Transaction {
  const KIND: HistoryKind = HistoryKind::Transaction;

  fn natural_key(&self) -> NaturalKey { NaturalKey::new([self.reference.clone(), self.kind.clone()]) }

  fn occurred_at(&self) -> Option<DateTime<Utc>> { self.date_time }
}

/// One item of `equity/history/orders`. Identified by `(id, fillId)`; an
/// order that never filled has a `null` fill id, which is its own key.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFill {
  pub id:            i64,
  pub fill_id:       Option<i64>,
  #[serde(default, deserialize_with = "lenient_datetime")]
  pub date_executed: Option<DateTime<Utc>>,
  #[serde(default, deserialize_with = "lenient_datetime")]
  pub date_created:  Option<DateTime<Utc>>,
}

impl HistoryEntry for OrderFill {
  const KIND: HistoryKind = HistoryKind::OrderFill;

  fn natural_key(&self) -> NaturalKey { NaturalKey::new([json!(self.id), json!(self.fill_id)]) }

  fn occurred_at(&self) -> Option<DateTime<Utc>> { self.date_executed.or(self.date_created) }
}

/// One item of `history/dividends`. Identified by `(reference, ticker)`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dividend {
  pub reference: Option<String>,
  pub ticker:    Option<String>,
  #[serde(default, deserialize_with = "lenient_datetime")]
  pub paid_on:   Option<DateTime<Utc>>,
}

impl HistoryEntry for Dividend {
  const KIND: HistoryKind = HistoryKind::Dividend;

  fn natural_key(&self) -> NaturalKey {
    NaturalKey::new([self.reference.clone(), self.ticker.clone()])
  }

  fn occurred_at(&self) -> Option<DateTime<Utc>> { self.paid_on }
}

// ─── Reference data ──────────────────────────────────────────────────────────

/// `equity/metadata/exchanges` → exchange and working-schedule dimensions.
pub fn exchange_dimensions(exchanges: Vec<Value>) -> Result<Vec<Dimension>> {
  #[derive(Deserialize)]
  #[serde(rename_all = "camelCase")]
  struct Schedule {
    id:          i64,
    #[serde(default)]
    time_events: Vec<Value>,
  }

  #[derive(Deserialize)]
  #[serde(rename_all = "camelCase")]
  struct Exchange {
    id:                i64,
    name:              Option<String>,
    #[serde(default)]
    working_schedules: Vec<Schedule>,
  }

  let mut dims = Vec::new();
  for payload in exchanges {
    let exchange = Exchange::deserialize(&payload)
      .map_err(|source| Error::Payload { entity: "exchange", source })?;

    dims.push(Dimension::with_attributes(
      DimensionKind::Exchange,
      exchange.id.to_string(),
      json!({ "name": exchange.name }),
    ));
    for schedule in exchange.working_schedules {
      dims.push(Dimension::with_attributes(
        DimensionKind::WorkingSchedule,
        schedule.id.to_string(),
        json!({ "exchangeId": exchange.id, "timeEvents": schedule.time_events }),
      ));
    }
  }
  Ok(dims)
}

/// `equity/metadata/instruments` → instrument dimensions keyed by ticker.
pub fn instrument_dimensions(instruments: Vec<Value>) -> Result<Vec<Dimension>> {
  #[derive(Deserialize)]
  struct Instrument {
    ticker: String,
  }

  instruments
    .into_iter()
    .map(|payload| {
      let instrument = Instrument::deserialize(&payload)
        .map_err(|source| Error::Payload { entity: "instrument", source })?;
      Ok(Dimension::with_attributes(DimensionKind::Instrument, instrument.ticker, payload))
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use tally_core::record::{HistoryRecord, SnapshotRow};

  use super::*;

  #[test]
  fn order_fills_without_fill_id_are_distinct_keys() {
    let filled = HistoryRecord::from_entry::<OrderFill>(json!({ "id": 5, "fillId": 9 })).unwrap();
    let cancelled = HistoryRecord::from_entry::<OrderFill>(json!({ "id": 5, "fillId": null })).unwrap();
    assert_ne!(filled.natural_key, cancelled.natural_key);
    assert_eq!(cancelled.natural_key.as_str(), "[5,null]");
  }

  #[test]
  fn order_fill_time_falls_back_to_creation() {
    let record = HistoryRecord::from_entry::<OrderFill>(json!({
      "id": 1,
      "dateCreated": "2024-02-01T10:00:00Z",
      "dateExecuted": null
    }))
    .unwrap();
    assert_eq!(record.occurred_at.to_rfc3339(), "2024-02-01T10:00:00+00:00");
  }

  #[test]
  fn transactions_key_on_reference_and_type() {
    let record = HistoryRecord::from_entry::<Transaction>(json!({
      "reference": "abc",
      "type": "DEPOSIT",
      "amount": 100.0,
      "dateTime": "2024-01-05T08:30:00.000Z"
    }))
    .unwrap();
    assert_eq!(record.natural_key, NaturalKey::new(["abc", "DEPOSIT"]));
    assert_eq!(record.payload["amount"], 100.0);
  }

  #[test]
  fn unparseable_timestamps_read_as_absent() {
    let tx: Transaction =
      serde_json::from_value(json!({ "reference": "r", "type": "FEE", "dateTime": "yesterday" }))
        .unwrap();
    assert!(tx.date_time.is_none());
  }

  #[test]
  fn positions_reference_their_instrument() {
    let row = SnapshotRow::from_entry::<Position>(json!({ "ticker": "AAPL_US_EQ", "quantity": 2 }))
      .unwrap();
    assert_eq!(row.key, "AAPL_US_EQ");
    assert_eq!(row.references, vec![Dimension::reference(DimensionKind::Instrument, "AAPL_US_EQ")]);
  }

  #[test]
  fn pie_details_flatten_to_keyed_allocations() {
    let detail = json!({
      "settings": { "id": 12, "name": "Core" },
      "instruments": [
        { "ticker": "VUSA_EQ", "expectedShare": 0.6, "currentShare": 0.58, "ownedQuantity": 3.1 },
        { "ticker": "IWDA_EQ", "expectedShare": 0.4 }
      ]
    });

    let rows = pie_allocation_rows(&detail)
      .unwrap()
      .into_iter()
      .map(SnapshotRow::from_entry::<PieAllocation>)
      .collect::<Result<Vec<_>>>()
      .unwrap();

    let keys: Vec<_> = rows.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, ["12/VUSA_EQ", "12/IWDA_EQ"]);
    assert_eq!(rows[0].fields["ownedQuantity"], 3.1);
  }

  #[test]
  fn exchanges_yield_schedules_as_dimensions() {
    let dims = exchange_dimensions(vec![json!({
      "id": 3,
      "name": "London Stock Exchange",
      "workingSchedules": [{ "id": 40, "timeEvents": [{ "date": "2024-01-01T08:00:00Z", "type": "OPEN" }] }]
    })])
    .unwrap();

    assert_eq!(dims.len(), 2);
    assert_eq!(dims[0].kind, DimensionKind::Exchange);
    assert_eq!(dims[1].kind, DimensionKind::WorkingSchedule);
    assert_eq!(dims[1].key, "40");
    assert_eq!(dims[1].attributes.as_ref().unwrap()["exchangeId"], 3);
  }

  #[test]
  fn account_currency_is_upper_cased() {
    let info: AccountInfo = serde_json::from_value(json!({ "id": 77, "currencyCode": "gbp" })).unwrap();
    assert_eq!(info.into_context(), AccountContext { account_id: 77, currency_code: "GBP".into() });
  }
}
