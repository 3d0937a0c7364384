//! Record sets: the unit of data moved from a fetcher to the store.
//!
//! A fetch produces exactly one [`RecordSet`]. Its variant decides how it is
//! persisted: snapshot sets are recorded per capture instant, history records
//! are appended at most once per natural key, and reference dimensions are
//! upserted in place.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{Error, Result};

/// Brokerage account identifier.
pub type AccountId = i64;

// ─── Account ─────────────────────────────────────────────────────────────────

/// The account a cycle collects for. Credentials never appear here; they live
/// inside the fetchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountContext {
  pub account_id:    AccountId,
  /// Upper-case ISO 4217 code of the account currency.
  pub currency_code: String,
}

// ─── Entity sets ─────────────────────────────────────────────────────────────

/// A collection whose state is captured as a whole on every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
  AccountCash,
  Positions,
  PendingOrders,
  PieAllocations,
}

impl SnapshotKind {
  pub const ALL: [SnapshotKind; 4] = [
    Self::AccountCash,
    Self::Positions,
    Self::PendingOrders,
    Self::PieAllocations,
  ];

  /// The discriminant stored in the `entity_set` column.
  pub fn as_str(self) -> &'static str {
    match self {
      Self::AccountCash => "account_cash",
      Self::Positions => "positions",
      Self::PendingOrders => "pending_orders",
      Self::PieAllocations => "pie_allocations",
    }
  }
}

impl fmt::Display for SnapshotKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for SnapshotKind {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    Self::ALL
      .into_iter()
      .find(|k| k.as_str() == s)
      .ok_or_else(|| Error::UnknownEntitySet(s.to_owned()))
  }
}

/// A type of permanent, naturally keyed fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
  Transaction,
  OrderFill,
  Dividend,
}

impl HistoryKind {
  pub const ALL: [HistoryKind; 3] = [Self::Transaction, Self::OrderFill, Self::Dividend];

  /// The discriminant stored in the `kind` column.
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Transaction => "transaction",
      Self::OrderFill => "order_fill",
      Self::Dividend => "dividend",
    }
  }
}

impl fmt::Display for HistoryKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for HistoryKind {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    Self::ALL
      .into_iter()
      .find(|k| k.as_str() == s)
      .ok_or_else(|| Error::UnknownHistoryKind(s.to_owned()))
  }
}

// ─── Natural keys ────────────────────────────────────────────────────────────

/// The identity of a history record within its [`HistoryKind`].
///
/// Encoded as a compact JSON array of the key components, so `null`
/// components (e.g. an order without a fill id) stay distinct from any string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(String);

impl NaturalKey {
  pub fn new<I>(parts: I) -> Self
  where
    I: IntoIterator,
    I::Item: Into<Value>,
  {
    let parts: Vec<Value> = parts.into_iter().map(Into::into).collect();
    Self(Value::Array(parts).to_string())
  }

  /// Rebuild a key from its stored encoding.
  pub fn from_encoded(encoded: impl Into<String>) -> Self { Self(encoded.into()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for NaturalKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

// ─── Dimensions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
  Instrument,
  Exchange,
  WorkingSchedule,
}

impl DimensionKind {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Instrument => "instrument",
      Self::Exchange => "exchange",
      Self::WorkingSchedule => "working_schedule",
    }
  }
}

impl FromStr for DimensionKind {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "instrument" => Ok(Self::Instrument),
      "exchange" => Ok(Self::Exchange),
      "working_schedule" => Ok(Self::WorkingSchedule),
      other => Err(Error::UnknownDimensionKind(other.to_owned())),
    }
  }
}

/// A slow-changing reference entity: created on first sight, updated in place
/// afterwards, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
  pub kind:       DimensionKind,
  pub key:        String,
  /// Full attributes when the payload carries them. `None` means "seen, but
  /// only by reference": existing attributes are kept.
  pub attributes: Option<Value>,
}

impl Dimension {
  pub fn reference(kind: DimensionKind, key: impl Into<String>) -> Self {
    Self { kind, key: key.into(), attributes: None }
  }

  pub fn with_attributes(kind: DimensionKind, key: impl Into<String>, attributes: Value) -> Self {
    Self { kind, key: key.into(), attributes: Some(attributes) }
  }
}

// ─── Entry traits ────────────────────────────────────────────────────────────

/// A typed view over one row of a snapshot payload.
///
/// Implementors declare which set they belong to, the row's key within the
/// set, and the dimensions the row refers to.
pub trait SnapshotEntry: DeserializeOwned {
  const KIND: SnapshotKind;

  fn row_key(&self) -> String;

  fn references(&self) -> Vec<Dimension> { Vec::new() }
}

/// A typed view over one history payload, declaring its natural key.
pub trait HistoryEntry: DeserializeOwned {
  const KIND: HistoryKind;

  fn natural_key(&self) -> NaturalKey;

  /// When the event happened, if the payload says so.
  fn occurred_at(&self) -> Option<DateTime<Utc>>;
}

fn decode_entry<T: DeserializeOwned>(entity: &'static str, payload: &Value) -> Result<T> {
  T::deserialize(payload).map_err(|source| Error::Payload { entity, source })
}

// ─── Snapshot sets ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
  /// Natural key of the row within its set (ticker, order id, ...).
  pub key:        String,
  pub references: Vec<Dimension>,
  pub fields:     Value,
}

impl SnapshotRow {
  /// Decode `payload` as `T` to derive the key and references; the payload
  /// itself is kept verbatim as the row's fields.
  pub fn from_entry<T: SnapshotEntry>(payload: Value) -> Result<Self> {
    let entry: T = decode_entry(T::KIND.as_str(), &payload)?;
    Ok(Self {
      key:        entry.row_key(),
      references: entry.references(),
      fields:     payload,
    })
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotSet {
  pub kind:        SnapshotKind,
  /// Capture instant reported by the source. When `None`, the orchestrator
  /// uses the wall-clock time of the fetch.
  pub captured_at: Option<DateTime<Utc>>,
  pub rows:        Vec<SnapshotRow>,
}

impl SnapshotSet {
  pub fn new(kind: SnapshotKind, rows: Vec<SnapshotRow>) -> Self {
    Self { kind, captured_at: None, rows }
  }

  pub fn from_payloads<T: SnapshotEntry>(payloads: Vec<Value>) -> Result<Self> {
    let rows = payloads
      .into_iter()
      .map(SnapshotRow::from_entry::<T>)
      .collect::<Result<_>>()?;
    Ok(Self::new(T::KIND, rows))
  }
}

// ─── History records ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
  pub natural_key: NaturalKey,
  pub occurred_at: DateTime<Utc>,
  pub payload:     Value,
}

impl HistoryRecord {
  /// Decode `payload` as `T` to derive the natural key. Payloads without an
  /// event time are stamped with the current time.
  pub fn from_entry<T: HistoryEntry>(payload: Value) -> Result<Self> {
    let entry: T = decode_entry(T::KIND.as_str(), &payload)?;
    Ok(Self {
      natural_key: entry.natural_key(),
      occurred_at: entry.occurred_at().unwrap_or_else(Utc::now),
      payload,
    })
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryBatch {
  pub kind:    HistoryKind,
  pub records: Vec<HistoryRecord>,
}

impl HistoryBatch {
  pub fn new(kind: HistoryKind, records: Vec<HistoryRecord>) -> Self { Self { kind, records } }

  pub fn from_payloads<T: HistoryEntry>(payloads: Vec<Value>) -> Result<Self> {
    let records = payloads
      .into_iter()
      .map(HistoryRecord::from_entry::<T>)
      .collect::<Result<_>>()?;
    Ok(Self::new(T::KIND, records))
  }
}

// ─── RecordSet ───────────────────────────────────────────────────────────────

/// Everything a single fetch produced, tagged by how it must be persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordSet {
  Snapshot(SnapshotSet),
  History(HistoryBatch),
  Reference(Vec<Dimension>),
}

impl RecordSet {
  pub fn len(&self) -> usize {
    match self {
      Self::Snapshot(set) => set.rows.len(),
      Self::History(batch) => batch.records.len(),
      Self::Reference(dims) => dims.len(),
    }
  }

  pub fn is_empty(&self) -> bool { self.len() == 0 }

  /// Short human description, used in policy-mismatch errors.
  pub fn describe(&self) -> String {
    match self {
      Self::Snapshot(set) => format!("snapshot set {}", set.kind),
      Self::History(batch) => format!("history batch {}", batch.kind),
      Self::Reference(_) => "reference dimensions".to_owned(),
    }
  }
}

// ─── Raw pages ───────────────────────────────────────────────────────────────

/// One API response body as received, staged before conversion is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPage {
  pub endpoint:   String,
  pub fetched_at: DateTime<Utc>,
  pub body:       Value,
}

impl RawPage {
  pub fn new(endpoint: impl Into<String>, body: Value) -> Self {
    Self { endpoint: endpoint.into(), fetched_at: Utc::now(), body }
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[derive(Deserialize)]
  struct Position {
    ticker: String,
  }

  impl SnapshotEntry for Position {
    const KIND: SnapshotKind = SnapshotKind::Positions;

    fn row_key(&self) -> String { self.ticker.clone() }

    fn references(&self) -> Vec<Dimension> {
      vec![Dimension::reference(DimensionKind::Instrument, &self.ticker)]
    }
  }

  #[derive(Deserialize)]
  #[serde(rename_all = "camelCase")]
  struct Fill {
    id:      i64,
    fill_id: Option<i64>,
  }

  impl HistoryEntry for Fill {
    const KIND: HistoryKind = HistoryKind::OrderFill;

    fn natural_key(&self) -> NaturalKey { NaturalKey::new([Value::from(self.id), Value::from(self.fill_id)]) }

    fn occurred_at(&self) -> Option<DateTime<Utc>> { None }
  }

  #[test]
  fn snapshot_row_keeps_payload_verbatim() {
    let payload = json!({ "ticker": "AAPL_US_EQ", "quantity": 3.5 });
    let row = SnapshotRow::from_entry::<Position>(payload.clone()).unwrap();

    assert_eq!(row.key, "AAPL_US_EQ");
    assert_eq!(row.fields, payload);
    assert_eq!(row.references, vec![Dimension::reference(DimensionKind::Instrument, "AAPL_US_EQ")]);
  }

  #[test]
  fn malformed_payload_names_the_entity() {
    let err = SnapshotSet::from_payloads::<Position>(vec![json!({ "quantity": 1 })]).unwrap_err();
    assert!(matches!(err, Error::Payload { entity: "positions", .. }));
  }

  #[test]
  fn missing_fill_id_is_a_distinct_key_component() {
    let with_fill = HistoryRecord::from_entry::<Fill>(json!({ "id": 7, "fillId": 1 })).unwrap();
    let without = HistoryRecord::from_entry::<Fill>(json!({ "id": 7, "fillId": null })).unwrap();

    assert_ne!(with_fill.natural_key, without.natural_key);
    assert_eq!(without.natural_key.as_str(), "[7,null]");
  }

  #[test]
  fn string_components_cannot_collide_with_separators() {
    let a = NaturalKey::new(["a,b", "c"]);
    let b = NaturalKey::new(["a", "b,c"]);
    assert_ne!(a, b);
  }

  #[test]
  fn kinds_roundtrip_through_their_discriminants() {
    for kind in SnapshotKind::ALL {
      assert_eq!(kind.as_str().parse::<SnapshotKind>().unwrap(), kind);
    }
    for kind in HistoryKind::ALL {
      assert_eq!(kind.as_str().parse::<HistoryKind>().unwrap(), kind);
    }
    assert!("positions_v2".parse::<SnapshotKind>().is_err());
  }

  #[test]
  fn record_set_len_counts_rows() {
    let set = RecordSet::Reference(vec![
      Dimension::reference(DimensionKind::Exchange, "1"),
      Dimension::reference(DimensionKind::Exchange, "2"),
    ]);
    assert_eq!(set.len(), 2);
    assert!(!set.is_empty());
  }
}
