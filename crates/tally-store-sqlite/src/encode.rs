//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as RFC 3339 strings with a fixed microsecond
//! precision and a `Z` suffix, so text order is time order. JSON payloads are
//! stored compact.

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use tally_core::record::{
  Dimension, DimensionKind, HistoryRecord, NaturalKey, SnapshotRow,
};
use uuid::Uuid;

use crate::{
  Error, Result,
  store::{StoredAccount, StoredDimension},
};

// ─── Uuid ────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339_opts(SecondsFormat::Micros, true) }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Payloads ────────────────────────────────────────────────────────────────

/// Hex SHA-256 of an encoded payload.
pub fn payload_hash(payload_json: &str) -> String {
  hex::encode(Sha256::digest(payload_json.as_bytes()))
}

pub fn encode_attributes(attributes: Option<&serde_json::Value>) -> Result<Option<String>> {
  Ok(attributes.map(serde_json::to_string).transpose()?)
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// One `dimensions` upsert, encoded ahead of the database call.
pub struct EncodedDimension {
  pub kind:            &'static str,
  pub key:             String,
  pub attributes_json: Option<String>,
}

impl EncodedDimension {
  pub fn encode(dim: &Dimension) -> Result<Self> {
    Ok(Self {
      kind:            dim.kind.as_str(),
      key:             dim.key.clone(),
      attributes_json: encode_attributes(dim.attributes.as_ref())?,
    })
  }
}

/// Raw strings read directly from a `snapshot_rows` row.
pub struct RawSnapshotRow {
  pub row_key:         String,
  pub references_json: String,
  pub fields_json:     String,
}

impl RawSnapshotRow {
  pub fn into_row(self) -> Result<SnapshotRow> {
    Ok(SnapshotRow {
      key:        self.row_key,
      references: serde_json::from_str(&self.references_json)?,
      fields:     serde_json::from_str(&self.fields_json)?,
    })
  }
}

/// Raw strings read directly from a `history_records` row.
pub struct RawHistoryRecord {
  pub natural_key:  String,
  pub occurred_at:  String,
  pub payload_json: String,
}

impl RawHistoryRecord {
  pub fn into_record(self) -> Result<HistoryRecord> {
    Ok(HistoryRecord {
      natural_key: NaturalKey::from_encoded(self.natural_key),
      occurred_at: decode_dt(&self.occurred_at)?,
      payload:     serde_json::from_str(&self.payload_json)?,
    })
  }
}

/// Raw strings read directly from a `dimensions` row.
pub struct RawDimension {
  pub kind:            String,
  pub key:             String,
  pub attributes_json: Option<String>,
  pub first_seen_at:   String,
  pub last_seen_at:    String,
}

impl RawDimension {
  pub fn into_stored(self) -> Result<StoredDimension> {
    let kind: DimensionKind = self.kind.parse()?;
    let attributes = self
      .attributes_json
      .as_deref()
      .map(serde_json::from_str)
      .transpose()?;

    Ok(StoredDimension {
      dimension:     Dimension { kind, key: self.key, attributes },
      first_seen_at: decode_dt(&self.first_seen_at)?,
      last_seen_at:  decode_dt(&self.last_seen_at)?,
    })
  }
}

/// Raw strings read directly from an `accounts` row.
pub struct RawAccount {
  pub account_id:    i64,
  pub currency_code: String,
  pub first_seen_at: String,
  pub last_seen_at:  String,
}

impl RawAccount {
  pub fn into_stored(self) -> Result<StoredAccount> {
    Ok(StoredAccount {
      account_id:    self.account_id,
      currency_code: self.currency_code,
      first_seen_at: decode_dt(&self.first_seen_at)?,
      last_seen_at:  decode_dt(&self.last_seen_at)?,
    })
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn timestamps_sort_as_text() {
    let whole = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 5).unwrap();
    let later = whole + chrono::Duration::milliseconds(250);
    assert_eq!(encode_dt(whole), "2024-03-01T12:00:05.000000Z");
    assert!(encode_dt(whole) < encode_dt(later));
    assert_eq!(decode_dt(&encode_dt(later)).unwrap(), later);
  }

  #[test]
  fn payload_hash_is_hex_sha256() {
    assert_eq!(
      payload_hash(""),
      "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
  }
}
