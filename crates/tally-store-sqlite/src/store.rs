//! [`SqliteStore`]: the SQLite implementation of [`PersistenceGateway`].

use std::{collections::HashSet, path::Path};

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension as _;
use serde::Serialize;
use uuid::Uuid;

use tally_core::{
  gateway::PersistenceGateway,
  record::{
    AccountContext, AccountId, Dimension, DimensionKind, HistoryKind, HistoryRecord, NaturalKey,
    RawPage, SnapshotKind, SnapshotRow,
  },
};

use crate::{
  Error, Result,
  encode::{
    EncodedDimension, RawAccount, RawDimension, RawHistoryRecord, RawSnapshotRow, decode_dt,
    encode_dt, encode_uuid, payload_hash,
  },
  schema::SCHEMA,
};

// ─── Read models ─────────────────────────────────────────────────────────────

/// One capture of a snapshot set as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredSnapshot {
  pub kind:        SnapshotKind,
  pub account_id:  AccountId,
  pub captured_at: DateTime<Utc>,
  pub rows:        Vec<SnapshotRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredDimension {
  pub dimension:     Dimension,
  pub first_seen_at: DateTime<Utc>,
  pub last_seen_at:  DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredAccount {
  pub account_id:    AccountId,
  pub currency_code: String,
  pub first_seen_at: DateTime<Utc>,
  pub last_seen_at:  DateTime<Utc>,
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Tally store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Snapshot reads ────────────────────────────────────────────────────────

  /// The capture with the greatest `captured_at`: the current state of the
  /// set for that account.
  pub async fn latest_snapshot(
    &self,
    kind: SnapshotKind,
    account_id: AccountId,
  ) -> Result<Option<StoredSnapshot>> {
    let kind_str = kind.as_str();

    let latest: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          "SELECT MAX(captured_at) FROM snapshot_captures
           WHERE entity_set = ?1 AND account_id = ?2",
          rusqlite::params![kind_str, account_id],
          |row| row.get(0),
        )?)
      })
      .await?;

    match latest {
      Some(at) => self.snapshot_at(kind, account_id, decode_dt(&at)?).await,
      None => Ok(None),
    }
  }

  /// The capture recorded for exactly `captured_at`, if any.
  pub async fn snapshot_at(
    &self,
    kind: SnapshotKind,
    account_id: AccountId,
    captured_at: DateTime<Utc>,
  ) -> Result<Option<StoredSnapshot>> {
    let kind_str = kind.as_str();
    let at_str = encode_dt(captured_at);

    let raws: Option<Vec<RawSnapshotRow>> = self
      .conn
      .call(move |conn| {
        let exists = conn
          .query_row(
            "SELECT 1 FROM snapshot_captures
             WHERE entity_set = ?1 AND account_id = ?2 AND captured_at = ?3",
            rusqlite::params![kind_str, account_id, at_str],
            |_| Ok(()),
          )
          .optional()?
          .is_some();

        if !exists {
          return Ok(None);
        }

        let mut stmt = conn.prepare(
          "SELECT row_key, references_json, fields_json FROM snapshot_rows
           WHERE entity_set = ?1 AND account_id = ?2 AND captured_at = ?3
           ORDER BY row_key",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![kind_str, account_id, at_str], |row| {
            Ok(RawSnapshotRow {
              row_key:         row.get(0)?,
              references_json: row.get(1)?,
              fields_json:     row.get(2)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Some(rows))
      })
      .await?;

    let Some(raws) = raws else {
      return Ok(None);
    };

    let rows = raws
      .into_iter()
      .map(RawSnapshotRow::into_row)
      .collect::<Result<_>>()?;

    Ok(Some(StoredSnapshot { kind, account_id, captured_at, rows }))
  }

  /// Every capture instant recorded for a set, oldest first.
  pub async fn capture_instants(
    &self,
    kind: SnapshotKind,
    account_id: AccountId,
  ) -> Result<Vec<DateTime<Utc>>> {
    let kind_str = kind.as_str();

    let raws: Vec<String> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT captured_at FROM snapshot_captures
           WHERE entity_set = ?1 AND account_id = ?2
           ORDER BY captured_at",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![kind_str, account_id], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
      })
      .await?;

    raws.iter().map(|s| decode_dt(s)).collect()
  }

  // ── History reads ─────────────────────────────────────────────────────────

  /// All history records of `kind` for an account, oldest event first.
  pub async fn history(
    &self,
    kind: HistoryKind,
    account_id: AccountId,
  ) -> Result<Vec<HistoryRecord>> {
    let kind_str = kind.as_str();

    let raws: Vec<RawHistoryRecord> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT natural_key, occurred_at, payload_json FROM history_records
           WHERE kind = ?1 AND account_id = ?2
           ORDER BY occurred_at, natural_key",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![kind_str, account_id], |row| {
            Ok(RawHistoryRecord {
              natural_key:  row.get(0)?,
              occurred_at:  row.get(1)?,
              payload_json: row.get(2)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawHistoryRecord::into_record).collect()
  }

  pub async fn history_count(&self, kind: HistoryKind) -> Result<usize> {
    let kind_str = kind.as_str();

    let count: i64 = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          "SELECT COUNT(*) FROM history_records WHERE kind = ?1",
          rusqlite::params![kind_str],
          |row| row.get(0),
        )?)
      })
      .await?;

    Ok(count as usize)
  }

  // ── Reference reads ───────────────────────────────────────────────────────

  pub async fn dimension(
    &self,
    kind: DimensionKind,
    key: impl Into<String>,
  ) -> Result<Option<StoredDimension>> {
    let kind_str = kind.as_str();
    let key = key.into();

    let raw: Option<RawDimension> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT kind, key, attributes_json, first_seen_at, last_seen_at
             FROM dimensions WHERE kind = ?1 AND key = ?2",
            rusqlite::params![kind_str, key],
            |row| {
              Ok(RawDimension {
                kind:            row.get(0)?,
                key:             row.get(1)?,
                attributes_json: row.get(2)?,
                first_seen_at:   row.get(3)?,
                last_seen_at:    row.get(4)?,
              })
            },
          )
          .optional()?)
      })
      .await?;

    raw.map(RawDimension::into_stored).transpose()
  }

  pub async fn account(&self, account_id: AccountId) -> Result<Option<StoredAccount>> {
    let raw: Option<RawAccount> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT account_id, currency_code, first_seen_at, last_seen_at
             FROM accounts WHERE account_id = ?1",
            rusqlite::params![account_id],
            |row| {
              Ok(RawAccount {
                account_id:    row.get(0)?,
                currency_code: row.get(1)?,
                first_seen_at: row.get(2)?,
                last_seen_at:  row.get(3)?,
              })
            },
          )
          .optional()?)
      })
      .await?;

    raw.map(RawAccount::into_stored).transpose()
  }

  /// Number of staged pages, optionally limited to one cycle.
  pub async fn staged_page_count(&self, cycle_id: Option<Uuid>) -> Result<usize> {
    let cycle_str = cycle_id.map(encode_uuid);

    let count: i64 = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          "SELECT COUNT(*) FROM raw_pages WHERE ?1 IS NULL OR cycle_id = ?1",
          rusqlite::params![cycle_str],
          |row| row.get(0),
        )?)
      })
      .await?;

    Ok(count as usize)
  }
}

/// Insert or refresh one dimension. Attributes are only replaced when the new
/// sighting carries them.
fn upsert_dimension(
  conn: &rusqlite::Connection,
  dim: &EncodedDimension,
  seen_at: &str,
) -> rusqlite::Result<usize> {
  conn.execute(
    "INSERT INTO dimensions (kind, key, attributes_json, first_seen_at, last_seen_at)
     VALUES (?1, ?2, ?3, ?4, ?4)
     ON CONFLICT (kind, key) DO UPDATE SET
       attributes_json = COALESCE(excluded.attributes_json, dimensions.attributes_json),
       last_seen_at    = excluded.last_seen_at",
    rusqlite::params![dim.kind, dim.key, dim.attributes_json, seen_at],
  )
}

// ─── PersistenceGateway impl ─────────────────────────────────────────────────

impl PersistenceGateway for SqliteStore {
  type Error = Error;

  async fn ensure_account(&self, account: AccountContext) -> Result<()> {
    let now_str = encode_dt(Utc::now());

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO accounts (account_id, currency_code, first_seen_at, last_seen_at)
           VALUES (?1, ?2, ?3, ?3)
           ON CONFLICT (account_id) DO UPDATE SET
             currency_code = excluded.currency_code,
             last_seen_at  = excluded.last_seen_at",
          rusqlite::params![account.account_id, account.currency_code, now_str],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Snapshots ─────────────────────────────────────────────────────────────

  async fn replace(
    &self,
    kind: SnapshotKind,
    account_id: AccountId,
    captured_at: DateTime<Utc>,
    rows: Vec<SnapshotRow>,
  ) -> Result<usize> {
    let kind_str = kind.as_str();
    let at_str = encode_dt(captured_at);
    let now_str = encode_dt(Utc::now());

    let mut encoded = Vec::with_capacity(rows.len());
    let mut references = Vec::new();
    for row in &rows {
      encoded.push((
        row.key.clone(),
        serde_json::to_string(&row.references)?,
        serde_json::to_string(&row.fields)?,
      ));
      for dim in &row.references {
        references.push(EncodedDimension::encode(dim)?);
      }
    }

    let stored: i64 = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        tx.execute(
          "INSERT INTO snapshot_captures (entity_set, account_id, captured_at, row_count, written_at)
           VALUES (?1, ?2, ?3, 0, ?4)
           ON CONFLICT (entity_set, account_id, captured_at) DO UPDATE SET
             written_at = excluded.written_at",
          rusqlite::params![kind_str, account_id, at_str, now_str],
        )?;

        tx.execute(
          "DELETE FROM snapshot_rows
           WHERE entity_set = ?1 AND account_id = ?2 AND captured_at = ?3",
          rusqlite::params![kind_str, account_id, at_str],
        )?;

        {
          // A key repeated within one delivery keeps its last occurrence.
          let mut stmt = tx.prepare(
            "INSERT OR REPLACE INTO snapshot_rows
               (entity_set, account_id, captured_at, row_key, references_json, fields_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
          )?;
          for (key, references_json, fields_json) in &encoded {
            stmt.execute(rusqlite::params![
              kind_str,
              account_id,
              at_str,
              key,
              references_json,
              fields_json,
            ])?;
          }
        }

        for dim in &references {
          upsert_dimension(&tx, dim, &now_str)?;
        }

        let stored: i64 = tx.query_row(
          "SELECT COUNT(*) FROM snapshot_rows
           WHERE entity_set = ?1 AND account_id = ?2 AND captured_at = ?3",
          rusqlite::params![kind_str, account_id, at_str],
          |row| row.get(0),
        )?;
        tx.execute(
          "UPDATE snapshot_captures SET row_count = ?4
           WHERE entity_set = ?1 AND account_id = ?2 AND captured_at = ?3",
          rusqlite::params![kind_str, account_id, at_str, stored],
        )?;

        tx.commit()?;
        Ok(stored)
      })
      .await?;

    tracing::debug!(entity_set = kind_str, account_id, rows = stored, "snapshot recorded");
    Ok(stored as usize)
  }

  // ── History ───────────────────────────────────────────────────────────────

  async fn append_if_absent(
    &self,
    kind: HistoryKind,
    account_id: AccountId,
    records: Vec<HistoryRecord>,
  ) -> Result<usize> {
    let kind_str = kind.as_str();
    let now_str = encode_dt(Utc::now());

    let encoded = records
      .iter()
      .map(|r| -> Result<_> {
        Ok((
          r.natural_key.as_str().to_owned(),
          encode_dt(r.occurred_at),
          serde_json::to_string(&r.payload)?,
        ))
      })
      .collect::<Result<Vec<_>>>()?;

    let inserted = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
          let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO history_records
               (kind, natural_key, account_id, occurred_at, payload_json, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
          )?;
          for (key, occurred_at, payload_json) in &encoded {
            inserted += stmt.execute(rusqlite::params![
              kind_str,
              key,
              account_id,
              occurred_at,
              payload_json,
              now_str,
            ])?;
          }
        }
        tx.commit()?;
        Ok(inserted)
      })
      .await?;

    tracing::debug!(kind = kind_str, account_id, inserted, "history appended");
    Ok(inserted)
  }

  async fn known_keys(
    &self,
    kind: HistoryKind,
    account_id: AccountId,
  ) -> Result<HashSet<NaturalKey>> {
    let kind_str = kind.as_str();

    let keys: Vec<String> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT natural_key FROM history_records WHERE kind = ?1 AND account_id = ?2",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![kind_str, account_id], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
      })
      .await?;

    Ok(keys.into_iter().map(NaturalKey::from_encoded).collect())
  }

  // ── Reference data ────────────────────────────────────────────────────────

  async fn upsert_dimensions(&self, dimensions: Vec<Dimension>) -> Result<usize> {
    let now_str = encode_dt(Utc::now());
    let encoded = dimensions
      .iter()
      .map(EncodedDimension::encode)
      .collect::<Result<Vec<_>>>()?;

    let count = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut count = 0;
        for dim in &encoded {
          count += upsert_dimension(&tx, dim, &now_str)?;
        }
        tx.commit()?;
        Ok(count)
      })
      .await?;

    Ok(count)
  }

  // ── Staging ───────────────────────────────────────────────────────────────

  async fn stage_pages(
    &self,
    cycle_id: Uuid,
    account_id: AccountId,
    pages: Vec<RawPage>,
  ) -> Result<usize> {
    let cycle_str = encode_uuid(cycle_id);

    let encoded = pages
      .iter()
      .map(|page| -> Result<_> {
        let payload_json = serde_json::to_string(&page.body)?;
        Ok((
          page.endpoint.clone(),
          encode_dt(page.fetched_at),
          payload_hash(&payload_json),
          payload_json,
        ))
      })
      .collect::<Result<Vec<_>>>()?;

    let staged = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut staged = 0;
        {
          let mut stmt = tx.prepare(
            "INSERT INTO raw_pages
               (endpoint, account_id, cycle_id, fetched_at, payload_hash, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
          )?;
          for (endpoint, fetched_at, hash, payload_json) in &encoded {
            staged += stmt.execute(rusqlite::params![
              endpoint,
              account_id,
              cycle_str,
              fetched_at,
              hash,
              payload_json,
            ])?;
          }
        }
        tx.commit()?;
        Ok(staged)
      })
      .await?;

    Ok(staged)
  }
}
