//! The `PersistenceGateway` trait.
//!
//! The trait is implemented by storage backends (e.g. `tally-store-sqlite`).
//! The orchestrator depends on this abstraction, not on any concrete backend.
//!
//! Every operation is a single atomic unit against the store: on failure
//! nothing from that call is visible. Writes are idempotent by construction,
//! so re-running a whole cycle after a partial failure is always safe.

use std::{collections::HashSet, future::Future};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::record::{
  AccountContext, AccountId, Dimension, HistoryKind, HistoryRecord, NaturalKey, RawPage,
  SnapshotKind, SnapshotRow,
};

/// Abstraction over the durable store a cycle writes into.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes.
pub trait PersistenceGateway: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Cycle start ───────────────────────────────────────────────────────

  /// Make sure the account's dimension row exists (and is current) before
  /// any write refers to it.
  fn ensure_account(
    &self,
    account: AccountContext,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  // ── Snapshots ─────────────────────────────────────────────────────────

  /// Record `rows` as the snapshot of `kind` for `account_id` at
  /// `captured_at`, replacing any rows stored for that exact instant.
  ///
  /// Captures at other instants are never touched. Referenced dimensions are
  /// upserted in the same unit. Returns the number of rows written.
  fn replace(
    &self,
    kind: SnapshotKind,
    account_id: AccountId,
    captured_at: DateTime<Utc>,
    rows: Vec<SnapshotRow>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  // ── History ───────────────────────────────────────────────────────────

  /// Insert the records whose natural key is not yet stored for `kind`.
  ///
  /// Existing rows are never updated or deleted. Returns the number of rows
  /// actually inserted (0 when every key was already present).
  fn append_if_absent(
    &self,
    kind: HistoryKind,
    account_id: AccountId,
    records: Vec<HistoryRecord>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  /// Natural keys already stored for `kind` and `account_id`.
  fn known_keys(
    &self,
    kind: HistoryKind,
    account_id: AccountId,
  ) -> impl Future<Output = Result<HashSet<NaturalKey>, Self::Error>> + Send + '_;

  // ── Reference data ────────────────────────────────────────────────────

  /// Create or update each dimension in place. Returns the number upserted.
  fn upsert_dimensions(
    &self,
    dimensions: Vec<Dimension>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  // ── Staging ───────────────────────────────────────────────────────────

  /// Keep the raw response bodies of one task, tagged with the cycle that
  /// fetched them.
  fn stage_pages(
    &self,
    cycle_id: Uuid,
    account_id: AccountId,
    pages: Vec<RawPage>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;
}
