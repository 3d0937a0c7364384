//! Error types for `tally-core`.

use thiserror::Error;

use crate::record::AccountId;

#[derive(Debug, Error)]
pub enum Error {
  /// The cycle-start hook failed; no task was attempted.
  #[error("cycle could not start for account {account_id}: {source}")]
  CycleStart {
    account_id: AccountId,
    #[source]
    source:     Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("malformed {entity} payload: {source}")]
  Payload {
    entity: &'static str,
    #[source]
    source: serde_json::Error,
  },

  #[error("unknown entity set: {0:?}")]
  UnknownEntitySet(String),

  #[error("unknown history kind: {0:?}")]
  UnknownHistoryKind(String),

  #[error("unknown dimension kind: {0:?}")]
  UnknownDimensionKind(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
