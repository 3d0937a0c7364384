//! Error type for `tally-t212`.

use tally_core::fetch::{FetchCause, FetchError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),

  #[error("GET {path} returned HTTP {status}")]
  Status { path: String, status: u16 },

  #[error("GET {path} rejected the credentials (HTTP {status})")]
  Unauthorized { path: String, status: u16 },

  #[error("could not decode {path}: {source}")]
  Decode {
    path:   String,
    #[source]
    source: serde_json::Error,
  },

  #[error("invalid url: {0}")]
  Url(String),

  #[error("core error: {0}")]
  Core(#[from] tally_core::Error),
}

impl Error {
  /// HTTP status of a rejected request, if that is what failed.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Status { status, .. } | Self::Unauthorized { status, .. } => Some(*status),
      Self::Http(e) => e.status().map(|s| s.as_u16()),
      _ => None,
    }
  }

  /// Classify for the engine's per-task failure list.
  pub fn into_fetch_error(self, endpoint: &str) -> FetchError {
    let cause = match self {
      Self::Http(e) => FetchCause::Transport(e.to_string()),
      Self::Status { status, .. } => FetchCause::Status(status),
      Self::Unauthorized { status, .. } => FetchCause::Unauthorized(status),
      other @ (Self::Decode { .. } | Self::Url(_) | Self::Core(_)) => {
        FetchCause::Parse(other.to_string())
      }
    };
    FetchError::new(endpoint, cause)
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
