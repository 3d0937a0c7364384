//! Trading 212 public API client for Tally.
//!
//! [`ApiClient`] speaks HTTP; [`fetchers`] turn endpoint responses into
//! [`tally_core::record::RecordSet`]s the orchestrator can persist.

pub mod client;
pub mod error;
pub mod fetchers;
pub mod pagination;
pub mod payload;

pub use client::{ApiClient, ApiConfig, ApiEnvironment};
pub use error::{Error, Result};
