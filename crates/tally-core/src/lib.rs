//! Core types and the synchronization engine for Tally.
//!
//! This crate is deliberately free of HTTP and database dependencies. The
//! brokerage client (`tally-t212`) and the storage backend
//! (`tally-store-sqlite`) plug in through the [`fetch::EndpointFetcher`] and
//! [`gateway::PersistenceGateway`] traits.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod error;
pub mod fetch;
pub mod gateway;
pub mod limiter;
pub mod record;
pub mod sync;

pub use error::{Error, Result};
