//! The fetch contract: what the engine needs from an API endpoint.
//!
//! A fetcher performs one logical collection. It may issue several API calls
//! (pagination, per-item detail calls) but every call goes through the
//! [`Pacer`] it is handed, so the rate budget and the call count stay with the
//! engine.

use std::{
  collections::HashSet,
  future::Future,
  sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
  limiter::{EndpointClass, RateLimiter},
  record::{AccountContext, NaturalKey, RawPage, RecordSet},
};

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Why a fetch failed.
#[derive(Debug, Error)]
pub enum FetchCause {
  #[error("transport error: {0}")]
  Transport(String),

  #[error("authentication rejected (HTTP {0})")]
  Unauthorized(u16),

  #[error("unexpected HTTP status {0}")]
  Status(u16),

  #[error("could not parse response: {0}")]
  Parse(String),
}

#[derive(Debug, Error)]
#[error("fetch from {endpoint} failed: {cause}")]
pub struct FetchError {
  pub endpoint: String,
  #[source]
  pub cause:    FetchCause,
}

impl FetchError {
  pub fn new(endpoint: impl Into<String>, cause: FetchCause) -> Self {
    Self { endpoint: endpoint.into(), cause }
  }
}

// ─── Output ──────────────────────────────────────────────────────────────────

/// The result of a successful fetch.
#[derive(Debug, Clone)]
pub struct Fetched {
  pub records: RecordSet,
  /// Response bodies as received, in call order.
  pub pages:   Vec<RawPage>,
}

impl Fetched {
  pub fn new(records: RecordSet) -> Self { Self { records, pages: Vec::new() } }

  pub fn with_pages(mut self, pages: Vec<RawPage>) -> Self {
    self.pages = pages;
    self
  }
}

// ─── Pacing ──────────────────────────────────────────────────────────────────

/// Gate for the API calls of one task: admits each call through the rate
/// limiter under the task's endpoint class and counts it.
pub struct Pacer<'a> {
  limiter: &'a RateLimiter,
  class:   EndpointClass,
  calls:   AtomicUsize,
}

impl<'a> Pacer<'a> {
  pub fn new(limiter: &'a RateLimiter, class: EndpointClass) -> Self {
    Self { limiter, class, calls: AtomicUsize::new(0) }
  }

  /// Run one API call. The permit is held until `call` resolves, so the
  /// limiter measures spacing from the call's completion.
  pub async fn call<F, Fut, T>(&self, call: F) -> T
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
  {
    let _permit = self.limiter.acquire(self.class).await;
    let output = call().await;
    self.calls.fetch_add(1, Ordering::Relaxed);
    output
  }

  pub fn class(&self) -> EndpointClass { self.class }

  /// Calls made so far, successful or not.
  pub fn calls(&self) -> usize { self.calls.load(Ordering::Relaxed) }
}

/// Everything a fetcher may use while collecting.
pub struct FetchContext<'a> {
  pub pacer:   Pacer<'a>,
  pub account: &'a AccountContext,
  known_keys:  Option<&'a HashSet<NaturalKey>>,
}

impl<'a> FetchContext<'a> {
  pub fn new(limiter: &'a RateLimiter, class: EndpointClass, account: &'a AccountContext) -> Self {
    Self { pacer: Pacer::new(limiter, class), account, known_keys: None }
  }

  /// Attach the natural keys already stored for a history task.
  pub fn with_known_keys(mut self, keys: Option<&'a HashSet<NaturalKey>>) -> Self {
    self.known_keys = keys;
    self
  }

  /// Whether the store is known to hold `key`. Always `false` when no keys
  /// were attached.
  pub fn is_known(&self, key: &NaturalKey) -> bool {
    self.known_keys.is_some_and(|keys| keys.contains(key))
  }

  pub fn has_known_keys(&self) -> bool { self.known_keys.is_some() }
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// One endpoint collection, treated by the engine as a black box.
///
/// Object-safe so a cycle can hold a heterogeneous, ordered task list.
#[async_trait]
pub trait EndpointFetcher: Send + Sync {
  /// API path used in logs, errors and raw-page staging.
  fn endpoint(&self) -> &str;

  fn class(&self) -> EndpointClass;

  async fn fetch(&self, cx: &FetchContext<'_>) -> Result<Fetched, FetchError>;
}
