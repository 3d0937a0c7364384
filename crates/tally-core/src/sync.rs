//! [`SyncOrchestrator`] runs one collection cycle for one account.
//!
//! Tasks run strictly one after another. Snapshot tasks go first so their
//! capture instants are not delayed behind the rate-limited queue; all other
//! tasks keep their declared order, so an interrupted cycle always leaves the
//! same completed prefix behind. A failing task is recorded and the cycle
//! moves on.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
  Error, Result,
  fetch::{EndpointFetcher, FetchContext, FetchError},
  gateway::PersistenceGateway,
  limiter::RateLimiter,
  record::{AccountContext, AccountId, HistoryKind, RecordSet, SnapshotKind},
};

// ─── Tasks ───────────────────────────────────────────────────────────────────

/// How a task's records are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", content = "kind", rename_all = "snake_case")]
pub enum Policy {
  /// Record a capture of the whole set.
  Snapshot(SnapshotKind),
  /// Append records not seen before.
  History(HistoryKind),
  /// Upsert reference dimensions.
  Reference,
}

impl Policy {
  pub fn is_snapshot(self) -> bool { matches!(self, Self::Snapshot(_)) }
}

impl fmt::Display for Policy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Snapshot(kind) => write!(f, "snapshot({kind})"),
      Self::History(kind) => write!(f, "history({kind})"),
      Self::Reference => f.write_str("reference"),
    }
  }
}

/// One unit of work in a cycle: a fetcher, the policy its output is persisted
/// under, and a label for reporting.
pub struct CollectionTask {
  pub label:   String,
  pub policy:  Policy,
  pub fetcher: Box<dyn EndpointFetcher>,
}

impl CollectionTask {
  pub fn new(
    label: impl Into<String>,
    policy: Policy,
    fetcher: impl EndpointFetcher + 'static,
  ) -> Self {
    Self { label: label.into(), policy, fetcher: Box::new(fetcher) }
  }
}

impl fmt::Debug for CollectionTask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CollectionTask")
      .field("label", &self.label)
      .field("policy", &self.policy)
      .field("endpoint", &self.fetcher.endpoint())
      .finish()
  }
}

// ─── Outcomes ────────────────────────────────────────────────────────────────

/// Why a single task failed.
#[derive(Debug, Error)]
pub enum TaskError {
  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error("storage unavailable: {0}")]
  StorageUnavailable(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("task declared {policy} but the fetcher produced a {found}")]
  PolicyMismatch { policy: Policy, found: String },
}

impl TaskError {
  fn storage<E>(err: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::StorageUnavailable(Box::new(err))
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
  pub label:     String,
  pub policy:    Policy,
  /// Records delivered by the fetcher.
  pub fetched:   usize,
  /// Records written by the store; for history, only the new ones.
  pub persisted: usize,
  pub api_calls: usize,
  pub elapsed:   Duration,
}

#[derive(Debug)]
pub struct TaskFailure {
  pub label:     String,
  pub policy:    Policy,
  pub error:     TaskError,
  pub api_calls: usize,
  pub elapsed:   Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
  Success,
  PartialFailure,
  Cancelled,
}

/// Aggregate of one cycle.
#[derive(Debug)]
pub struct CycleReport {
  /// Also the correlation id of every page staged during the cycle.
  pub cycle_id:   Uuid,
  pub account_id: AccountId,
  pub started_at: DateTime<Utc>,
  pub duration:   Duration,
  pub api_calls:  usize,
  pub outcomes:   Vec<TaskOutcome>,
  pub failures:   Vec<TaskFailure>,
  /// Labels of tasks not started because the cycle was cancelled.
  pub skipped:    Vec<String>,
  pub cancelled:  bool,
}

impl CycleReport {
  fn new(account_id: AccountId) -> Self {
    Self {
      cycle_id: Uuid::new_v4(),
      account_id,
      started_at: Utc::now(),
      duration: Duration::ZERO,
      api_calls: 0,
      outcomes: Vec::new(),
      failures: Vec::new(),
      skipped: Vec::new(),
      cancelled: false,
    }
  }

  pub fn status(&self) -> CycleStatus {
    if !self.failures.is_empty() {
      CycleStatus::PartialFailure
    } else if self.cancelled {
      CycleStatus::Cancelled
    } else {
      CycleStatus::Success
    }
  }

  pub fn is_success(&self) -> bool { self.status() == CycleStatus::Success }

  /// Number of snapshot sets recorded.
  pub fn snapshot_writes(&self) -> usize {
    self.outcomes.iter().filter(|o| o.policy.is_snapshot()).count()
  }

  /// History rows inserted across all history tasks.
  pub fn new_history_rows(&self) -> usize {
    self
      .outcomes
      .iter()
      .filter(|o| matches!(o.policy, Policy::History(_)))
      .map(|o| o.persisted)
      .sum()
  }

  pub fn outcome_for(&self, label: &str) -> Option<&TaskOutcome> {
    self.outcomes.iter().find(|o| o.label == label)
  }

  pub fn failure_for(&self, label: &str) -> Option<&TaskFailure> {
    self.failures.iter().find(|f| f.label == label)
  }
}

// ─── Orchestrator ────────────────────────────────────────────────────────────

/// Drives collection cycles for one account.
///
/// Owns the account's [`RateLimiter`], so pacing carries over between cycles
/// run by the same orchestrator.
pub struct SyncOrchestrator<G> {
  gateway: G,
  limiter: RateLimiter,
}

impl<G: PersistenceGateway> SyncOrchestrator<G> {
  pub fn new(gateway: G, limiter: RateLimiter) -> Self { Self { gateway, limiter } }

  pub fn gateway(&self) -> &G { &self.gateway }

  pub fn limiter(&self) -> &RateLimiter { &self.limiter }

  /// Run one cycle over `tasks`.
  ///
  /// Returns `Err` only when the cycle cannot start. Task failures are
  /// reported in [`CycleReport::failures`].
  pub async fn run_cycle(
    &self,
    account: &AccountContext,
    mut tasks: Vec<CollectionTask>,
    cancel: &CancellationToken,
  ) -> Result<CycleReport> {
    let started = Instant::now();
    let mut report = CycleReport::new(account.account_id);

    self
      .gateway
      .ensure_account(account.clone())
      .await
      .map_err(|e| Error::CycleStart { account_id: account.account_id, source: Box::new(e) })?;

    // Stable: relative order within each group is preserved.
    tasks.sort_by_key(|task| !task.policy.is_snapshot());

    tracing::info!(
      cycle_id = %report.cycle_id,
      account_id = account.account_id,
      tasks = tasks.len(),
      "starting collection cycle"
    );

    let total = tasks.len();
    for (index, task) in tasks.into_iter().enumerate() {
      if cancel.is_cancelled() {
        if !report.cancelled {
          tracing::warn!("cycle cancelled; skipping remaining tasks");
          report.cancelled = true;
        }
        report.skipped.push(task.label);
        continue;
      }

      tracing::info!("[{}/{}] collecting {}", index + 1, total, task.label);
      let task_started = Instant::now();
      let (calls, result) = self.run_task(report.cycle_id, account, &task).await;
      let elapsed = task_started.elapsed();
      report.api_calls += calls;

      match result {
        Ok((fetched, persisted)) => {
          tracing::info!(
            label = %task.label,
            fetched,
            persisted,
            api_calls = calls,
            elapsed_ms = elapsed.as_millis() as u64,
            "task complete"
          );
          report.outcomes.push(TaskOutcome {
            label: task.label,
            policy: task.policy,
            fetched,
            persisted,
            api_calls: calls,
            elapsed,
          });
        }
        Err(error) => {
          tracing::warn!(label = %task.label, %error, "task failed");
          report.failures.push(TaskFailure {
            label: task.label,
            policy: task.policy,
            error,
            api_calls: calls,
            elapsed,
          });
        }
      }
    }

    report.duration = started.elapsed();
    tracing::info!(
      cycle_id = %report.cycle_id,
      status = ?report.status(),
      api_calls = report.api_calls,
      snapshot_writes = report.snapshot_writes(),
      new_history_rows = report.new_history_rows(),
      failures = report.failures.len(),
      duration_ms = report.duration.as_millis() as u64,
      "collection cycle finished"
    );

    Ok(report)
  }

  /// Fetch and persist one task. Returns the API calls made alongside the
  /// `(fetched, persisted)` counts, so calls are accounted for on failure too.
  async fn run_task(
    &self,
    cycle_id: Uuid,
    account: &AccountContext,
    task: &CollectionTask,
  ) -> (usize, Result<(usize, usize), TaskError>) {
    let known = match task.policy {
      Policy::History(kind) => match self.gateway.known_keys(kind, account.account_id).await {
        Ok(keys) => Some(keys),
        Err(e) => return (0, Err(TaskError::storage(e))),
      },
      _ => None,
    };

    let cx = FetchContext::new(&self.limiter, task.fetcher.class(), account)
      .with_known_keys(known.as_ref());
    let result = self.collect(cycle_id, &cx, task).await;
    (cx.pacer.calls(), result)
  }

  async fn collect(
    &self,
    cycle_id: Uuid,
    cx: &FetchContext<'_>,
    task: &CollectionTask,
  ) -> Result<(usize, usize), TaskError> {
    let account_id = cx.account.account_id;
    let called_at = Utc::now();
    let fetched = task.fetcher.fetch(cx).await?;
    let count = fetched.records.len();

    if !fetched.pages.is_empty() {
      self
        .gateway
        .stage_pages(cycle_id, account_id, fetched.pages)
        .await
        .map_err(TaskError::storage)?;
    }

    let persisted = match (task.policy, fetched.records) {
      (Policy::Snapshot(kind), RecordSet::Snapshot(set)) if set.kind == kind => {
        let captured_at = set.captured_at.unwrap_or(called_at);
        self
          .gateway
          .replace(kind, account_id, captured_at, set.rows)
          .await
          .map_err(TaskError::storage)?
      }
      (Policy::History(kind), RecordSet::History(batch)) if batch.kind == kind => self
        .gateway
        .append_if_absent(kind, account_id, batch.records)
        .await
        .map_err(TaskError::storage)?,
      (Policy::Reference, RecordSet::Reference(dimensions)) => self
        .gateway
        .upsert_dimensions(dimensions)
        .await
        .map_err(TaskError::storage)?,
      (policy, records) => {
        return Err(TaskError::PolicyMismatch { policy, found: records.describe() });
      }
    };

    Ok((count, persisted))
  }
}
