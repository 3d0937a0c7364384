//! Request pacing per endpoint class.
//!
//! The brokerage caps its restricted endpoints at a fixed number of requests
//! per rolling minute. Rather than tracking a window, the limiter enforces the
//! equivalent fixed spacing between consecutive restricted calls, measured
//! from the moment the previous call *returned*.

use std::{num::NonZeroU32, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{
  sync::{Mutex, MutexGuard},
  time::{Instant, sleep_until},
};

/// Requests per minute the brokerage allows on its restricted endpoints.
pub const DEFAULT_RESTRICTED_PER_MINUTE: u32 = 6;

/// Whether calls to an endpoint count against the request budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
  /// Account, portfolio and order snapshots; never delayed.
  Unrestricted,
  /// Capped endpoints (history, pies, metadata).
  Restricted,
}

/// Paces restricted calls for one account.
///
/// State is the completion instant of the last restricted call and lives as
/// long as the limiter does. Restricted permits are handed out one at a time:
/// while a [`Permit`] is alive, other restricted callers wait behind it, so
/// every wait is computed against a single ordered timeline.
#[derive(Debug)]
pub struct RateLimiter {
  min_spacing:    Duration,
  last_completed: Mutex<Option<Instant>>,
}

impl RateLimiter {
  /// Allow `requests` restricted calls per 60-second window.
  pub fn per_minute(requests: NonZeroU32) -> Self {
    Self::with_spacing(Duration::from_secs(60) / requests.get())
  }

  pub fn with_spacing(min_spacing: Duration) -> Self {
    Self { min_spacing, last_completed: Mutex::new(None) }
  }

  pub fn min_spacing(&self) -> Duration { self.min_spacing }

  /// Wait until a call of `class` may start.
  ///
  /// The returned permit must be held for the duration of the call; dropping
  /// it marks the call as completed.
  pub async fn acquire(&self, class: EndpointClass) -> Permit<'_> {
    if class == EndpointClass::Unrestricted {
      return Permit { slot: None };
    }

    let slot = self.last_completed.lock().await;
    if let Some(last) = *slot {
      let ready_at = last + self.min_spacing;
      if ready_at > Instant::now() {
        tracing::info!(
          wait_ms = (ready_at - Instant::now()).as_millis() as u64,
          "pacing restricted request"
        );
        sleep_until(ready_at).await;
      }
      debug_assert!(
        Instant::now() >= ready_at,
        "rate limit violated: restricted call admitted before spacing elapsed",
      );
    }

    Permit { slot: Some(slot) }
  }
}

impl Default for RateLimiter {
  fn default() -> Self {
    Self::per_minute(NonZeroU32::new(DEFAULT_RESTRICTED_PER_MINUTE).unwrap_or(NonZeroU32::MIN))
  }
}

/// Admission to make one call. Records the completion instant on drop.
#[must_use = "the permit must be held until the call completes"]
pub struct Permit<'a> {
  slot: Option<MutexGuard<'a, Option<Instant>>>,
}

impl Drop for Permit<'_> {
  fn drop(&mut self) {
    if let Some(slot) = self.slot.as_mut() {
      **slot = Some(Instant::now());
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;

  fn limiter() -> RateLimiter { RateLimiter::per_minute(NonZeroU32::new(6).unwrap()) }

  #[test]
  fn six_per_minute_is_ten_second_spacing() {
    assert_eq!(limiter().min_spacing(), Duration::from_secs(10));
  }

  #[tokio::test(start_paused = true)]
  async fn first_restricted_call_does_not_wait() {
    let limiter = limiter();
    let start = Instant::now();
    drop(limiter.acquire(EndpointClass::Restricted).await);
    assert_eq!(start.elapsed(), Duration::ZERO);
  }

  #[tokio::test(start_paused = true)]
  async fn consecutive_restricted_calls_are_spaced_from_completion() {
    let limiter = limiter();

    let permit = limiter.acquire(EndpointClass::Restricted).await;
    // The call itself takes three seconds.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let first_done = Instant::now();
    drop(permit);

    drop(limiter.acquire(EndpointClass::Restricted).await);
    assert_eq!(Instant::now() - first_done, Duration::from_secs(10));
  }

  #[tokio::test(start_paused = true)]
  async fn no_wait_once_spacing_has_already_elapsed() {
    let limiter = limiter();
    drop(limiter.acquire(EndpointClass::Restricted).await);

    tokio::time::sleep(Duration::from_secs(30)).await;
    let before = Instant::now();
    drop(limiter.acquire(EndpointClass::Restricted).await);
    assert_eq!(before.elapsed(), Duration::ZERO);
  }

  #[tokio::test(start_paused = true)]
  async fn unrestricted_calls_never_wait() {
    let limiter = limiter();
    drop(limiter.acquire(EndpointClass::Restricted).await);

    let start = Instant::now();
    for _ in 0..5 {
      drop(limiter.acquire(EndpointClass::Unrestricted).await);
    }
    assert_eq!(start.elapsed(), Duration::ZERO);
  }

  #[tokio::test(start_paused = true)]
  async fn concurrent_callers_complete_at_least_spacing_apart() {
    let limiter = Arc::new(limiter());
    let mut handles = Vec::new();

    for _ in 0..4 {
      let limiter = Arc::clone(&limiter);
      handles.push(tokio::spawn(async move {
        let permit = limiter.acquire(EndpointClass::Restricted).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        let done = Instant::now();
        drop(permit);
        done
      }));
    }

    let mut completions = Vec::new();
    for handle in handles {
      completions.push(handle.await.unwrap());
    }
    completions.sort();

    for pair in completions.windows(2) {
      assert!(pair[1] - pair[0] >= Duration::from_secs(10));
    }
  }
}
