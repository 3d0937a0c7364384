//! Task lists for each collection profile.

use clap::ValueEnum;
use tally_core::{
  record::{HistoryKind, SnapshotKind},
  sync::{CollectionTask, Policy},
};
use tally_t212::{
  ApiClient,
  fetchers::{
    CashFetcher, HistoryFetcher, MetadataFetcher, PendingOrdersFetcher, PiesFetcher,
    PositionsFetcher,
  },
};

use crate::settings::Settings;

/// Which endpoints a run collects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Profile {
  /// Snapshots plus new transactions and order fills, a few pages at most.
  #[default]
  Hourly,
  /// Everything, walking every history page, plus reference data.
  Full,
}

pub fn build_tasks(profile: Profile, client: &ApiClient, settings: &Settings) -> Vec<CollectionTask> {
  let paging = match profile {
    Profile::Hourly => settings.incremental_paging(),
    Profile::Full => settings.full_paging(),
  };

  let mut tasks = vec![
    CollectionTask::new(
      "account cash",
      Policy::Snapshot(SnapshotKind::AccountCash),
      CashFetcher::new(client.clone()),
    ),
    CollectionTask::new(
      "positions",
      Policy::Snapshot(SnapshotKind::Positions),
      PositionsFetcher::new(client.clone()),
    ),
    CollectionTask::new(
      "pending orders",
      Policy::Snapshot(SnapshotKind::PendingOrders),
      PendingOrdersFetcher::new(client.clone()),
    ),
    CollectionTask::new(
      "pies",
      Policy::Snapshot(SnapshotKind::PieAllocations),
      PiesFetcher::new(client.clone()),
    ),
    CollectionTask::new(
      "transactions",
      Policy::History(HistoryKind::Transaction),
      HistoryFetcher::transactions(client.clone(), paging),
    ),
    CollectionTask::new(
      "order fills",
      Policy::History(HistoryKind::OrderFill),
      HistoryFetcher::order_fills(client.clone(), paging),
    ),
  ];

  if profile == Profile::Full {
    tasks.extend([
      CollectionTask::new(
        "dividends",
        Policy::History(HistoryKind::Dividend),
        HistoryFetcher::dividends(client.clone(), paging),
      ),
      CollectionTask::new("exchanges", Policy::Reference, MetadataFetcher::exchanges(client.clone())),
      CollectionTask::new(
        "instruments",
        Policy::Reference,
        MetadataFetcher::instruments(client.clone()),
      ),
    ]);
  }

  tasks
}

#[cfg(test)]
mod tests {
  use tally_core::limiter::EndpointClass;
  use tally_t212::{ApiConfig, ApiEnvironment};

  use super::*;

  fn settings() -> Settings {
    serde_json::from_value(serde_json::json!({ "api_key": "k", "api_secret": "s" })).unwrap()
  }

  fn client() -> ApiClient {
    ApiClient::new(ApiConfig::new(ApiEnvironment::Demo, "k", "s")).unwrap()
  }

  fn labels(tasks: &[CollectionTask]) -> Vec<&str> {
    tasks.iter().map(|t| t.label.as_str()).collect()
  }

  #[test]
  fn hourly_collects_snapshots_and_recent_history() {
    let tasks = build_tasks(Profile::Hourly, &client(), &settings());
    assert_eq!(
      labels(&tasks),
      ["account cash", "positions", "pending orders", "pies", "transactions", "order fills"]
    );
    assert_eq!(tasks.iter().filter(|t| t.policy.is_snapshot()).count(), 4);
  }

  #[test]
  fn full_adds_dividends_and_reference_data() {
    let tasks = build_tasks(Profile::Full, &client(), &settings());
    assert_eq!(tasks.len(), 9);
    assert_eq!(labels(&tasks)[6..], ["dividends", "exchanges", "instruments"]);
    assert_eq!(tasks[6].policy, Policy::History(HistoryKind::Dividend));
    assert!(tasks[7..].iter().all(|t| t.policy == Policy::Reference));
  }

  #[test]
  fn fetchers_match_their_endpoints() {
    let tasks = build_tasks(Profile::Full, &client(), &settings());
    let endpoint = |label: &str| {
      let task = tasks.iter().find(|t| t.label == label).unwrap();
      (task.fetcher.endpoint().to_owned(), task.fetcher.class())
    };

    assert_eq!(endpoint("account cash"), ("equity/account/cash".into(), EndpointClass::Unrestricted));
    assert_eq!(endpoint("pies"), ("equity/pies".into(), EndpointClass::Restricted));
    assert_eq!(endpoint("order fills"), ("equity/history/orders".into(), EndpointClass::Restricted));
    assert_eq!(endpoint("instruments"), ("equity/metadata/instruments".into(), EndpointClass::Restricted));
  }
}
