//! `tally`: collects a Trading 212 account into a local SQLite store.
//!
//! # Usage
//!
//! ```
//! tally sync                      # hourly profile
//! tally --config ~/.config/tally/tally.toml sync --profile full
//! tally show positions
//! ```
//!
//! Exit status: `0` success, `1` partial failure or cancelled, `2` fatal.

mod settings;
mod tasks;

use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use settings::Settings;
use tally_core::{
  record::{AccountId, SnapshotKind},
  sync::{CycleReport, CycleStatus, SyncOrchestrator},
};
use tally_store_sqlite::SqliteStore;
use tally_t212::ApiClient;
use tasks::Profile;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

const EXIT_PARTIAL: u8 = 1;
const EXIT_FATAL: u8 = 2;

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tally", version, about = "Trading 212 account collector")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, value_name = "FILE", default_value = "tally.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run one collection cycle.
  Sync {
    #[arg(long, value_enum, default_value_t = Profile::Hourly)]
    profile: Profile,
  },
  /// Print the latest capture of a snapshot set as JSON.
  Show {
    /// `account_cash`, `positions`, `pending_orders` or `pie_allocations`.
    set: String,

    /// Account to show; defaults to the one the API credentials belong to.
    #[arg(long)]
    account: Option<AccountId>,
  },
}

// ─── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let result = match cli.command {
    Command::Sync { profile } => sync(&cli.config, profile).await,
    Command::Show { set, account } => show(&cli.config, &set, account).await,
  };

  match result {
    Ok(code) => ExitCode::from(code),
    Err(e) => {
      tracing::error!("{e:#}");
      ExitCode::from(EXIT_FATAL)
    }
  }
}

// ─── Commands ─────────────────────────────────────────────────────────────────

async fn sync(config: &std::path::Path, profile: Profile) -> Result<u8> {
  let settings = Settings::load(config)?;
  let client = ApiClient::new(settings.api_config()?).context("failed to build API client")?;

  let account = client
    .account_info()
    .await
    .context("failed to resolve the account from equity/account/info")?;
  tracing::info!(account_id = account.account_id, currency = %account.currency_code, "account resolved");

  let store = SqliteStore::open(&settings.store_path)
    .await
    .with_context(|| format!("failed to open store at {:?}", settings.store_path))?;

  let cancel = CancellationToken::new();
  tokio::spawn({
    let cancel = cancel.clone();
    async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("interrupt received; stopping after the current task");
        cancel.cancel();
      }
    }
  });

  let orchestrator = SyncOrchestrator::new(store, settings.limiter()?);
  let tasks = tasks::build_tasks(profile, &client, &settings);
  tracing::info!(?profile, tasks = tasks.len(), "collection profile selected");

  let report = orchestrator
    .run_cycle(&account, tasks, &cancel)
    .await
    .context("collection cycle could not start")?;

  log_report(&report);
  Ok(exit_code(report.status()))
}

async fn show(config: &std::path::Path, set: &str, account: Option<AccountId>) -> Result<u8> {
  let settings = Settings::load(config)?;
  let kind: SnapshotKind = set.parse()?;

  let account_id = match account {
    Some(id) => id,
    None => {
      let client = ApiClient::new(settings.api_config()?)?;
      client.account_info().await.context("failed to resolve the account")?.account_id
    }
  };

  let store = SqliteStore::open(&settings.store_path)
    .await
    .with_context(|| format!("failed to open store at {:?}", settings.store_path))?;

  match store.latest_snapshot(kind, account_id).await? {
    Some(snapshot) => {
      println!("{}", serde_json::to_string_pretty(&snapshot)?);
      Ok(0)
    }
    None => {
      tracing::warn!(%kind, account_id, "no capture recorded");
      Ok(EXIT_PARTIAL)
    }
  }
}

// ─── Reporting ────────────────────────────────────────────────────────────────

fn log_report(report: &CycleReport) {
  for outcome in &report.outcomes {
    tracing::info!(
      label = %outcome.label,
      policy = %outcome.policy,
      fetched = outcome.fetched,
      persisted = outcome.persisted,
      api_calls = outcome.api_calls,
      "collected"
    );
  }
  for failure in &report.failures {
    tracing::error!(label = %failure.label, policy = %failure.policy, error = %failure.error, "failed");
  }
  if !report.skipped.is_empty() {
    tracing::warn!(skipped = ?report.skipped, "tasks skipped after cancellation");
  }
  tracing::info!(
    cycle_id = %report.cycle_id,
    status = ?report.status(),
    succeeded = report.outcomes.len(),
    failed = report.failures.len(),
    api_calls = report.api_calls,
    duration_s = report.duration.as_secs_f64(),
    "done"
  );
}

fn exit_code(status: CycleStatus) -> u8 {
  match status {
    CycleStatus::Success => 0,
    CycleStatus::PartialFailure | CycleStatus::Cancelled => EXIT_PARTIAL,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn exit_codes_follow_cycle_status() {
    assert_eq!(exit_code(CycleStatus::Success), 0);
    assert_eq!(exit_code(CycleStatus::PartialFailure), 1);
    assert_eq!(exit_code(CycleStatus::Cancelled), 1);
  }

  #[test]
  fn sync_defaults_to_the_hourly_profile() {
    let cli = Cli::try_parse_from(["tally", "sync"]).unwrap();
    assert_eq!(cli.config, PathBuf::from("tally.toml"));
    assert!(matches!(cli.command, Command::Sync { profile: Profile::Hourly }));

    let cli = Cli::try_parse_from(["tally", "-c", "x.toml", "sync", "--profile", "full"]).unwrap();
    assert!(matches!(cli.command, Command::Sync { profile: Profile::Full }));
  }

  #[test]
  fn show_takes_a_set_and_optional_account() {
    let cli = Cli::try_parse_from(["tally", "show", "positions", "--account", "42"]).unwrap();
    match cli.command {
      Command::Show { set, account } => {
        assert_eq!(set, "positions");
        assert_eq!(account, Some(42));
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn unknown_profile_is_rejected() {
    assert!(Cli::try_parse_from(["tally", "sync", "--profile", "weekly"]).is_err());
  }
}
