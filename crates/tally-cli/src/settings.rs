//! Launcher configuration: an optional TOML file layered under `T212_*`
//! environment variables.

use std::{
  num::NonZeroU32,
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::{Context as _, Result, bail};
use config::{Config, Environment, File, Source};
use serde::Deserialize;
use tally_core::limiter::{DEFAULT_RESTRICTED_PER_MINUTE, RateLimiter};
use tally_t212::{
  ApiConfig, ApiEnvironment,
  client::DEFAULT_TIMEOUT,
  pagination::{DEFAULT_PAGE_LIMIT, PagingLimits},
};

pub const ENV_PREFIX: &str = "T212";

/// Pages an hourly run may walk per history endpoint.
pub const DEFAULT_HOURLY_MAX_PAGES: usize = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
  #[serde(default)]
  pub api_key:               String,
  #[serde(default)]
  pub api_secret:            String,
  #[serde(default)]
  pub api_env:               ApiEnvironment,
  /// Overrides the environment's API root.
  #[serde(default)]
  pub api_base_url:          Option<String>,
  #[serde(default = "default_store_path")]
  pub store_path:            PathBuf,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs:          u64,
  #[serde(default = "default_restricted_per_minute")]
  pub restricted_per_minute: u32,
  #[serde(default = "default_page_limit")]
  pub page_limit:            u32,
  #[serde(default = "default_hourly_max_pages")]
  pub hourly_max_pages:      usize,
}

fn default_store_path() -> PathBuf { PathBuf::from("tally.db") }

fn default_timeout_secs() -> u64 { DEFAULT_TIMEOUT.as_secs() }

fn default_restricted_per_minute() -> u32 { DEFAULT_RESTRICTED_PER_MINUTE }

fn default_page_limit() -> u32 { DEFAULT_PAGE_LIMIT }

fn default_hourly_max_pages() -> usize { DEFAULT_HOURLY_MAX_PAGES }

impl Settings {
  /// Read `path` (if it exists), then apply `T212_*` variables on top.
  pub fn load(path: &Path) -> Result<Self> {
    Self::from_sources(
      File::from(path).required(false),
      Environment::with_prefix(ENV_PREFIX).try_parsing(true),
    )
    .with_context(|| format!("failed to load configuration from {}", path.display()))
  }

  fn from_sources(
    file: impl Source + Send + Sync + 'static,
    env: Environment,
  ) -> Result<Self> {
    let settings = Config::builder()
      .add_source(file)
      .add_source(env)
      .build()
      .context("failed to read configuration")?;

    let mut settings: Self = settings
      .try_deserialize()
      .context("failed to deserialise settings")?;
    settings.store_path = expand_tilde(&settings.store_path);
    Ok(settings)
  }

  /// API connection settings; fails when credentials are missing.
  pub fn api_config(&self) -> Result<ApiConfig> {
    if self.api_key.trim().is_empty() || self.api_secret.trim().is_empty() {
      bail!("API credentials missing: set api_key and api_secret (or {ENV_PREFIX}_API_KEY / {ENV_PREFIX}_API_SECRET)");
    }
    let config = ApiConfig::new(self.api_env, &self.api_key, &self.api_secret)
      .with_timeout(Duration::from_secs(self.timeout_secs));
    Ok(match &self.api_base_url {
      Some(url) => config.with_base_url(url),
      None => config,
    })
  }

  pub fn limiter(&self) -> Result<RateLimiter> {
    let per_minute = NonZeroU32::new(self.restricted_per_minute)
      .context("restricted_per_minute must be greater than zero")?;
    Ok(RateLimiter::per_minute(per_minute))
  }

  /// Paging for an hourly run: stop at known records or after a few pages.
  pub fn incremental_paging(&self) -> PagingLimits {
    PagingLimits::incremental(self.hourly_max_pages).with_page_limit(self.page_limit)
  }

  /// Paging for a full run: walk every page.
  pub fn full_paging(&self) -> PagingLimits {
    PagingLimits::full().with_page_limit(self.page_limit)
  }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

#[cfg(test)]
mod tests {
  use config::FileFormat;

  use super::*;

  const TOML: &str = r#"
    api_key    = "file-key"
    api_secret = "file-secret"
    api_env    = "live"
    store_path = "/var/lib/tally/tally.db"
    page_limit = 20
  "#;

  fn env(vars: &[(&str, &str)]) -> Environment {
    let vars = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    Environment::with_prefix(ENV_PREFIX).try_parsing(true).source(Some(vars))
  }

  fn file(toml: &str) -> impl Source + Send + Sync + 'static {
    File::from_str(toml, FileFormat::Toml)
  }

  #[test]
  fn defaults_apply_when_nothing_is_set() {
    let settings = Settings::from_sources(file(""), env(&[])).unwrap();
    assert_eq!(settings.api_env, ApiEnvironment::Demo);
    assert_eq!(settings.store_path, PathBuf::from("tally.db"));
    assert_eq!(settings.timeout_secs, 30);
    assert_eq!(settings.restricted_per_minute, 6);
    assert_eq!(settings.page_limit, 50);
    assert_eq!(settings.hourly_max_pages, 5);
  }

  #[test]
  fn file_values_are_read() {
    let settings = Settings::from_sources(file(TOML), env(&[])).unwrap();
    assert_eq!(settings.api_key, "file-key");
    assert_eq!(settings.api_env, ApiEnvironment::Live);
    assert_eq!(settings.store_path, PathBuf::from("/var/lib/tally/tally.db"));
    assert_eq!(settings.page_limit, 20);
  }

  #[test]
  fn environment_overrides_the_file() {
    let settings = Settings::from_sources(
      file(TOML),
      env(&[("T212_API_KEY", "env-key"), ("T212_HOURLY_MAX_PAGES", "2"), ("OTHER_API_KEY", "x")]),
    )
    .unwrap();
    assert_eq!(settings.api_key, "env-key");
    assert_eq!(settings.api_secret, "file-secret");
    assert_eq!(settings.hourly_max_pages, 2);
  }

  #[test]
  fn missing_credentials_are_rejected() {
    let settings = Settings::from_sources(file(""), env(&[("T212_API_KEY", "k")])).unwrap();
    assert!(settings.api_config().is_err());
  }

  #[test]
  fn api_config_follows_environment_and_override() {
    let settings = Settings::from_sources(file(TOML), env(&[])).unwrap();
    assert_eq!(settings.api_config().unwrap().base_url, "https://live.trading212.com/api/v0");

    let local =
      Settings::from_sources(file(TOML), env(&[("T212_API_BASE_URL", "http://localhost:9000")]))
        .unwrap();
    assert_eq!(local.api_config().unwrap().base_url, "http://localhost:9000");
  }

  #[test]
  fn zero_rate_is_rejected() {
    let settings =
      Settings::from_sources(file(""), env(&[("T212_RESTRICTED_PER_MINUTE", "0")])).unwrap();
    assert!(settings.limiter().is_err());

    let settings = Settings::from_sources(file(""), env(&[])).unwrap();
    assert_eq!(settings.limiter().unwrap().min_spacing(), Duration::from_secs(10));
  }

  #[test]
  fn paging_profiles_share_the_page_limit() {
    let settings = Settings::from_sources(file(TOML), env(&[])).unwrap();
    let hourly = settings.incremental_paging();
    assert_eq!((hourly.page_limit, hourly.max_pages, hourly.stop_when_caught_up), (20, Some(5), true));
    let full = settings.full_paging();
    assert_eq!((full.page_limit, full.max_pages, full.stop_when_caught_up), (20, None, false));
  }
}
