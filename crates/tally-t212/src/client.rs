//! Async HTTP client wrapping the Trading 212 public API.

use std::{fmt, str::FromStr, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::{
  Client, StatusCode,
  header::{ACCEPT, AUTHORIZATION},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tally_core::record::AccountContext;

use crate::{Error, Result, payload::AccountInfo};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub const ACCOUNT_INFO: &str = "equity/account/info";

/// Which Trading 212 deployment to talk to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiEnvironment {
  Live,
  #[default]
  Demo,
}

impl ApiEnvironment {
  pub fn base_url(self) -> &'static str {
    match self {
      Self::Live => "https://live.trading212.com/api/v0",
      Self::Demo => "https://demo.trading212.com/api/v0",
    }
  }
}

impl FromStr for ApiEnvironment {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_lowercase().as_str() {
      "live" => Ok(Self::Live),
      "demo" => Ok(Self::Demo),
      other => Err(Error::Url(format!("unknown API environment {other:?}"))),
    }
  }
}

/// Connection settings for the Trading 212 API.
#[derive(Clone)]
pub struct ApiConfig {
  pub base_url:   String,
  pub api_key:    String,
  pub api_secret: String,
  pub timeout:    Duration,
}

impl ApiConfig {
  pub fn new(
    environment: ApiEnvironment,
    api_key: impl Into<String>,
    api_secret: impl Into<String>,
  ) -> Self {
    Self {
      base_url:   environment.base_url().to_owned(),
      api_key:    api_key.into(),
      api_secret: api_secret.into(),
      timeout:    DEFAULT_TIMEOUT,
    }
  }

  /// Point the client somewhere else, e.g. a local test server.
  pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
    self.base_url = base_url.into();
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  fn authorization(&self) -> String {
    let token = STANDARD.encode(format!("{}:{}", self.api_key, self.api_secret));
    format!("Basic {token}")
  }
}

impl fmt::Debug for ApiConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ApiConfig")
      .field("base_url", &self.base_url)
      .field("api_key", &"<redacted>")
      .field("api_secret", &"<redacted>")
      .field("timeout", &self.timeout)
      .finish()
  }
}

/// Async HTTP client for the Trading 212 REST API.
///
/// Cheap to clone; the inner [`reqwest::Client`] is `Arc`-based. The client
/// does no pacing of its own; callers go through the engine's rate limiter.
#[derive(Clone)]
pub struct ApiClient {
  client:        Client,
  base_url:      String,
  authorization: String,
}

impl ApiClient {
  pub fn new(config: ApiConfig) -> Result<Self> {
    let client = Client::builder().timeout(config.timeout).build()?;
    Ok(Self {
      client,
      base_url: config.base_url.trim_end_matches('/').to_owned(),
      authorization: config.authorization(),
    })
  }

  pub fn base_url(&self) -> &str { &self.base_url }

  fn url(&self, path: &str) -> String {
    format!("{}/{}", self.base_url, path.trim_start_matches('/'))
  }

  /// `GET <base>/<path>?<query>` and decode the body as JSON.
  pub async fn get_json(&self, path: &str, query: &[(String, String)]) -> Result<Value> {
    tracing::debug!(path, ?query, "GET");
    let resp = self
      .client
      .get(self.url(path))
      .header(AUTHORIZATION, &self.authorization)
      .header(ACCEPT, "application/json")
      .query(query)
      .send()
      .await?;

    let status = resp.status();
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
      return Err(Error::Unauthorized { path: path.to_owned(), status: status.as_u16() });
    }
    if !status.is_success() {
      return Err(Error::Status { path: path.to_owned(), status: status.as_u16() });
    }

    let body = resp.bytes().await?;
    serde_json::from_slice(&body).map_err(|source| Error::Decode { path: path.to_owned(), source })
  }

  /// `GET equity/account/info`: the account every cycle is collected for.
  pub async fn account_info(&self) -> Result<AccountContext> {
    let body = self.get_json(ACCOUNT_INFO, &[]).await?;
    let info: AccountInfo = serde_json::from_value(body)
      .map_err(|source| Error::Decode { path: ACCOUNT_INFO.to_owned(), source })?;
    Ok(info.into_context())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn basic_auth_encodes_key_and_secret() {
    let config = ApiConfig::new(ApiEnvironment::Demo, "key", "secret");
    assert_eq!(config.authorization(), "Basic a2V5OnNlY3JldA==");
  }

  #[test]
  fn environments_map_to_api_roots() {
    assert_eq!("LIVE".parse::<ApiEnvironment>().unwrap().base_url(), "https://live.trading212.com/api/v0");
    assert_eq!(ApiEnvironment::default().base_url(), "https://demo.trading212.com/api/v0");
    assert!("paper".parse::<ApiEnvironment>().is_err());
  }

  #[test]
  fn debug_output_hides_credentials() {
    let config = ApiConfig::new(ApiEnvironment::Live, "key-123", "secret-456");
    let shown = format!("{config:?}");
    assert!(!shown.contains("key-123"));
    assert!(!shown.contains("secret-456"));
  }

  #[test]
  fn paths_join_with_a_single_slash() {
    let client =
      ApiClient::new(ApiConfig::new(ApiEnvironment::Demo, "k", "s").with_base_url("http://x/api/v0/"))
        .unwrap();
    assert_eq!(client.url("/equity/portfolio"), "http://x/api/v0/equity/portfolio");
    assert_eq!(client.url("history/dividends"), "http://x/api/v0/history/dividends");
  }
}
