//! Request dispatcher: builds requests, attaches auth, normalizes errors.

use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Method};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::retry::RetryPolicy;
use super::Params;
use crate::config::ApiConfig;
use crate::error::{ApiError, ApiResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("feedgate/", env!("CARGO_PKG_VERSION"));

/// Where the dispatcher reads the current auth token from.
///
/// Read on every request, so a login or logout between two requests is
/// honored immediately.
pub trait TokenSource: Send + Sync {
  fn token(&self) -> color_eyre::Result<Option<String>>;
}

/// Token source with no session. Every request goes out unauthenticated.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

impl TokenSource for Anonymous {
  fn token(&self) -> color_eyre::Result<Option<String>> {
    Ok(None)
  }
}

/// A single outgoing request, relative to the dispatcher's base URL.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub path: String,
  pub query: Params,
  pub body: Option<Value>,
  /// Attach the session token, if there is one.
  pub authenticated: bool,
}

impl Request {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Params::new(),
      body: None,
      authenticated: true,
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::GET, path)
  }

  pub fn post(path: impl Into<String>) -> Self {
    Self::new(Method::POST, path)
  }

  pub fn put(path: impl Into<String>) -> Self {
    Self::new(Method::PUT, path)
  }

  pub fn patch(path: impl Into<String>) -> Self {
    Self::new(Method::PATCH, path)
  }

  pub fn delete(path: impl Into<String>) -> Self {
    Self::new(Method::DELETE, path)
  }

  pub fn with_query(mut self, params: &Params) -> Self {
    self.query.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
    self
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  /// Send without the `Authorization` header even when logged in.
  pub fn without_auth(mut self) -> Self {
    self.authenticated = false;
    self
  }
}

/// HTTP dispatcher for the backend API.
///
/// Does not interpret business status codes; any non-2xx response becomes
/// [`ApiError::Status`] with the server's message.
#[derive(Clone)]
pub struct Dispatcher {
  client: Client,
  base_url: Url,
  tokens: Arc<dyn TokenSource>,
  retry: RetryPolicy,
}

impl Dispatcher {
  /// Dispatcher with the default timeout and no retries.
  pub fn new(base_url: &str, tokens: Arc<dyn TokenSource>) -> ApiResult<Self> {
    let client = build_client(DEFAULT_TIMEOUT, USER_AGENT)?;
    Ok(Self {
      client,
      base_url: parse_base_url(base_url)?,
      tokens,
      retry: RetryPolicy::none(),
    })
  }

  pub fn from_config(
    config: &ApiConfig,
    retry: RetryPolicy,
    tokens: Arc<dyn TokenSource>,
  ) -> ApiResult<Self> {
    let user_agent = config.user_agent.as_deref().unwrap_or(USER_AGENT);
    let client = build_client(Duration::from_secs(config.timeout_secs), user_agent)?;

    Ok(Self {
      client,
      base_url: parse_base_url(&config.base_url)?,
      tokens,
      retry,
    })
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// Absolute URL for a path relative to the base URL.
  ///
  /// The result always stays under the base URL: absolute URLs,
  /// scheme-relative paths and `..` segments that climb out of it are
  /// rejected, so the session token never leaves the configured backend.
  pub fn url_for(&self, path: &str) -> ApiResult<Url> {
    let rejected = |reason: &str| {
      ApiError::InvalidConfig(format!("request path {} rejected: {}", path, reason))
    };

    let trimmed = path.trim();
    if trimmed.starts_with("//") || trimmed.starts_with("\\\\") {
      return Err(rejected("scheme-relative URL"));
    }
    if Url::parse(trimmed).is_ok() {
      return Err(rejected("absolute URL"));
    }

    let url = self
      .base_url
      .join(trimmed.trim_start_matches('/'))
      .map_err(|e| rejected(&e.to_string()))?;

    if url.origin() != self.base_url.origin() || !url.path().starts_with(self.base_url.path()) {
      return Err(rejected("outside the base URL"));
    }

    Ok(url)
  }

  /// Send a request and decode its JSON body. An empty body decodes to
  /// `Value::Null`.
  pub async fn send(&self, request: &Request) -> ApiResult<Value> {
    let mut attempt = 0;

    loop {
      match self.send_once(request).await {
        Err(err) if self.retry.should_retry(attempt, &request.method, &err) => {
          let delay = self.retry.delay(attempt);
          warn!(
            method = %request.method,
            path = %request.path,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying request"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        result => return result,
      }
    }
  }

  async fn send_once(&self, request: &Request) -> ApiResult<Value> {
    let url = self.url_for(&request.path)?;
    let mut builder = self.client.request(request.method.clone(), url);

    if !request.query.is_empty() {
      builder = builder.query(&request.query);
    }

    if request.authenticated {
      let token = self.tokens.token().map_err(ApiError::storage)?;
      if let Some(token) = token {
        builder = builder.header(AUTHORIZATION, format!("Token {}", token));
      }
    }

    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| ApiError::Transport(e.to_string()))?;

    let status = response.status();
    let bytes = response
      .bytes()
      .await
      .map_err(|e| ApiError::Transport(e.to_string()))?;

    debug!(
      method = %request.method,
      path = %request.path,
      status = status.as_u16(),
      bytes = bytes.len(),
      "response received"
    );

    if !status.is_success() {
      return Err(ApiError::from_response(status.as_u16(), &bytes));
    }

    if bytes.is_empty() {
      return Ok(Value::Null);
    }

    serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
  }
}

fn build_client(timeout: Duration, user_agent: &str) -> ApiResult<Client> {
  Client::builder()
    .timeout(timeout)
    .user_agent(user_agent)
    .build()
    .map_err(|e| ApiError::InvalidConfig(format!("failed to build HTTP client: {}", e)))
}

/// Parse the base URL, making sure it ends with `/` so relative paths join
/// underneath it instead of replacing its last segment.
fn parse_base_url(base_url: &str) -> ApiResult<Url> {
  let mut url = Url::parse(base_url)
    .map_err(|e| ApiError::InvalidConfig(format!("invalid base URL {}: {}", base_url, e)))?;

  if !matches!(url.scheme(), "http" | "https") {
    return Err(ApiError::InvalidConfig(format!(
      "base URL must be http or https: {}",
      base_url
    )));
  }

  if !url.path().ends_with('/') {
    let path = format!("{}/", url.path());
    url.set_path(&path);
  }

  Ok(url)
}
