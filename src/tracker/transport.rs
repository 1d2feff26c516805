//! Request/response seam to the tracker's REST API.

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::ACCEPT;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

/// Query string pairs. Keys may repeat (`names=a&names=b`).
pub type Query = [(String, String)];

/// Issues one request against the tracker and returns the parsed JSON body.
///
/// Authentication and session handling belong to the implementor.
pub trait Transport: Send + Sync {
  fn request<'a>(&'a self, path: &'a str, query: &'a Query) -> BoxFuture<'a, Result<Value>>;
}

/// HTTP transport for a Bugzilla-compatible REST endpoint.
pub struct HttpTransport {
  http: reqwest::Client,
  base: Url,
  api_key: String,
}

impl HttpTransport {
  pub fn new(tracker_url: &str, api_key: String) -> Result<Self> {
    let mut base = Url::parse(tracker_url)
      .map_err(|e| Error::remote(format!("Invalid tracker url '{}': {}", tracker_url, e)))?;
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }
    let base = base
      .join("rest/")
      .map_err(|e| Error::remote(format!("Invalid tracker url '{}': {}", tracker_url, e)))?;

    let http = reqwest::Client::builder()
      .user_agent(concat!("bugsync/", env!("CARGO_PKG_VERSION")))
      .timeout(Duration::from_secs(30))
      .build()?;

    Ok(Self {
      http,
      base,
      api_key,
    })
  }

  async fn send(&self, path: &str, query: &Query) -> Result<Value> {
    let mut url = self
      .base
      .join(path)
      .map_err(|e| Error::remote(format!("Invalid request path '{}': {}", path, e)))?;
    if !query.is_empty() {
      url.query_pairs_mut().extend_pairs(query);
    }

    debug!(%url, "Tracker request");
    let response = self
      .http
      .get(url)
      .header("X-BUGZILLA-API-KEY", &self.api_key)
      .header(ACCEPT, "application/json")
      .send()
      .await?;

    let status = response.status();
    let body = response.bytes().await?;
    let value: Value = serde_json::from_slice(&body)
      .map_err(|e| Error::remote(format!("Invalid response for {} ({}): {}", path, status, e)))?;

    if value.get("error").and_then(Value::as_bool) == Some(true) {
      let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown tracker error");
      return Err(Error::remote(format!("{}: {}", path, message)));
    }
    if !status.is_success() {
      return Err(Error::remote(format!("HTTP {} for {}", status, path)));
    }

    Ok(value)
  }
}

impl Transport for HttpTransport {
  fn request<'a>(&'a self, path: &'a str, query: &'a Query) -> BoxFuture<'a, Result<Value>> {
    self.send(path, query).boxed()
  }
}
