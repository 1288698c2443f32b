//! Thin JSON request helper that resource clients build on.

use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

use super::{HttpRequest, HttpResponse, Method, Transport};

/// Decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiPayload {
  Json(Value),
  Text(String),
}

/// Request helper bound to an API base URL.
#[derive(Clone)]
pub struct ApiClient {
  base_url: String,
  transport: Arc<dyn Transport>,
}

impl ApiClient {
  pub fn new(base_url: &str, transport: Arc<dyn Transport>) -> Self {
    Self {
      base_url: base_url.trim_end_matches('/').to_string(),
      transport,
    }
  }

  /// Resolve a resource path against the base URL. Absolute URLs pass through.
  pub fn url_for(&self, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
      return path.to_string();
    }
    if path.starts_with('/') {
      format!("{}{}", self.base_url, path)
    } else {
      format!("{}/{}", self.base_url, path)
    }
  }

  /// Send a request and hand back the raw response, whatever its status.
  pub async fn send(
    &self,
    method: Method,
    path: &str,
    body: Option<&Value>,
  ) -> Result<HttpResponse> {
    let mut request = HttpRequest::new(method, &self.url_for(path))?;
    if let Some(body) = body {
      if !request.headers.contains("content-type") {
        request.headers.insert("Content-Type", "application/json");
      }
      request.body = Some(body.to_string());
    }
    self.transport.send(request).await
  }

  /// Send a request, failing on non-2xx. `204` yields `None`.
  pub async fn call(
    &self,
    method: Method,
    path: &str,
    body: Option<&Value>,
  ) -> Result<Option<ApiPayload>> {
    let response = self.send(method, path, body).await?;

    if !response.is_success() {
      if response.body.is_empty() {
        return Err(eyre!("Error {} calling {}", response.status, path));
      }
      return Err(eyre!("{}", response.body));
    }

    if response.status == 204 {
      return Ok(None);
    }

    if response.is_json() {
      let value = serde_json::from_str(&response.body)
        .map_err(|e| eyre!("Invalid JSON from {}: {}", path, e))?;
      return Ok(Some(ApiPayload::Json(value)));
    }

    Ok(Some(ApiPayload::Text(response.body)))
  }

  /// Like [`ApiClient::call`], decoding a JSON body into `T`.
  pub async fn fetch<T: DeserializeOwned>(
    &self,
    method: Method,
    path: &str,
    body: Option<&Value>,
  ) -> Result<Option<T>> {
    match self.call(method, path, body).await? {
      None => Ok(None),
      Some(ApiPayload::Json(value)) => serde_json::from_value(value)
        .map(Some)
        .map_err(|e| eyre!("Unexpected response shape from {}: {}", path, e)),
      Some(ApiPayload::Text(_)) => Err(eyre!("Expected a JSON response from {}", path)),
    }
  }
}
