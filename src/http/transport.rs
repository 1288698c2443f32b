//! The network primitive and its reqwest-backed implementation.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;

use super::{Headers, HttpRequest, HttpResponse};

/// Performs a single network request.
///
/// An `Err` means the request never produced an HTTP response (unreachable
/// host, timeout, connection reset). Non-2xx statuses are returned as `Ok`.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Live transport over a shared reqwest client.
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
}

impl ReqwestTransport {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for ReqwestTransport {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
    let HttpRequest {
      method,
      url,
      headers,
      body,
    } = request;

    let mut builder = self.client.request(method.clone(), url.clone());
    for (name, value) in headers.iter() {
      builder = builder.header(name, value);
    }
    if let Some(body) = body {
      builder = builder.body(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("{} {} failed: {}", method, url, e))?;

    let status = response.status().as_u16();
    let mut headers = Headers::new();
    for (name, value) in response.headers() {
      if let Ok(value) = value.to_str() {
        headers.append(name.as_str(), value);
      }
    }
    let body = response
      .text()
      .await
      .map_err(|e| eyre!("Failed to read response body from {}: {}", url, e))?;

    Ok(HttpResponse {
      status,
      headers,
      body,
    })
  }
}
