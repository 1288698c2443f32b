//! Transport wrapper that keeps the application working while offline.

use async_trait::async_trait;
use color_eyre::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::cache::CacheManager;
use super::events::{EventPublisher, QueuedItem};
use super::queue::QueueManager;
use crate::connectivity::Connectivity;
use crate::http::{HttpRequest, HttpResponse, Method, Transport};

/// Wraps the live transport.
///
/// Online, requests pass straight through and successful reads refresh the
/// cache. Offline, reads are served from the cache, eligible writes are queued
/// and acknowledged with `202`, and everything else gets a `503`.
pub struct OfflineTransport {
  inner: Arc<dyn Transport>,
  connectivity: Connectivity,
  cache: CacheManager,
  queue: QueueManager,
  events: EventPublisher,
  no_queue_paths: Vec<String>,
}

impl OfflineTransport {
  pub fn new(
    inner: Arc<dyn Transport>,
    connectivity: Connectivity,
    cache: CacheManager,
    queue: QueueManager,
    events: EventPublisher,
    no_queue_paths: Vec<String>,
  ) -> Self {
    Self {
      inner,
      connectivity,
      cache,
      queue,
      events,
      no_queue_paths,
    }
  }

  fn is_queueable(&self, request: &HttpRequest) -> bool {
    let url = request.url.as_str();
    !request.is_read() && !self.no_queue_paths.iter().any(|path| url.contains(path.as_str()))
  }

  fn serve_offline(&self, request: &HttpRequest) -> Result<HttpResponse> {
    if request.is_read() {
      if let Some(entry) = self.cache.lookup(request.url.as_str())? {
        debug!(url = %request.url, "Serving cached response while offline");
        return Ok(entry.to_response());
      }
    } else if self.is_queueable(request) {
      return self.defer(request);
    }

    debug!(method = %request.method, url = %request.url, "Rejecting request while offline");
    Ok(HttpResponse::json(
      503,
      &json!({"offline": true, "error": "offline"}),
    ))
  }

  fn defer(&self, request: &HttpRequest) -> Result<HttpResponse> {
    let url = request.url.to_string();
    let payload = json_payload(request);
    let entry = self.queue.enqueue(request)?;
    info!(id = %entry.id, method = %entry.method, url = %url, "Queued offline write");
    self.events.publish_status();

    let body = match payload {
      Some(Value::Object(mut fields)) if request.method == Method::POST => {
        fields.insert("offline".to_string(), Value::Bool(true));
        fields.insert("offline_id".to_string(), Value::String(entry.id.clone()));
        let item = Value::Object(fields);
        match self.cache.merge_optimistic(&url, &item) {
          Ok(merged) => debug!(merged, url = %url, "Merged optimistic item into cache"),
          Err(e) => warn!(error = %e, url = %url, "Optimistic cache merge failed"),
        }
        Some(item)
      }
      other => other,
    };

    self.events.publish_queued(QueuedItem {
      url,
      method: entry.method.clone(),
      body,
    });

    Ok(HttpResponse::json(
      202,
      &json!({"offline": true, "queuedId": entry.id}),
    ))
  }
}

#[async_trait]
impl Transport for OfflineTransport {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
    if !self.connectivity.is_online() {
      return self.serve_offline(&request);
    }

    let is_read = request.is_read();
    let url = request.url.to_string();
    let response = self.inner.send(request).await?;

    if is_read && response.is_success() {
      if let Err(e) = self.cache.store(&url, &response) {
        warn!(error = %e, url = %url, "Failed to cache response");
      }
    }

    Ok(response)
  }
}

/// Request body as JSON, when it claims or looks like JSON and parses.
fn json_payload(request: &HttpRequest) -> Option<Value> {
  let body = request.body.as_deref()?;
  if body.is_empty() {
    return None;
  }

  let declared = request
    .headers
    .get("content-type")
    .is_some_and(|ct| ct.to_ascii_lowercase().contains("application/json"));
  let trimmed = body.trim_start();
  if !declared && !trimmed.starts_with('{') && !trimmed.starts_with('[') {
    return None;
  }

  serde_json::from_str(body).ok()
}
