//! Durable FIFO of writes that could not reach the network.

use chrono::{DateTime, SubsecRound, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::store::{Slot, Store};
use crate::http::{Headers, HttpRequest, Method};

/// One deferred mutating request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
  pub id: String,
  pub url: String,
  pub method: String,
  #[serde(default)]
  pub headers: Headers,
  #[serde(default)]
  pub body: Option<String>,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub created_at: DateTime<Utc>,
  /// Failed replay tries so far.
  #[serde(default)]
  pub attempts: u32,
}

impl QueueEntry {
  fn from_request(request: &HttpRequest) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      url: request.url.to_string(),
      method: request.method.as_str().to_string(),
      headers: request.headers.clone(),
      body: request.body.clone(),
      // Stored with millisecond precision.
      created_at: Utc::now().trunc_subsecs(3),
      attempts: 0,
    }
  }

  /// Rebuild the live request this entry stands for.
  pub fn to_request(&self) -> Result<HttpRequest> {
    let method = Method::from_bytes(self.method.as_bytes())
      .map_err(|e| eyre!("Queued entry {} has invalid method '{}': {}", self.id, self.method, e))?;
    let mut request = HttpRequest::new(method, &self.url)?;
    request.headers = self.headers.clone();
    request.body = self.body.clone();
    Ok(request)
  }
}

/// Queue operations over the persisted queue slot.
#[derive(Clone)]
pub struct QueueManager {
  store: Store,
}

impl QueueManager {
  pub fn new(store: Store) -> Self {
    Self { store }
  }

  /// Append a request with a fresh id and zero attempts.
  pub fn enqueue(&self, request: &HttpRequest) -> Result<QueueEntry> {
    let entry = QueueEntry::from_request(request);
    let appended = entry.clone();
    self
      .store
      .modify(Slot::Queue, |queue: &mut Vec<QueueEntry>| queue.push(appended))?;
    Ok(entry)
  }

  /// Copy of the queue in replay order.
  pub fn snapshot(&self) -> Result<Vec<QueueEntry>> {
    self.store.read(Slot::Queue)
  }

  pub fn len(&self) -> Result<usize> {
    Ok(self.snapshot()?.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Settle a replay pass.
  ///
  /// `replayed` is the snapshot the pass worked from and `remaining` the
  /// entries from it that must stay queued. Snapshot entries missing from
  /// `remaining` are dropped, survivors are replaced by their `remaining`
  /// version in place, and anything enqueued after the snapshot was taken is
  /// kept. Returns the new queue length.
  pub fn replace_with(&self, replayed: &[QueueEntry], remaining: Vec<QueueEntry>) -> Result<usize> {
    let replayed: HashSet<&str> = replayed.iter().map(|e| e.id.as_str()).collect();
    let mut survivors: HashMap<String, QueueEntry> = remaining
      .into_iter()
      .map(|e| (e.id.clone(), e))
      .collect();

    self.store.modify(Slot::Queue, |queue: &mut Vec<QueueEntry>| {
      let current = std::mem::take(queue);
      for entry in current {
        if !replayed.contains(entry.id.as_str()) {
          queue.push(entry);
        } else if let Some(survivor) = survivors.remove(&entry.id) {
          queue.push(survivor);
        }
      }
      queue.len()
    })
  }
}
