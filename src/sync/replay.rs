//! Drains the write queue against the live network.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::events::EventPublisher;
use super::queue::{QueueEntry, QueueManager};
use crate::connectivity::Connectivity;
use crate::http::Transport;

/// Why a replay request did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
  Offline,
  EmptyQueue,
  AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
  pub delivered: usize,
  pub retained: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
  Skipped(SkipReason),
  Completed(ReplayReport),
}

/// Sequential, in-order replay of queued writes.
///
/// Entries are delivered at least once: an entry leaves the queue only after
/// the server answered it with a 2xx. Failed entries stay where they are with
/// `attempts` bumped and are retried on every later pass, without limit.
#[derive(Clone)]
pub struct ReplayEngine {
  network: Arc<dyn Transport>,
  connectivity: Connectivity,
  queue: QueueManager,
  events: EventPublisher,
}

impl ReplayEngine {
  /// `network` must be the unwrapped transport, never the offline shim.
  pub fn new(
    network: Arc<dyn Transport>,
    connectivity: Connectivity,
    queue: QueueManager,
    events: EventPublisher,
  ) -> Self {
    Self {
      network,
      connectivity,
      queue,
      events,
    }
  }

  pub async fn run(&self) -> Result<ReplayOutcome> {
    if !self.connectivity.is_online() {
      return Ok(ReplayOutcome::Skipped(SkipReason::Offline));
    }
    if self.queue.is_empty()? {
      return Ok(ReplayOutcome::Skipped(SkipReason::EmptyQueue));
    }
    let Some(guard) = self.events.begin_sync() else {
      debug!("Replay already running, ignoring trigger");
      return Ok(ReplayOutcome::Skipped(SkipReason::AlreadyRunning));
    };

    self.events.publish_status();
    let result = self.drain().await;
    drop(guard);
    self.events.publish_status();

    result.map(ReplayOutcome::Completed)
  }

  async fn drain(&self) -> Result<ReplayReport> {
    let snapshot = self.queue.snapshot()?;
    let mut remaining = Vec::new();

    for entry in &snapshot {
      if !self.deliver(entry).await {
        remaining.push(QueueEntry {
          attempts: entry.attempts + 1,
          ..entry.clone()
        });
      }
    }

    let report = ReplayReport {
      delivered: snapshot.len() - remaining.len(),
      retained: remaining.len(),
    };
    let queue_len = self.queue.replace_with(&snapshot, remaining)?;
    info!(
      delivered = report.delivered,
      retained = report.retained,
      queue_len,
      "Replay pass finished"
    );

    Ok(report)
  }

  async fn deliver(&self, entry: &QueueEntry) -> bool {
    let request = match entry.to_request() {
      Ok(request) => request,
      Err(e) => {
        warn!(id = %entry.id, error = %e, "Cannot rebuild queued request");
        return false;
      }
    };

    match self.network.send(request).await {
      Ok(response) if response.is_success() => {
        debug!(id = %entry.id, status = response.status, "Replayed queued write");
        true
      }
      Ok(response) => {
        warn!(id = %entry.id, status = response.status, url = %entry.url, "Server rejected queued write");
        false
      }
      Err(e) => {
        warn!(id = %entry.id, error = %e, url = %entry.url, "Queued write could not be delivered");
        false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::{HttpRequest, Method};
  use crate::sync::events::{Status, SyncEvent};
  use crate::sync::store::Store;
  use crate::testing::ScriptedTransport;

  fn engine() -> (ReplayEngine, Arc<ScriptedTransport>, QueueManager, EventPublisher, Connectivity) {
    let network = Arc::new(ScriptedTransport::new());
    let connectivity = Connectivity::new();
    let queue = QueueManager::new(Store::in_memory());
    let events = EventPublisher::new(16, connectivity.clone(), queue.clone());
    let engine = ReplayEngine::new(
      network.clone(),
      connectivity.clone(),
      queue.clone(),
      events.clone(),
    );
    (engine, network, queue, events, connectivity)
  }

  fn enqueue(queue: &QueueManager, url: &str) -> QueueEntry {
    let request = HttpRequest::new(Method::POST, url)
      .unwrap()
      .header("Content-Type", "application/json")
      .body(r#"{"n":1}"#);
    queue.enqueue(&request).unwrap()
  }

  #[tokio::test]
  async fn test_replays_in_order_and_empties_queue() {
    let (engine, network, queue, _, _) = engine();
    let urls = ["http://api.test/e1", "http://api.test/e2", "http://api.test/e3"];
    for url in urls {
      enqueue(&queue, url);
    }

    let outcome = engine.run().await.unwrap();
    assert_eq!(
      outcome,
      ReplayOutcome::Completed(ReplayReport {
        delivered: 3,
        retained: 0
      })
    );

    let calls = network.calls();
    let called: Vec<_> = calls.iter().map(|c| c.url.as_str()).collect();
    assert_eq!(called, urls);
    assert!(calls.iter().all(|c| c.method == Method::POST));
    assert_eq!(calls[0].body.as_deref(), Some(r#"{"n":1}"#));
    assert_eq!(calls[0].headers.get("content-type"), Some("application/json"));
    assert!(queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_partial_failure_keeps_only_failed_entry() {
    let (engine, network, queue, _, _) = engine();
    enqueue(&queue, "http://api.test/e1");
    let e2 = enqueue(&queue, "http://api.test/e2");
    enqueue(&queue, "http://api.test/e3");
    network.respond("http://api.test/e2", 500, "{}");

    let outcome = engine.run().await.unwrap();
    assert_eq!(
      outcome,
      ReplayOutcome::Completed(ReplayReport {
        delivered: 2,
        retained: 1
      })
    );

    let remaining = queue.snapshot().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, e2.id);
    assert_eq!(remaining[0].attempts, 1);
  }

  #[tokio::test]
  async fn test_transport_failure_retried_on_next_pass() {
    let (engine, network, queue, _, _) = engine();
    enqueue(&queue, "http://api.test/e1");
    network.fail("http://api.test/e1");
    network.fail("http://api.test/e1");

    engine.run().await.unwrap();
    engine.run().await.unwrap();
    assert_eq!(queue.snapshot().unwrap()[0].attempts, 2);

    engine.run().await.unwrap();
    assert!(queue.is_empty().unwrap());
    assert_eq!(network.calls().len(), 3);
  }

  #[tokio::test]
  async fn test_skips_when_offline_or_empty() {
    let (engine, network, queue, _, connectivity) = engine();
    assert_eq!(
      engine.run().await.unwrap(),
      ReplayOutcome::Skipped(SkipReason::EmptyQueue)
    );

    enqueue(&queue, "http://api.test/e1");
    connectivity.set_online(false);
    assert_eq!(
      engine.run().await.unwrap(),
      ReplayOutcome::Skipped(SkipReason::Offline)
    );
    assert!(network.calls().is_empty());
    assert_eq!(queue.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_trigger_is_coalesced() {
    let (engine, network, queue, events, _) = engine();
    enqueue(&queue, "http://api.test/e1");

    let _held = events.begin_sync().unwrap();
    assert_eq!(
      engine.run().await.unwrap(),
      ReplayOutcome::Skipped(SkipReason::AlreadyRunning)
    );
    assert!(network.calls().is_empty());
  }

  /// Enqueues a new write while the first replayed call is in flight.
  struct InterleavingTransport {
    queue: QueueManager,
  }

  #[async_trait::async_trait]
  impl Transport for InterleavingTransport {
    async fn send(&self, request: HttpRequest) -> Result<crate::http::HttpResponse> {
      if request.url.path() == "/e1" {
        enqueue(&self.queue, "http://api.test/late");
      }
      Ok(crate::http::HttpResponse::json(200, &serde_json::json!({})))
    }
  }

  #[tokio::test]
  async fn test_write_enqueued_mid_replay_survives() {
    let connectivity = Connectivity::new();
    let queue = QueueManager::new(Store::in_memory());
    let events = EventPublisher::new(16, connectivity.clone(), queue.clone());
    let network = Arc::new(InterleavingTransport {
      queue: queue.clone(),
    });
    let engine = ReplayEngine::new(network, connectivity, queue.clone(), events);
    enqueue(&queue, "http://api.test/e1");

    engine.run().await.unwrap();

    let remaining = queue.snapshot().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].url, "http://api.test/late");
    assert_eq!(remaining[0].attempts, 0);
  }

  #[tokio::test]
  async fn test_publishes_syncing_around_pass() {
    let (engine, _, queue, events, _) = engine();
    enqueue(&queue, "http://api.test/e1");
    let mut rx = events.subscribe();

    engine.run().await.unwrap();

    assert_eq!(
      rx.recv().await.unwrap(),
      SyncEvent::StatusChanged(Status {
        online: true,
        syncing: true,
        queue_count: 1
      })
    );
    assert_eq!(
      rx.recv().await.unwrap(),
      SyncEvent::StatusChanged(Status {
        online: true,
        syncing: false,
        queue_count: 0
      })
    );
  }
}
