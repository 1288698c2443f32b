//! Status and queued-item notifications for UI observers.

use color_eyre::Result;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

use super::queue::QueueManager;
use crate::connectivity::Connectivity;

/// Snapshot of the sync layer's observable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
  pub online: bool,
  pub syncing: bool,
  pub queue_count: usize,
}

/// A write that was deferred into the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedItem {
  pub url: String,
  pub method: String,
  /// Parsed JSON payload; for creates, the optimistic item merged into the cache.
  pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SyncEvent {
  StatusChanged(Status),
  ItemQueued(QueuedItem),
}

/// Broadcasts [`SyncEvent`]s. Sending never waits and never fails; events
/// published with no subscriber are dropped.
#[derive(Clone)]
pub struct EventPublisher {
  tx: broadcast::Sender<SyncEvent>,
  connectivity: Connectivity,
  queue: QueueManager,
  syncing: Arc<AtomicBool>,
}

impl EventPublisher {
  pub fn new(capacity: usize, connectivity: Connectivity, queue: QueueManager) -> Self {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    Self {
      tx,
      connectivity,
      queue,
      syncing: Arc::new(AtomicBool::new(false)),
    }
  }

  /// Register an observer. Dropping the receiver unregisters it.
  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.tx.subscribe()
  }

  pub fn status(&self) -> Result<Status> {
    Ok(Status {
      online: self.connectivity.is_online(),
      syncing: self.is_syncing(),
      queue_count: self.queue.len()?,
    })
  }

  pub fn publish_status(&self) {
    match self.status() {
      Ok(status) => {
        let _ = self.tx.send(SyncEvent::StatusChanged(status));
      }
      Err(e) => warn!(error = %e, "Could not compute sync status"),
    }
  }

  pub fn publish_queued(&self, item: QueuedItem) {
    let _ = self.tx.send(SyncEvent::ItemQueued(item));
  }

  pub fn is_syncing(&self) -> bool {
    self.syncing.load(Ordering::SeqCst)
  }

  /// Claim the syncing flag. `None` if a replay already holds it.
  pub fn begin_sync(&self) -> Option<SyncGuard> {
    self
      .syncing
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .ok()
      .map(|_| SyncGuard {
        flag: Arc::clone(&self.syncing),
      })
  }
}

/// Holds the syncing flag until dropped.
pub struct SyncGuard {
  flag: Arc<AtomicBool>,
}

impl Drop for SyncGuard {
  fn drop(&mut self) {
    self.flag.store(false, Ordering::SeqCst);
  }
}
