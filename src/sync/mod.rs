//! Offline sync layer: read cache, write queue, interception and replay.
//!
//! The layer is assembled once per process by [`SyncLayer::install`], which
//! hands back a [`SyncHandle`]. Application code sends every request through
//! [`SyncHandle::transport`] and never needs to know whether the network is up:
//! - reads are cached on success and served from the cache while offline
//! - writes made while offline are queued, acknowledged with `202`, and
//!   replayed in order once connectivity returns
//! - observers follow progress through [`SyncHandle::subscribe`]

mod cache;
mod events;
mod queue;
mod replay;
mod shim;
pub mod store;

pub use cache::{cache_ttl, CacheEntry, CacheManager, CACHE_TTL_HOURS};
pub use events::{EventPublisher, QueuedItem, Status, SyncEvent};
pub use queue::{QueueEntry, QueueManager};
pub use replay::{ReplayEngine, ReplayOutcome, ReplayReport, SkipReason};
pub use shim::OfflineTransport;
pub use store::Store;

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::connectivity::{Connectivity, Transition};
use crate::http::Transport;

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Tunables for the sync layer.
#[derive(Debug, Clone)]
pub struct SyncOptions {
  /// URL fragments whose writes are never queued.
  pub no_queue_paths: Vec<String>,
  pub event_capacity: usize,
}

impl Default for SyncOptions {
  fn default() -> Self {
    Self {
      no_queue_paths: vec!["/auth/login".to_string(), "/auth/register".to_string()],
      event_capacity: 64,
    }
  }
}

pub struct SyncLayer;

impl SyncLayer {
  /// Build the process-wide sync layer. Fails if it was already installed.
  pub fn install(
    network: Arc<dyn Transport>,
    store: Store,
    connectivity: Connectivity,
    options: SyncOptions,
  ) -> Result<SyncHandle> {
    INSTALLED
      .set(())
      .map_err(|_| eyre!("Sync layer is already installed"))?;
    Ok(Self::build(network, store, connectivity, options))
  }

  /// Build a sync layer without the once-per-process guard.
  pub fn build(
    network: Arc<dyn Transport>,
    store: Store,
    connectivity: Connectivity,
    options: SyncOptions,
  ) -> SyncHandle {
    let cache = CacheManager::new(store.clone());
    let queue = QueueManager::new(store);
    let events = EventPublisher::new(options.event_capacity, connectivity.clone(), queue.clone());
    let replay = ReplayEngine::new(
      Arc::clone(&network),
      connectivity.clone(),
      queue.clone(),
      events.clone(),
    );
    let transport = Arc::new(OfflineTransport::new(
      network,
      connectivity.clone(),
      cache.clone(),
      queue.clone(),
      events.clone(),
      options.no_queue_paths,
    ));

    SyncHandle {
      transport,
      replay,
      events,
      queue,
      cache,
      connectivity,
    }
  }
}

/// Cloneable handle to an installed sync layer.
#[derive(Clone)]
pub struct SyncHandle {
  transport: Arc<OfflineTransport>,
  replay: ReplayEngine,
  events: EventPublisher,
  queue: QueueManager,
  cache: CacheManager,
  connectivity: Connectivity,
}

impl SyncHandle {
  /// The intercepting transport all application requests should use.
  pub fn transport(&self) -> Arc<dyn Transport> {
    self.transport.clone()
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.events.subscribe()
  }

  pub fn status(&self) -> Result<Status> {
    self.events.status()
  }

  pub fn queue(&self) -> &QueueManager {
    &self.queue
  }

  pub fn cache(&self) -> &CacheManager {
    &self.cache
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub async fn replay(&self) -> Result<ReplayOutcome> {
    self.replay.run().await
  }

  /// Announce the initial status and flush whatever an earlier session left queued.
  pub async fn start(&self) -> Result<ReplayOutcome> {
    self.events.publish_status();
    self.replay.run().await
  }

  /// Replay on every reconnection and announce every connectivity change.
  ///
  /// Replays run on their own tasks, so edges that arrive while one is still
  /// draining are announced right away.
  pub fn spawn_watcher(&self) -> JoinHandle<()> {
    let mut transitions = self.connectivity.subscribe();
    let replay = self.replay.clone();
    let events = self.events.clone();

    tokio::spawn(async move {
      while let Some(transition) = transitions.next().await {
        if transition == Transition::Online {
          let replay = replay.clone();
          tokio::spawn(async move {
            if let Err(e) = replay.run().await {
              warn!(error = %e, "Replay after reconnect failed");
            }
          });
        }
        events.publish_status();
      }
    })
  }
}
