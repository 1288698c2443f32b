//! Connectivity flag, its edge notifications, and a periodic reachability probe.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::http::{HttpRequest, Method, Transport};

/// Edges a slow subscriber may fall behind by before it starts missing them.
const EDGE_CAPACITY: usize = 64;

/// Direction of a connectivity change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  Online,
  Offline,
}

impl Transition {
  fn to(online: bool) -> Self {
    if online {
      Self::Online
    } else {
      Self::Offline
    }
  }
}

struct Inner {
  state: watch::Sender<Option<bool>>,
  edges: broadcast::Sender<Transition>,
}

/// Shared "currently online" flag.
///
/// The flag starts out unknown. An unknown report counts as online so that
/// writes are never queued on a guess. Every change is also sent to
/// subscribers as a separate [`Transition`], so quick flaps are not merged.
#[derive(Clone)]
pub struct Connectivity {
  inner: Arc<Inner>,
}

impl Connectivity {
  pub fn new() -> Self {
    let (state, _) = watch::channel(None);
    let (edges, _) = broadcast::channel(EDGE_CAPACITY);
    Self {
      inner: Arc::new(Inner { state, edges }),
    }
  }

  pub fn is_online(&self) -> bool {
    self.inner.state.borrow().unwrap_or(true)
  }

  /// The last report, if any was made.
  pub fn report(&self) -> Option<bool> {
    *self.inner.state.borrow()
  }

  /// Record a report. Returns true when it changed the flag, in which case
  /// subscribers see a transition.
  pub fn set_online(&self, online: bool) -> bool {
    // The edge is sent under the state lock so concurrent reports reach
    // subscribers in the order they were applied.
    let changed = self.inner.state.send_if_modified(|state| {
      if *state == Some(online) {
        return false;
      }
      *state = Some(online);
      let _ = self.inner.edges.send(Transition::to(online));
      true
    });
    if changed {
      info!(online, "Connectivity changed");
    }
    changed
  }

  /// Edge notifications from now on. Earlier reports are not replayed.
  pub fn subscribe(&self) -> Transitions {
    Transitions {
      rx: self.inner.edges.subscribe(),
    }
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new()
  }
}

/// Stream of connectivity edges, one item per change.
pub struct Transitions {
  rx: broadcast::Receiver<Transition>,
}

impl Transitions {
  /// Wait for the next edge. Returns `None` once every [`Connectivity`]
  /// handle is gone.
  pub async fn next(&mut self) -> Option<Transition> {
    loop {
      match self.rx.recv().await {
        Ok(transition) => return Some(transition),
        Err(RecvError::Lagged(skipped)) => {
          warn!(skipped, "Connectivity subscriber fell behind");
        }
        Err(RecvError::Closed) => return None,
      }
    }
  }
}

/// Periodically checks whether the API host answers at all.
pub struct Prober {
  transport: Arc<dyn Transport>,
  url: Url,
  interval: Duration,
  connectivity: Connectivity,
}

impl Prober {
  /// `transport` must be the unwrapped network primitive.
  pub fn new(
    transport: Arc<dyn Transport>,
    url: Url,
    interval: Duration,
    connectivity: Connectivity,
  ) -> Self {
    Self {
      transport,
      url,
      interval,
      connectivity,
    }
  }

  /// Probe once and record the result. Any HTTP response means reachable.
  pub async fn probe_once(&self) -> bool {
    let request = HttpRequest {
      method: Method::HEAD,
      url: self.url.clone(),
      headers: Default::default(),
      body: None,
    };

    let online = match self.transport.send(request).await {
      Ok(response) => {
        debug!(status = response.status, url = %self.url, "Probe answered");
        true
      }
      Err(e) => {
        debug!(error = %e, url = %self.url, "Probe failed");
        false
      }
    };

    self.connectivity.set_online(online);
    online
  }

  pub fn spawn(self) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      loop {
        ticker.tick().await;
        self.probe_once().await;
      }
    })
  }
}
