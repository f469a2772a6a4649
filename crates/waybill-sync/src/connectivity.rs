//! Connectivity monitor
//!
//! Observable online/offline state. The monitor is constructed with the
//! host-reported initial status and injected into whatever needs it, so
//! tests can drive transitions deterministically. It is purely event-driven:
//! the host runtime's connectivity signals call [`ConnectivityMonitor::set_online`]
//! and [`ConnectivityMonitor::set_offline`]; there are no timers and no polling.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::info;

/// Network reachability as last reported by the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(self) -> bool {
        matches!(self, Connectivity::Online)
    }

    pub fn is_offline(self) -> bool {
        matches!(self, Connectivity::Offline)
    }
}

impl std::fmt::Display for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connectivity::Online => write!(f, "online"),
            Connectivity::Offline => write!(f, "offline"),
        }
    }
}

type Callback = Arc<dyn Fn(Connectivity) + Send + Sync>;

struct Inner {
    state: watch::Sender<Connectivity>,
    callbacks: DashMap<u64, Callback>,
    next_id: AtomicU64,
}

/// Observable connectivity state shared across the sync layer.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

impl ConnectivityMonitor {
    /// Create a monitor with the host-reported initial state.
    pub fn new(initial: Connectivity) -> Self {
        let (state, _rx) = watch::channel(initial);
        Self {
            inner: Arc::new(Inner {
                state,
                callbacks: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The current state.
    pub fn current(&self) -> Connectivity {
        *self.inner.state.borrow()
    }

    /// Host signal: connectivity restored.
    pub fn set_online(&self) {
        self.set(Connectivity::Online);
    }

    /// Host signal: connectivity lost.
    pub fn set_offline(&self) {
        self.set(Connectivity::Offline);
    }

    /// Apply a state report; observers are notified on transitions only.
    fn set(&self, state: Connectivity) {
        let changed = self
            .inner
            .state
            .send_if_modified(|current| {
                if *current == state {
                    false
                } else {
                    *current = state;
                    true
                }
            });

        if changed {
            info!(%state, "Connectivity changed");
            // Snapshot before invoking: a callback may subscribe or drop a
            // subscription on this monitor, which must not meet a held
            // shard lock.
            let callbacks: Vec<Callback> = self
                .inner
                .callbacks
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect();
            for callback in callbacks {
                callback(state);
            }
        }
    }

    /// Async observation path: a watch receiver seeing every transition.
    pub fn watch(&self) -> watch::Receiver<Connectivity> {
        self.inner.state.subscribe()
    }

    /// Register a transition callback.
    ///
    /// The returned [`Subscription`] unregisters the callback when dropped,
    /// so an owning view tearing down cannot leak its listener.
    pub fn subscribe(
        &self,
        callback: impl Fn(Connectivity) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.callbacks.insert(id, Arc::new(callback));
        Subscription {
            inner: Arc::clone(&self.inner),
            id,
        }
    }
}

/// Handle for a registered connectivity callback; dropping unsubscribes.
pub struct Subscription {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.callbacks.remove(&self.id);
    }
}
