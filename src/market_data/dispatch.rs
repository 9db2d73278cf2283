//! Event dispatch: routes feed-engine callbacks to the subscription that asked for them.
//!
//! Listeners run inline on the feed's delivery thread. Each invocation is isolated, so a
//! panicking listener is logged and counted but never unwinds into the feed engine.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace};

use crate::error::FeedError;
use crate::events::EventBatch;
use crate::feed::{ConnectionStatus, FeedSink, FeedSubscriptionId};
use crate::market_data::subscription::SubscriptionCore;

/// Receives event batches for a subscription.
pub trait EventListener: Send + Sync {
    fn on_events(&self, batch: &EventBatch);

    /// Fatal, subscription-scoped failure reported by the feed engine.
    fn on_error(&self, _error: &FeedError) {}

    /// Called once after the owning subscription is closed and no delivery is in flight.
    fn on_closed(&self) {}
}

impl<F> EventListener for F
where
    F: Fn(&EventBatch) + Send + Sync,
{
    fn on_events(&self, batch: &EventBatch) {
        self(batch)
    }
}

pub trait StatusListener: Send + Sync {
    fn on_status_change(&self, old: ConnectionStatus, new: ConnectionStatus);
}

impl<F> StatusListener for F
where
    F: Fn(ConnectionStatus, ConnectionStatus) + Send + Sync,
{
    fn on_status_change(&self, old: ConnectionStatus, new: ConnectionStatus) {
        self(old, new)
    }
}

/// Run one listener invocation, containing any panic it raises.
/// Returns false when the listener panicked.
pub(crate) fn isolate<F: FnOnce()>(what: &'static str, f: F) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(listener = what, %reason, "Listener panicked; delivery continues");
            metrics::counter!("mdx_listener_panics_total").increment(1);
            false
        }
    }
}

/// Per-connection routing table and status fan-out. Installed as the feed engine's sink.
pub struct Dispatcher {
    routes: RwLock<AHashMap<FeedSubscriptionId, Weak<SubscriptionCore>>>,
    status: Mutex<ConnectionStatus>,
    status_listeners: RwLock<Vec<Arc<dyn StatusListener>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(AHashMap::new()),
            status: Mutex::new(ConnectionStatus::NotConnected),
            status_listeners: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe through `subscribe` and register the resulting core. The routing table stays
    /// write-locked across both steps so a delivery racing the subscribe call finds its route.
    pub(crate) fn open_route<S, M>(&self, subscribe: S, make: M) -> Result<Arc<SubscriptionCore>, FeedError>
    where
        S: FnOnce() -> Result<FeedSubscriptionId, FeedError>,
        M: FnOnce(FeedSubscriptionId) -> Arc<SubscriptionCore>,
    {
        let mut routes = self.routes.write();
        let id = subscribe()?;
        let core = make(id);
        routes.insert(id, Arc::downgrade(&core));
        metrics::gauge!("mdx_open_subscriptions").increment(1.0);
        trace!(id, "Route registered");
        Ok(core)
    }

    pub(crate) fn deregister(&self, id: FeedSubscriptionId) {
        if self.routes.write().remove(&id).is_some() {
            metrics::gauge!("mdx_open_subscriptions").decrement(1.0);
            trace!(id, "Route removed");
        }
    }

    /// Live subscriptions, used by connection shutdown.
    pub(crate) fn live_subscriptions(&self) -> Vec<Arc<SubscriptionCore>> {
        self.routes.read().values().filter_map(Weak::upgrade).collect()
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    pub fn add_status_listener(&self, listener: Arc<dyn StatusListener>) {
        self.status_listeners.write().push(listener);
    }

    fn route(&self, id: FeedSubscriptionId) -> Option<Arc<SubscriptionCore>> {
        // Clone out of the table so no lock is held while a listener runs.
        self.routes.read().get(&id).and_then(Weak::upgrade)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedSink for Dispatcher {
    fn on_events(&self, id: FeedSubscriptionId, batch: EventBatch) {
        let Some(core) = self.route(id) else {
            trace!(id, symbol = %batch.symbol, "Delivery for unknown or closed subscription dropped");
            return;
        };
        let len = batch.len();
        if core.deliver(&batch) {
            metrics::counter!("mdx_events_dispatched_total").increment(len as u64);
        }
    }

    fn on_subscription_error(&self, id: FeedSubscriptionId, error: FeedError) {
        match self.route(id) {
            Some(core) => core.deliver_error(&error),
            None => debug!(id, %error, "Error for unknown subscription ignored"),
        }
    }

    fn on_status_change(&self, status: ConnectionStatus) {
        let old = std::mem::replace(&mut *self.status.lock(), status);
        if old == status {
            return;
        }
        info!(?old, new = ?status, "Connection status changed");
        let listeners = self.status_listeners.read().clone();
        for listener in listeners {
            isolate("status", || listener.on_status_change(old, status));
        }
    }
}
