use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, info, instrument, trace, warn};

use crate::error::{invalid_argument, ConnectionResult, FeedError};
use crate::events::{EventBatch, EventKinds, Symbol};
use crate::feed::{FeedEngine, FeedSubscribeRequest, FeedSubscriptionId};
use crate::market_data::dispatch::{isolate, Dispatcher, EventListener};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Open,
    Closed,
}

struct Lifecycle {
    state: SubscriptionState,
    symbols: BTreeSet<Symbol>,
}

/// Shared state behind a `Subscription`, reachable from the dispatcher's routing table.
pub(crate) struct SubscriptionCore {
    id: FeedSubscriptionId,
    kinds: EventKinds,
    listener: Arc<dyn EventListener>,
    engine: Arc<dyn FeedEngine>,
    dispatcher: Arc<Dispatcher>,
    // Checked on every delivery without taking the lifecycle lock.
    closed: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    // Held for the duration of each listener invocation. Reentrant so a listener may close
    // its own subscription from the delivery thread.
    delivery: ReentrantMutex<()>,
}

impl SubscriptionCore {
    /// Hand one batch to the listener. Returns false when the batch was filtered out.
    pub(crate) fn deliver(&self, batch: &EventBatch) -> bool {
        let _in_flight = self.delivery.lock();
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        if !self.kinds.contains(batch.kind) {
            trace!(id = self.id, kind = %batch.kind, "Kind not subscribed, batch dropped");
            return false;
        }
        if !self.lifecycle.lock().symbols.contains(&batch.symbol) {
            trace!(id = self.id, symbol = %batch.symbol, "Symbol not subscribed, batch dropped");
            return false;
        }
        isolate("event", || self.listener.on_events(batch));
        true
    }

    pub(crate) fn deliver_error(&self, error: &FeedError) {
        let _in_flight = self.delivery.lock();
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        warn!(id = self.id, %error, "Subscription failed in feed engine");
        isolate("error", || self.listener.on_error(error));
    }

    #[instrument(level = "debug", skip(self), fields(id = self.id))]
    pub(crate) fn close(&self) {
        let mut closed_here = false;
        {
            let mut life = self.lifecycle.lock();
            if life.state == SubscriptionState::Open {
                closed_here = true;
                self.closed.store(true, Ordering::Release);
                if let Err(error) = self.engine.unsubscribe(self.id) {
                    // The engine may already have dropped it, e.g. after a disconnect.
                    debug!(id = self.id, %error, "Unsubscribe reported an error");
                }
                self.dispatcher.deregister(self.id);
                life.symbols.clear();
                life.state = SubscriptionState::Closed;
                info!(id = self.id, "Subscription closed");
            }
        }
        // Wait out a listener invocation still running on another thread.
        drop(self.delivery.lock());
        if closed_here {
            isolate("close", || self.listener.on_closed());
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Live (symbol, event kind) interest registered with the feed engine.
///
/// Dropping a subscription closes it.
pub struct Subscription {
    core: Arc<SubscriptionCore>,
}

impl Subscription {
    #[instrument(level = "debug", skip(engine, dispatcher, listener), fields(kinds = ?request.kinds))]
    pub(crate) fn open(
        engine: Arc<dyn FeedEngine>,
        dispatcher: Arc<Dispatcher>,
        request: FeedSubscribeRequest,
        listener: Arc<dyn EventListener>,
    ) -> ConnectionResult<Self> {
        if request.kinds.is_empty() {
            return Err(invalid_argument("subscription needs at least one event kind"));
        }
        if request.symbols.iter().any(Symbol::is_empty) {
            return Err(invalid_argument("symbol must not be empty"));
        }

        let symbols: BTreeSet<Symbol> = request.symbols.iter().cloned().collect();
        let kinds = request.kinds.clone();
        let core = dispatcher.open_route(
            || engine.subscribe(&request),
            |id| {
                Arc::new(SubscriptionCore {
                    id,
                    kinds,
                    listener,
                    engine: engine.clone(),
                    dispatcher: dispatcher.clone(),
                    closed: AtomicBool::new(false),
                    lifecycle: Mutex::new(Lifecycle { state: SubscriptionState::Open, symbols }),
                    delivery: ReentrantMutex::new(()),
                })
            },
        )?;
        info!(
            id = core.id,
            symbols = %request.symbols.iter().join(","),
            snapshot = request.snapshot,
            "Subscription opened"
        );
        Ok(Subscription { core })
    }

    pub fn id(&self) -> FeedSubscriptionId {
        self.core.id
    }

    pub fn event_kinds(&self) -> &EventKinds {
        &self.core.kinds
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.core.lifecycle.lock().symbols.iter().cloned().collect()
    }

    pub fn state(&self) -> SubscriptionState {
        self.core.lifecycle.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Add symbols to the subscription. A no-op once closed.
    pub fn add_symbols<I, S>(&self, symbols: I) -> ConnectionResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        let symbols = collect_symbols(symbols)?;
        let mut life = self.core.lifecycle.lock();
        if life.state == SubscriptionState::Closed {
            return Ok(());
        }
        let fresh: Vec<Symbol> = symbols.into_iter().filter(|s| !life.symbols.contains(s)).collect();
        if fresh.is_empty() {
            return Ok(());
        }
        self.core.engine.add_symbols(self.core.id, &fresh)?;
        debug!(id = self.core.id, added = %fresh.iter().join(","), "Symbols added");
        life.symbols.extend(fresh);
        Ok(())
    }

    /// Remove symbols from the subscription. A no-op once closed.
    pub fn remove_symbols<I, S>(&self, symbols: I) -> ConnectionResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        let symbols = collect_symbols(symbols)?;
        let mut life = self.core.lifecycle.lock();
        if life.state == SubscriptionState::Closed {
            return Ok(());
        }
        let present: Vec<Symbol> = symbols.into_iter().filter(|s| life.symbols.contains(s)).collect();
        if present.is_empty() {
            return Ok(());
        }
        self.core.engine.remove_symbols(self.core.id, &present)?;
        debug!(id = self.core.id, removed = %present.iter().join(","), "Symbols removed");
        for symbol in &present {
            life.symbols.remove(symbol);
        }
        Ok(())
    }

    /// Replace the whole symbol set.
    pub fn set_symbols<I, S>(&self, symbols: I) -> ConnectionResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        let wanted: BTreeSet<Symbol> = collect_symbols(symbols)?.into_iter().collect();
        let current: BTreeSet<Symbol> = self.symbols().into_iter().collect();
        self.remove_symbols(current.difference(&wanted).cloned())?;
        self.add_symbols(wanted.difference(&current).cloned())
    }

    /// Deregister from the feed engine. Idempotent; once this returns no listener
    /// invocation for this subscription is running or will start.
    pub fn close(&self) {
        self.core.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.core.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.core.id)
            .field("kinds", &self.core.kinds)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn collect_symbols<I, S>(symbols: I) -> ConnectionResult<Vec<Symbol>>
where
    I: IntoIterator<Item = S>,
    S: Into<Symbol>,
{
    let symbols: Vec<Symbol> = symbols.into_iter().map(Into::into).collect();
    if symbols.iter().any(Symbol::is_empty) {
        return Err(invalid_argument("symbol must not be empty"));
    }
    Ok(symbols)
}
