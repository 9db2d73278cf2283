//! In-process feed engine.
//!
//! Behaves like a real engine from the core's point of view: every delivery happens on a
//! dedicated thread, fed through a crossbeam channel, so listener callbacks never run on
//! the publishing thread. Used by the demo binary, the benches and the tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use ahash::AHashMap;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::{ConnectionStatus, FeedEngine, FeedSink, FeedSubscribeRequest, FeedSubscriptionId};
use crate::error::FeedError;
use crate::events::{EventBatch, EventKind, MarketEvent, Symbol};

enum Delivery {
    Events(FeedSubscriptionId, EventBatch),
    Error(FeedSubscriptionId, FeedError),
    Status(ConnectionStatus),
    Barrier(Sender<()>),
}

struct SimSubscription {
    request: FeedSubscribeRequest,
    symbols: BTreeSet<Symbol>,
}

impl SimSubscription {
    fn wants(&self, symbol: &Symbol, kind: EventKind) -> bool {
        self.request.kinds.contains(kind) && self.symbols.contains(symbol)
    }
}

struct Worker {
    tx: Sender<Delivery>,
    handle: JoinHandle<()>,
    thread_id: ThreadId,
}

#[derive(Default)]
struct FeedState {
    worker: Option<Worker>,
    subscriptions: AHashMap<FeedSubscriptionId, SimSubscription>,
    next_id: FeedSubscriptionId,
    reject_next_subscribe: Option<FeedError>,
}

pub struct SimulatedFeed {
    address: String,
    properties: HashMap<String, String>,
    state: Mutex<FeedState>,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
}

impl SimulatedFeed {
    pub fn new(address: &str) -> Self {
        let mut properties = HashMap::new();
        properties.insert("address".to_string(), address.to_string());
        properties.insert("engine".to_string(), "simulated".to_string());
        Self {
            address: address.to_string(),
            properties,
            state: Mutex::new(FeedState::default()),
            subscribe_calls: AtomicUsize::new(0),
            unsubscribe_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    /// Deliver `events` to every live subscription that wants (symbol, kind).
    /// Events of different kinds are split into one batch per kind, keeping feed order.
    pub fn publish(&self, symbol: &Symbol, events: Vec<MarketEvent>) {
        self.publish_filtered(symbol, events, false, |_| true);
    }

    /// Deliver to snapshot subscriptions only; `complete` marks the end of the backfill.
    pub fn publish_snapshot(&self, symbol: &Symbol, events: Vec<MarketEvent>, complete: bool) {
        self.publish_filtered(symbol, events, complete, |sub| sub.request.snapshot);
    }

    /// Send a completion marker without payload to snapshot subscriptions for (symbol, kind).
    pub fn complete_snapshot(&self, symbol: &Symbol, kind: EventKind) {
        let state = self.state.lock();
        let Some(worker) = state.worker.as_ref() else { return };
        for (id, sub) in state.subscriptions.iter() {
            if sub.request.snapshot && sub.wants(symbol, kind) {
                let batch = EventBatch::new(symbol.clone(), kind, Vec::new()).completing();
                let _ = worker.tx.send(Delivery::Events(*id, batch));
            }
        }
    }

    /// Deliver a batch to one subscription, bypassing symbol/kind routing.
    pub fn deliver(&self, id: FeedSubscriptionId, batch: EventBatch) {
        let state = self.state.lock();
        if let Some(worker) = state.worker.as_ref() {
            let _ = worker.tx.send(Delivery::Events(id, batch));
        }
    }

    /// Report a fatal error to every subscription that includes `symbol`.
    pub fn fail_symbol(&self, symbol: &Symbol, error: FeedError) {
        let state = self.state.lock();
        let Some(worker) = state.worker.as_ref() else { return };
        for (id, sub) in state.subscriptions.iter() {
            if sub.symbols.contains(symbol) {
                warn!(id = *id, %symbol, %error, "Injecting subscription failure");
                let _ = worker.tx.send(Delivery::Error(*id, error.clone()));
            }
        }
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        let state = self.state.lock();
        if let Some(worker) = state.worker.as_ref() {
            let _ = worker.tx.send(Delivery::Status(status));
        }
    }

    /// Make the next `subscribe` call fail with `error`.
    pub fn reject_next_subscribe(&self, error: FeedError) {
        self.state.lock().reject_next_subscribe = Some(error);
    }

    /// Block until every delivery queued before this call has been handed to the sink.
    pub fn flush(&self) {
        let (tx, rx) = channel::bounded(1);
        {
            let state = self.state.lock();
            let Some(worker) = state.worker.as_ref() else { return };
            if worker.thread_id == thread::current().id() {
                return;
            }
            if worker.tx.send(Delivery::Barrier(tx)).is_err() {
                return;
            }
        }
        let _ = rx.recv();
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.unsubscribe_calls.load(Ordering::SeqCst)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    pub fn symbols_of(&self, id: FeedSubscriptionId) -> Vec<Symbol> {
        self.state
            .lock()
            .subscriptions
            .get(&id)
            .map(|sub| sub.symbols.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The request a live subscription was opened with.
    pub fn request_of(&self, id: FeedSubscriptionId) -> Option<FeedSubscribeRequest> {
        self.state.lock().subscriptions.get(&id).map(|sub| sub.request.clone())
    }

    fn publish_filtered(
        &self,
        symbol: &Symbol,
        events: Vec<MarketEvent>,
        complete: bool,
        accept: impl Fn(&SimSubscription) -> bool,
    ) {
        let mut by_kind: Vec<(EventKind, Vec<MarketEvent>)> = Vec::new();
        for event in events {
            let kind = event.kind();
            match by_kind.iter_mut().find(|(k, _)| *k == kind) {
                Some((_, bucket)) => bucket.push(event),
                None => by_kind.push((kind, vec![event])),
            }
        }

        let state = self.state.lock();
        let Some(worker) = state.worker.as_ref() else {
            debug!(%symbol, "Dropping publish on disconnected feed");
            return;
        };
        for (id, sub) in state.subscriptions.iter() {
            if !accept(sub) {
                continue;
            }
            for (kind, bucket) in &by_kind {
                if !sub.wants(symbol, *kind) {
                    continue;
                }
                let mut batch = EventBatch::new(symbol.clone(), *kind, bucket.clone());
                batch.snapshot_complete = complete;
                trace!(id = *id, %symbol, %kind, len = batch.len(), "Queueing delivery");
                let _ = worker.tx.send(Delivery::Events(*id, batch));
            }
        }
    }

    fn run_delivery(rx: Receiver<Delivery>, sink: Arc<dyn FeedSink>) {
        for delivery in rx {
            match delivery {
                Delivery::Events(id, batch) => sink.on_events(id, batch),
                Delivery::Error(id, error) => sink.on_subscription_error(id, error),
                Delivery::Status(status) => sink.on_status_change(status),
                Delivery::Barrier(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Simulated feed delivery thread exiting");
    }
}

impl FeedEngine for SimulatedFeed {
    fn connect(&self, sink: Arc<dyn FeedSink>) -> Result<(), FeedError> {
        let mut state = self.state.lock();
        if state.worker.is_some() {
            return Err(FeedError::Rejected("already connected".to_string()));
        }
        let (tx, rx) = channel::unbounded();
        let handle = thread::Builder::new()
            .name("sim-feed-delivery".to_string())
            .spawn(move || Self::run_delivery(rx, sink))
            .map_err(|e| FeedError::Fault(e.to_string()))?;
        let thread_id = handle.thread().id();
        let _ = tx.send(Delivery::Status(ConnectionStatus::Connected));
        state.worker = Some(Worker { tx, handle, thread_id });
        info!(address = %self.address, "Simulated feed connected");
        Ok(())
    }

    fn disconnect(&self) {
        let worker = {
            let mut state = self.state.lock();
            state.subscriptions.clear();
            state.worker.take()
        };
        let Some(Worker { tx, handle, thread_id }) = worker else { return };
        let _ = tx.send(Delivery::Status(ConnectionStatus::Disconnected));
        // Closing the channel lets the delivery thread drain and exit.
        drop(tx);
        if thread_id != thread::current().id() {
            let _ = handle.join();
        }
        info!(address = %self.address, "Simulated feed disconnected");
    }

    fn subscribe(&self, request: &FeedSubscribeRequest) -> Result<FeedSubscriptionId, FeedError> {
        let mut state = self.state.lock();
        if state.worker.is_none() {
            return Err(FeedError::NotConnected);
        }
        if let Some(error) = state.reject_next_subscribe.take() {
            return Err(error);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.subscriptions.insert(
            id,
            SimSubscription {
                request: request.clone(),
                symbols: request.symbols.iter().cloned().collect(),
            },
        );
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        debug!(id, snapshot = request.snapshot, "Simulated subscribe");
        Ok(id)
    }

    fn unsubscribe(&self, id: FeedSubscriptionId) -> Result<(), FeedError> {
        let removed = self.state.lock().subscriptions.remove(&id);
        match removed {
            Some(_) => {
                self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
                debug!(id, "Simulated unsubscribe");
                Ok(())
            }
            None => Err(FeedError::UnknownSubscription(id)),
        }
    }

    fn add_symbols(&self, id: FeedSubscriptionId, symbols: &[Symbol]) -> Result<(), FeedError> {
        let mut state = self.state.lock();
        let sub = state.subscriptions.get_mut(&id).ok_or(FeedError::UnknownSubscription(id))?;
        sub.symbols.extend(symbols.iter().cloned());
        Ok(())
    }

    fn remove_symbols(&self, id: FeedSubscriptionId, symbols: &[Symbol]) -> Result<(), FeedError> {
        let mut state = self.state.lock();
        let sub = state.subscriptions.get_mut(&id).ok_or(FeedError::UnknownSubscription(id))?;
        for symbol in symbols {
            sub.symbols.remove(symbol);
        }
        Ok(())
    }

    fn properties(&self) -> HashMap<String, String> {
        self.properties.clone()
    }

    fn connected_address(&self) -> Option<String> {
        self.state.lock().worker.as_ref().map(|_| self.address.clone())
    }
}

impl Drop for SimulatedFeed {
    fn drop(&mut self) {
        self.disconnect();
    }
}
