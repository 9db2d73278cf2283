// Feed engine boundary: what the core consumes from the transport/decoder layer.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::FeedError;
use crate::events::{EventBatch, EventKinds, OrderSource, Symbol};

pub type FeedSubscriptionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    NotConnected,
    Connected,
    Reconnecting,
    Disconnected,
}

/// What a subscription asks the feed engine for.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSubscribeRequest {
    pub symbols: Vec<Symbol>,
    pub kinds: EventKinds,
    /// Backfill events starting at this Unix-millisecond time.
    pub from_time: Option<i64>,
    /// Upper bound of a period snapshot, inclusive.
    pub to_time: Option<i64>,
    pub source: Option<OrderSource>,
    /// Snapshot subscriptions mark the final batch of the backfill with `snapshot_complete`.
    pub snapshot: bool,
}

impl FeedSubscribeRequest {
    pub fn stream(kinds: EventKinds) -> Self {
        FeedSubscribeRequest {
            symbols: Vec::new(),
            kinds,
            from_time: None,
            to_time: None,
            source: None,
            snapshot: false,
        }
    }
}

/// Callbacks the feed engine invokes on its own delivery thread(s).
pub trait FeedSink: Send + Sync {
    fn on_events(&self, id: FeedSubscriptionId, batch: EventBatch);

    /// Fatal, subscription-scoped failure.
    fn on_subscription_error(&self, id: FeedSubscriptionId, error: FeedError);

    fn on_status_change(&self, status: ConnectionStatus);
}

pub trait FeedEngine: Send + Sync {
    /// Attach the sink that receives every delivery of this engine.
    fn connect(&self, sink: Arc<dyn FeedSink>) -> Result<(), FeedError>;

    fn disconnect(&self);

    fn subscribe(&self, request: &FeedSubscribeRequest) -> Result<FeedSubscriptionId, FeedError>;

    fn unsubscribe(&self, id: FeedSubscriptionId) -> Result<(), FeedError>;

    fn add_symbols(&self, id: FeedSubscriptionId, symbols: &[Symbol]) -> Result<(), FeedError>;

    fn remove_symbols(&self, id: FeedSubscriptionId, symbols: &[Symbol]) -> Result<(), FeedError>;

    /// Point-in-time copy of the engine's connection properties.
    fn properties(&self) -> HashMap<String, String>;

    /// "host:port" of the current upstream, None while not connected.
    fn connected_address(&self) -> Option<String>;
}

pub mod simulated;
pub mod synthetic;
