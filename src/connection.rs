//! Application entry point: one connection to a feed engine, and the factory for everything
//! that consumes its data.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::config::MdxConfig;
use crate::error::{invalid_argument, ConnectionError, ConnectionResult};
use crate::events::{EventKind, EventKinds, OrderSource, Symbol};
use crate::feed::{ConnectionStatus, FeedEngine, FeedSink, FeedSubscribeRequest};
use crate::market_data::dispatch::{Dispatcher, EventListener, StatusListener};
use crate::market_data::period::{self, DeadlinePolicy, PeriodQuery, RangeQuery, RequestRegistry};
use crate::market_data::regional_book::{QuoteListener, RegionalBook, RegionalBookListener};
use crate::market_data::subscription::Subscription;

/// Kinds accepted by `get_data_for_period`.
pub const PERIOD_DATA_KINDS: [EventKind; 4] =
    [EventKind::TimeAndSale, EventKind::Candle, EventKind::Greeks, EventKind::Series];

/// Kinds accepted by `get_order_data_for_period`.
pub const PERIOD_ORDER_KINDS: [EventKind; 2] = [EventKind::Order, EventKind::SpreadOrder];

pub struct Connection {
    engine: Arc<dyn FeedEngine>,
    dispatcher: Arc<Dispatcher>,
    requests: Arc<RequestRegistry>,
    config: MdxConfig,
    connected: AtomicBool,
}

impl Connection {
    /// Attach to `engine` and start receiving deliveries.
    #[instrument(level = "info", skip(engine, config), fields(address = %config.feed_address))]
    pub fn connect(engine: Arc<dyn FeedEngine>, config: MdxConfig) -> ConnectionResult<Self> {
        let dispatcher = Arc::new(Dispatcher::new());
        engine.connect(dispatcher.clone() as Arc<dyn FeedSink>)?;
        info!(address = ?engine.connected_address(), "Connection established");
        Ok(Connection {
            engine,
            dispatcher,
            requests: Arc::new(RequestRegistry::default()),
            config,
            connected: AtomicBool::new(true),
        })
    }

    /// Close every subscription, book and in-flight request of this connection, then
    /// detach from the feed engine. Idempotent.
    #[instrument(level = "info", skip(self))]
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        self.requests.fail_all("connection closed");
        let live = self.dispatcher.live_subscriptions();
        if !live.is_empty() {
            info!(count = live.len(), "Closing subscriptions");
        }
        for core in live {
            core.close();
        }
        self.engine.disconnect();
        info!("Connection closed");
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn ensure_connected(&self) -> ConnectionResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected)
        }
    }

    fn open(&self, request: FeedSubscribeRequest, listener: Arc<dyn EventListener>) -> ConnectionResult<Subscription> {
        self.ensure_connected()?;
        Subscription::open(self.engine.clone(), self.dispatcher.clone(), request, listener)
    }

    /// Streaming subscription with no symbols yet; add them with `Subscription::add_symbols`.
    pub fn create_subscription<K, L>(&self, kinds: K, listener: L) -> ConnectionResult<Subscription>
    where
        K: Into<EventKinds>,
        L: EventListener + 'static,
    {
        self.open(FeedSubscribeRequest::stream(kinds.into()), Arc::new(listener))
    }

    /// Streaming subscription that first backfills events since `from_time` (Unix ms).
    pub fn create_time_subscription<K, L>(&self, kinds: K, from_time: i64, listener: L) -> ConnectionResult<Subscription>
    where
        K: Into<EventKinds>,
        L: EventListener + 'static,
    {
        let request = FeedSubscribeRequest { from_time: Some(from_time), ..FeedSubscribeRequest::stream(kinds.into()) };
        self.open(request, Arc::new(listener))
    }

    /// Raw snapshot subscription: the feed marks the last batch of the backfill from `time`
    /// with `snapshot_complete`.
    pub fn create_snapshot_subscription<L>(&self, kind: EventKind, time: i64, listener: L) -> ConnectionResult<Subscription>
    where
        L: EventListener + 'static,
    {
        let request = FeedSubscribeRequest {
            from_time: Some(time),
            snapshot: true,
            ..FeedSubscribeRequest::stream(EventKinds::single(kind))
        };
        self.open(request, Arc::new(listener))
    }

    pub fn create_regional_book(
        &self,
        symbol: impl Into<Symbol>,
        book_listener: Option<Arc<dyn RegionalBookListener>>,
        quote_listener: Option<Arc<dyn QuoteListener>>,
    ) -> ConnectionResult<RegionalBook> {
        self.ensure_connected()?;
        RegionalBook::open(
            self.engine.clone(),
            self.dispatcher.clone(),
            symbol.into(),
            book_listener,
            quote_listener,
        )
    }

    /// Historical records of an indexed kind in `[from, to]` (Unix ms, inclusive).
    /// Without a policy the configured request timeout applies.
    pub fn get_data_for_period(
        &self,
        kind: EventKind,
        symbol: impl Into<Symbol>,
        from: i64,
        to: i64,
        policy: Option<DeadlinePolicy>,
    ) -> ConnectionResult<PeriodQuery> {
        if !PERIOD_DATA_KINDS.contains(&kind) {
            return Err(invalid_argument(format!("{kind} cannot be requested by period")));
        }
        self.request(RangeQuery { symbol: symbol.into(), kind, source: None, from, to }, policy)
    }

    /// Order-book records from one order source in `[from, to]`.
    pub fn get_order_data_for_period(
        &self,
        kind: EventKind,
        source: OrderSource,
        symbol: impl Into<Symbol>,
        from: i64,
        to: i64,
        policy: Option<DeadlinePolicy>,
    ) -> ConnectionResult<PeriodQuery> {
        if !PERIOD_ORDER_KINDS.contains(&kind) {
            return Err(invalid_argument(format!("{kind} is not an order kind")));
        }
        if source.name().is_empty() {
            return Err(invalid_argument("order source must not be empty"));
        }
        self.request(RangeQuery { symbol: symbol.into(), kind, source: Some(source), from, to }, policy)
    }

    fn request(&self, query: RangeQuery, policy: Option<DeadlinePolicy>) -> ConnectionResult<PeriodQuery> {
        self.ensure_connected()?;
        let policy = policy.unwrap_or_else(|| DeadlinePolicy::with_timeout(self.config.request_timeout()));
        period::request_range(self.engine.clone(), self.dispatcher.clone(), &self.requests, query, policy)
    }

    pub fn properties(&self) -> HashMap<String, String> {
        let mut properties = self.engine.properties();
        for (key, value) in &self.config.properties {
            properties.entry(key.clone()).or_insert_with(|| value.clone());
        }
        properties
    }

    pub fn connected_address(&self) -> Option<String> {
        if self.is_connected() {
            self.engine.connected_address()
        } else {
            None
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.dispatcher.status()
    }

    /// Register a listener for this connection's status transitions.
    pub fn on_status_change<L: StatusListener + 'static>(&self, listener: L) {
        self.dispatcher.add_status_listener(Arc::new(listener));
    }

    pub fn open_subscriptions(&self) -> usize {
        self.dispatcher.route_count()
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn config(&self) -> &MdxConfig {
        &self.config
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.is_connected() {
            warn!("Connection dropped without disconnect");
            self.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RequestError;
    use crate::events::{Candle, EventBatch, MarketEvent, Quote};
    use crate::feed::simulated::SimulatedFeed;
    use crate::market_data::period::RequestStatus;
    use crate::market_data::regional_book::RegionalBookSnapshot;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn connect() -> (Arc<SimulatedFeed>, Connection) {
        let feed = Arc::new(SimulatedFeed::new("sim:7300").with_property("user", "tester"));
        let conn = Connection::connect(feed.clone() as Arc<dyn FeedEngine>, MdxConfig::default()).unwrap();
        (feed, conn)
    }

    fn candle(index: i64) -> MarketEvent {
        MarketEvent::Candle(Candle { index, time: index * 60_000, count: 1, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0 })
    }

    #[test]
    fn test_subscription_receives_published_quotes() {
        let (feed, conn) = connect();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let sub = conn
            .create_subscription(EventKind::Quote, move |batch: &EventBatch| {
                counter.fetch_add(batch.len(), Ordering::SeqCst);
            })
            .unwrap();
        sub.add_symbols(["IBM"]).unwrap();

        feed.publish(&"IBM".into(), vec![MarketEvent::Quote(Quote::new('N').with_bid(1.0, 1.0, 1))]);
        feed.flush();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(conn.open_subscriptions(), 1);
    }

    #[test]
    fn test_time_and_snapshot_subscriptions_carry_request_shape() {
        let (feed, conn) = connect();
        let timed = conn.create_time_subscription(EventKind::Trade, 1_000, |_batch: &EventBatch| {}).unwrap();
        let snap = conn.create_snapshot_subscription(EventKind::Candle, 2_000, |_batch: &EventBatch| {}).unwrap();

        let timed_req = feed.request_of(timed.id()).unwrap();
        assert_eq!(timed_req.from_time, Some(1_000));
        assert!(!timed_req.snapshot);
        let snap_req = feed.request_of(snap.id()).unwrap();
        assert_eq!(snap_req.from_time, Some(2_000));
        assert!(snap_req.snapshot);
    }

    #[test]
    fn test_empty_kinds_is_invalid_argument() {
        let (_feed, conn) = connect();
        let err = conn.create_subscription(EventKinds::new(), |_batch: &EventBatch| {}).unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidArgument(_)));
    }

    #[test]
    fn test_period_kind_validation() {
        let (_feed, conn) = connect();
        assert!(matches!(
            conn.get_data_for_period(EventKind::Quote, "IBM", 0, 10, None),
            Err(ConnectionError::InvalidArgument(_))
        ));
        assert!(matches!(
            conn.get_data_for_period(EventKind::Order, "IBM", 0, 10, None),
            Err(ConnectionError::InvalidArgument(_))
        ));
        assert!(matches!(
            conn.get_order_data_for_period(EventKind::Candle, OrderSource::new("NTV"), "IBM", 0, 10, None),
            Err(ConnectionError::InvalidArgument(_))
        ));
        assert!(matches!(
            conn.get_data_for_period(EventKind::Candle, "IBM", 10, 0, None),
            Err(ConnectionError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_period_request_through_connection() {
        let (feed, conn) = connect();
        let query = conn.get_data_for_period(EventKind::Candle, "AAPL{=1m}", 0, 600_000, None).unwrap();
        feed.publish_snapshot(&"AAPL{=1m}".into(), vec![candle(4), candle(2), candle(3)], true);

        let events = query.await.unwrap();
        assert_eq!(events.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(conn.open_subscriptions(), 0);
        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_closes_everything() {
        let (feed, conn) = connect();
        let sub = conn.create_subscription(EventKind::Quote, |_batch: &EventBatch| {}).unwrap();
        let book = conn.create_regional_book("IBM", None, None).unwrap();
        feed.publish(&"IBM".into(), vec![MarketEvent::Quote(Quote::new('N').with_bid(10.0, 1.0, 1))]);
        feed.flush();
        assert!(book.snapshot().is_some());
        let query = conn
            .get_data_for_period(EventKind::Candle, "IBM", 0, 10, Some(DeadlinePolicy::with_timeout(Duration::from_secs(30))))
            .unwrap();

        conn.disconnect();
        conn.disconnect();

        assert!(sub.is_closed());
        assert!(book.is_closed());
        assert!(book.snapshot().is_none());
        assert_eq!(query.status(), RequestStatus::Failed);
        assert!(matches!(query.await, Err(RequestError::ConnectionFailure(_))));
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert_eq!(conn.connected_address(), None);
        assert!(matches!(
            conn.create_subscription(EventKind::Quote, |_batch: &EventBatch| {}),
            Err(ConnectionError::NotConnected)
        ));
        // Closing after disconnect stays silent.
        sub.close();
        sub.add_symbols(["MSFT"]).unwrap();
    }

    #[test]
    fn test_status_listeners_are_per_connection() {
        let (feed, conn) = connect();
        let (other_feed, other) = connect();
        // Let the initial Connected notifications land first.
        feed.flush();
        other_feed.flush();
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let log = transitions.clone();
        conn.on_status_change(move |old: ConnectionStatus, new: ConnectionStatus| log.lock().push((old, new)));
        let other_calls = Arc::new(AtomicUsize::new(0));
        let other_seen = other_calls.clone();
        other.on_status_change(move |_old: ConnectionStatus, _new: ConnectionStatus| {
            other_seen.fetch_add(1, Ordering::SeqCst);
        });

        feed.set_status(ConnectionStatus::Reconnecting);
        feed.set_status(ConnectionStatus::Connected);
        feed.flush();

        assert_eq!(
            *transitions.lock(),
            vec![
                (ConnectionStatus::Connected, ConnectionStatus::Reconnecting),
                (ConnectionStatus::Reconnecting, ConnectionStatus::Connected),
            ]
        );
        assert_eq!(other_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_properties_and_address() {
        let (_feed, conn) = connect();
        let properties = conn.properties();
        assert_eq!(properties.get("user").map(String::as_str), Some("tester"));
        assert_eq!(properties.get("engine").map(String::as_str), Some("simulated"));
        assert_eq!(conn.connected_address().as_deref(), Some("sim:7300"));
    }

    #[test]
    fn test_regional_book_via_connection() {
        let (feed, conn) = connect();
        let emitted = Arc::new(Mutex::new(Vec::<RegionalBookSnapshot>::new()));
        let sink = emitted.clone();
        let _book = conn
            .create_regional_book(
                "IBM",
                Some(Arc::new(move |snapshot: &RegionalBookSnapshot| sink.lock().push(snapshot.clone()))),
                None,
            )
            .unwrap();
        feed.publish(
            &"IBM".into(),
            vec![
                MarketEvent::Quote(Quote::new('N').with_bid(100.0, 300.0, 1).with_ask(100.05, 100.0, 1)),
                MarketEvent::Quote(Quote::new('A').with_bid(100.0, 200.0, 2)),
            ],
        );
        feed.flush();

        let emitted = emitted.lock();
        let last = emitted.last().unwrap();
        assert_eq!(last.bids.len(), 1);
        assert_eq!(last.bids[0].size, 500.0);
        assert_eq!(last.asks[0].price, 100.05);
    }
}
