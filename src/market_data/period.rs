//! Bounded historical queries: open a snapshot subscription, accumulate until the feed marks
//! the snapshot complete, then resolve a future. Completion, deadline and cancellation race;
//! a compare-and-swap on the request status picks the single winner.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use ahash::AHashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{invalid_argument, ConnectionResult, FeedError, RequestError, RequestResult};
use crate::events::{EventBatch, EventKind, EventKinds, IndexedEvent, OrderSource, Symbol};
use crate::feed::{FeedEngine, FeedSubscribeRequest};
use crate::market_data::dispatch::{Dispatcher, EventListener};
use crate::market_data::subscription::Subscription;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestStatus {
    Pending,
    Completed,
    TimedOut,
    Cancelled,
    Failed,
}

impl RequestStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RequestStatus::Completed,
            2 => RequestStatus::TimedOut,
            3 => RequestStatus::Cancelled,
            4 => RequestStatus::Failed,
            _ => RequestStatus::Pending,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Completed => "completed",
            RequestStatus::TimedOut => "timed_out",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Failed => "failed",
        }
    }
}

/// When a period request gives up. Timeout, absolute deadline and cancellation compose;
/// whichever fires first terminates the request.
#[derive(Debug, Clone)]
pub struct DeadlinePolicy {
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
    idle: Option<Duration>,
}

impl Default for DeadlinePolicy {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl DeadlinePolicy {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout: Some(timeout), deadline: None, cancel: None, idle: None }
    }

    pub fn with_deadline(deadline: std::time::Instant) -> Self {
        Self { timeout: None, deadline: Some(Instant::from_std(deadline)), cancel: None, idle: None }
    }

    /// Cancellation only: the request waits until completion or `token` fires.
    pub fn cancellable(token: CancellationToken) -> Self {
        Self { timeout: None, deadline: None, cancel: Some(token), idle: None }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn deadline(mut self, deadline: std::time::Instant) -> Self {
        self.deadline = Some(Instant::from_std(deadline));
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Also treat `quiet` without deliveries, after at least one batch, as completion.
    pub fn complete_when_idle(mut self, quiet: Duration) -> Self {
        self.idle = Some(quiet);
        self
    }

    fn effective_deadline(&self, start: Instant) -> Option<Instant> {
        let by_timeout = self.timeout.map(|t| start + t);
        match (by_timeout, self.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// What to fetch: one symbol, one indexed event kind, an inclusive time range.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeQuery {
    pub symbol: Symbol,
    pub kind: EventKind,
    pub source: Option<OrderSource>,
    pub from: i64,
    pub to: i64,
}

enum Outcome {
    Completed,
    TimedOut { elapsed: Duration },
    Cancelled,
    Failed(String),
}

impl Outcome {
    fn status(&self) -> RequestStatus {
        match self {
            Outcome::Completed => RequestStatus::Completed,
            Outcome::TimedOut { .. } => RequestStatus::TimedOut,
            Outcome::Cancelled => RequestStatus::Cancelled,
            Outcome::Failed(_) => RequestStatus::Failed,
        }
    }
}

type ResultSender = oneshot::Sender<RequestResult<Vec<IndexedEvent>>>;

pub(crate) struct RequestState {
    key: u64,
    query: RangeQuery,
    status: AtomicU8,
    // Keyed by feed index: a repeated index replaces, iteration is index-ascending.
    events: Mutex<BTreeMap<i64, IndexedEvent>>,
    batches: AtomicUsize,
    subscription: Mutex<Option<Subscription>>,
    result_tx: Mutex<Option<ResultSender>>,
    activity: Notify,
    // Fired once a terminal state is reached; stops the deadline watcher.
    done: CancellationToken,
    registry: Weak<RequestRegistry>,
}

impl RequestState {
    pub(crate) fn status(&self) -> RequestStatus {
        RequestStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn is_pending(&self) -> bool {
        self.status() == RequestStatus::Pending
    }

    fn accept(&self, batch: &EventBatch) {
        if !self.is_pending() || batch.kind != self.query.kind {
            return;
        }
        {
            let mut events = self.events.lock();
            for event in &batch.events {
                if let Some(source) = &self.query.source {
                    if event.order_source() != Some(source) {
                        continue;
                    }
                }
                let Some(indexed) = IndexedEvent::from_event(batch.symbol.clone(), event.clone()) else {
                    continue;
                };
                if indexed.time < self.query.from || indexed.time > self.query.to {
                    continue;
                }
                events.insert(indexed.index, indexed);
            }
        }
        self.batches.fetch_add(1, Ordering::AcqRel);
        self.activity.notify_one();
        if batch.snapshot_complete {
            self.finish(Outcome::Completed);
        }
    }

    /// Move to a terminal state. Only the first caller wins; it closes the subscription
    /// and then resolves the future. Returns false for every later caller.
    fn finish(&self, outcome: Outcome) -> bool {
        let target = outcome.status();
        if self
            .status
            .compare_exchange(0, target as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.close();
        }

        // Partial data is dropped on every path except completion.
        let events = std::mem::take(&mut *self.events.lock());
        let accumulated = events.len();
        let result = match outcome {
            Outcome::Completed => Ok(events.into_values().collect::<Vec<_>>()),
            Outcome::TimedOut { elapsed } => {
                Err(RequestError::Timeout { elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX) })
            }
            Outcome::Cancelled => Err(RequestError::Cancelled),
            Outcome::Failed(reason) => Err(RequestError::ConnectionFailure(reason)),
        };
        match &result {
            Ok(_) => info!(symbol = %self.query.symbol, kind = %self.query.kind, count = accumulated, "Period request completed"),
            Err(error) => info!(symbol = %self.query.symbol, kind = %self.query.kind, discarded = accumulated, %error, "Period request ended"),
        }
        metrics::counter!("mdx_period_requests_total", "outcome" => target.as_str()).increment(1);

        if let Some(tx) = self.result_tx.lock().take() {
            let _ = tx.send(result);
        }
        self.done.cancel();
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.key);
        }
        true
    }
}

struct RequestListener(Weak<RequestState>);

impl EventListener for RequestListener {
    fn on_events(&self, batch: &EventBatch) {
        if let Some(state) = self.0.upgrade() {
            state.accept(batch);
        }
    }

    fn on_error(&self, error: &FeedError) {
        if let Some(state) = self.0.upgrade() {
            state.finish(Outcome::Failed(error.to_string()));
        }
    }

    // Closed from outside, e.g. connection shutdown.
    fn on_closed(&self) {
        if let Some(state) = self.0.upgrade() {
            state.finish(Outcome::Failed("subscription closed".to_string()));
        }
    }
}

/// In-flight requests of one connection.
#[derive(Default)]
pub(crate) struct RequestRegistry {
    next_key: AtomicU64,
    inflight: Mutex<AHashMap<u64, Weak<RequestState>>>,
}

impl RequestRegistry {
    fn insert(&self, state: &Arc<RequestState>) {
        self.inflight.lock().insert(state.key, Arc::downgrade(state));
    }

    fn remove(&self, key: u64) {
        self.inflight.lock().remove(&key);
    }

    pub(crate) fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Fail every pending request, e.g. when the connection goes away.
    pub(crate) fn fail_all(&self, reason: &str) {
        let pending: Vec<Arc<RequestState>> =
            self.inflight.lock().drain().filter_map(|(_, state)| state.upgrade()).collect();
        if !pending.is_empty() {
            warn!(count = pending.len(), reason, "Failing in-flight period requests");
        }
        for state in pending {
            state.finish(Outcome::Failed(reason.to_string()));
        }
    }
}

/// Future of a period request. The request runs whether or not it is polled; dropping it
/// before resolution cancels the request.
pub struct PeriodQuery {
    state: Arc<RequestState>,
    rx: oneshot::Receiver<RequestResult<Vec<IndexedEvent>>>,
}

impl PeriodQuery {
    pub fn status(&self) -> RequestStatus {
        self.state.status()
    }

    /// Cancel now. A no-op when the request already reached a terminal state.
    pub fn cancel(&self) {
        self.state.finish(Outcome::Cancelled);
    }
}

impl Future for PeriodQuery {
    type Output = RequestResult<Vec<IndexedEvent>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx
            .poll_unpin(cx)
            .map(|result| result.unwrap_or_else(|_| Err(RequestError::ConnectionFailure("request abandoned".to_string()))))
    }
}

impl Drop for PeriodQuery {
    fn drop(&mut self) {
        if self.state.finish(Outcome::Cancelled) {
            debug!(symbol = %self.state.query.symbol, "Period request dropped before resolution");
        }
    }
}

impl std::fmt::Debug for PeriodQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodQuery")
            .field("query", &self.state.query)
            .field("status", &self.status())
            .finish()
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn cancelled_opt(token: Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Races the deadline, cancellation token and idle timer against completion. Runs on the
/// runtime independently of the `PeriodQuery` and exits once the request is terminal.
async fn watch(state: Arc<RequestState>, policy: DeadlinePolicy, start: Instant) {
    let expired = sleep_until_opt(policy.effective_deadline(start));
    let cancelled = cancelled_opt(policy.cancel.clone());
    tokio::pin!(expired, cancelled);

    loop {
        let quiet = async {
            match policy.idle {
                Some(quiet) => tokio::time::sleep(quiet).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = state.done.cancelled() => break,
            _ = &mut expired => {
                state.finish(Outcome::TimedOut { elapsed: start.elapsed() });
                break;
            }
            _ = &mut cancelled => {
                state.finish(Outcome::Cancelled);
                break;
            }
            _ = state.activity.notified() => continue,
            _ = quiet => {
                if state.batches.load(Ordering::Acquire) > 0 {
                    state.finish(Outcome::Completed);
                    break;
                }
            }
        }
    }
    debug!(symbol = %state.query.symbol, status = state.status().as_str(), "Period request watcher finished");
}

/// Start a period request. Returns once the snapshot subscription is registered; the data
/// arrives through the returned future. Must be called within a tokio runtime, which runs
/// the deadline watcher.
#[instrument(level = "debug", skip(engine, dispatcher, registry, policy), fields(symbol = %query.symbol, kind = %query.kind))]
pub(crate) fn request_range(
    engine: Arc<dyn FeedEngine>,
    dispatcher: Arc<Dispatcher>,
    registry: &Arc<RequestRegistry>,
    query: RangeQuery,
    policy: DeadlinePolicy,
) -> ConnectionResult<PeriodQuery> {
    if query.symbol.is_empty() {
        return Err(invalid_argument("symbol must not be empty"));
    }
    if !query.kind.is_indexed() {
        return Err(invalid_argument(format!("{} records carry no index", query.kind)));
    }
    if query.from > query.to {
        return Err(invalid_argument(format!("from time {} is after to time {}", query.from, query.to)));
    }
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|_| invalid_argument("period requests must be made within a tokio runtime"))?;

    let start = Instant::now();
    let (tx, rx) = oneshot::channel();
    let state = Arc::new(RequestState {
        key: registry.next_key.fetch_add(1, Ordering::Relaxed),
        query: query.clone(),
        status: AtomicU8::new(RequestStatus::Pending as u8),
        events: Mutex::new(BTreeMap::new()),
        batches: AtomicUsize::new(0),
        subscription: Mutex::new(None),
        result_tx: Mutex::new(Some(tx)),
        activity: Notify::new(),
        done: CancellationToken::new(),
        registry: Arc::downgrade(registry),
    });

    let request = FeedSubscribeRequest {
        symbols: vec![query.symbol.clone()],
        kinds: EventKinds::single(query.kind),
        from_time: Some(query.from),
        to_time: Some(query.to),
        source: query.source.clone(),
        snapshot: true,
    };
    // Registered first so a completion racing the open removes a present entry.
    registry.insert(&state);
    {
        // Held across open so a completion racing registration finds the subscription to close.
        let mut slot = state.subscription.lock();
        let listener = Arc::new(RequestListener(Arc::downgrade(&state)));
        match Subscription::open(engine, dispatcher, request, listener) {
            Ok(subscription) => *slot = Some(subscription),
            Err(error) => {
                registry.remove(state.key);
                return Err(error);
            }
        }
    }
    info!(symbol = %query.symbol, kind = %query.kind, from = query.from, to = query.to, "Period request started");

    runtime.spawn(watch(state.clone(), policy, start));
    Ok(PeriodQuery { state, rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectionError;
    use crate::events::{Candle, MarketEvent, Order, Side};
    use crate::feed::simulated::SimulatedFeed;
    use crate::feed::FeedSink;

    struct Fixture {
        feed: Arc<SimulatedFeed>,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<RequestRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            let feed = Arc::new(SimulatedFeed::new("sim:7300"));
            let dispatcher = Arc::new(Dispatcher::new());
            feed.connect(dispatcher.clone() as Arc<dyn FeedSink>).unwrap();
            Fixture { feed, dispatcher, registry: Arc::new(RequestRegistry::default()) }
        }

        fn request(&self, query: RangeQuery, policy: DeadlinePolicy) -> ConnectionResult<PeriodQuery> {
            request_range(self.feed.clone() as Arc<dyn FeedEngine>, self.dispatcher.clone(), &self.registry, query, policy)
        }
    }

    fn candles(from: i64, to: i64) -> RangeQuery {
        RangeQuery { symbol: Symbol::new("AAPL{=1m}"), kind: EventKind::Candle, source: None, from, to }
    }

    fn candle(index: i64, time: i64) -> MarketEvent {
        MarketEvent::Candle(Candle { index, time, count: 1, open: 1.0, high: 2.0, low: 0.5, close: 1.5, volume: 100.0 })
    }

    fn order(index: i64, source: &str) -> MarketEvent {
        MarketEvent::Order(Order {
            index,
            time: 1_000 + index,
            source: OrderSource::new(source),
            side: Side::Buy,
            price: 10.0,
            size: 1.0,
            exchange_code: 'Q',
            market_maker: None,
            spread_symbol: None,
        })
    }

    #[tokio::test]
    async fn test_completion_resolves_sorted_and_closes_subscription() {
        let fx = Fixture::new();
        let query = fx.request(candles(1_000, 5_000), DeadlinePolicy::default()).unwrap();
        assert_eq!(query.status(), RequestStatus::Pending);
        assert_eq!(fx.feed.active_subscriptions(), 1);

        let symbol = Symbol::new("AAPL{=1m}");
        fx.feed.publish_snapshot(&symbol, vec![candle(3, 3_000), candle(1, 1_000), candle(9, 9_000)], false);
        fx.feed.publish_snapshot(&symbol, vec![candle(2, 2_000), candle(3, 3_500)], true);

        let events = query.await.unwrap();
        let indices: Vec<i64> = events.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        // Repeated index 3 keeps the later record.
        assert_eq!(events[2].time, 3_500);
        assert_eq!(fx.feed.active_subscriptions(), 0);
        assert_eq!(fx.registry.len(), 0);
    }

    #[tokio::test]
    async fn test_timeout_within_bound_and_subscription_closed() {
        let fx = Fixture::new();
        let started = std::time::Instant::now();
        let query = fx.request(candles(0, 10), DeadlinePolicy::with_timeout(Duration::from_millis(200))).unwrap();
        fx.feed.publish_snapshot(&Symbol::new("AAPL{=1m}"), vec![candle(1, 5)], false);

        let err = query.await.unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, RequestError::Timeout { elapsed_ms } if elapsed_ms >= 200));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");
        assert_eq!(fx.feed.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_cancel_beats_timeout() {
        let fx = Fixture::new();
        let token = CancellationToken::new();
        let query = fx.request(candles(0, 10), DeadlinePolicy::default().cancel_on(token.clone())).unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        assert_eq!(query.await.unwrap_err(), RequestError::Cancelled);
        assert_eq!(fx.feed.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_explicit_cancel_is_single_winner() {
        let fx = Fixture::new();
        let query = fx.request(candles(0, 10), DeadlinePolicy::default()).unwrap();
        query.cancel();
        query.cancel();
        assert_eq!(query.status(), RequestStatus::Cancelled);

        // A completion arriving afterwards does not change the outcome.
        fx.feed.publish_snapshot(&Symbol::new("AAPL{=1m}"), vec![candle(1, 5)], true);
        fx.feed.flush();
        assert_eq!(query.status(), RequestStatus::Cancelled);
        assert_eq!(query.await.unwrap_err(), RequestError::Cancelled);
        assert_eq!(fx.feed.unsubscribe_calls(), 1);
    }

    #[tokio::test]
    async fn test_feed_error_fails_request() {
        let fx = Fixture::new();
        let query = fx.request(candles(0, 10), DeadlinePolicy::default()).unwrap();
        fx.feed.fail_symbol(&Symbol::new("AAPL{=1m}"), FeedError::Fault("decoder reset".to_string()));

        let err = query.await.unwrap_err();
        assert!(matches!(err, RequestError::ConnectionFailure(ref reason) if reason.contains("decoder reset")));
        assert_eq!(fx.feed.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_drop_cancels_and_unsubscribes() {
        let fx = Fixture::new();
        let query = fx.request(candles(0, 10), DeadlinePolicy::default()).unwrap();
        let state = query.state.clone();
        drop(query);
        assert_eq!(state.status(), RequestStatus::Cancelled);
        assert_eq!(fx.feed.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_idle_completion_is_opt_in() {
        let fx = Fixture::new();
        let policy = DeadlinePolicy::default().complete_when_idle(Duration::from_millis(100));
        let query = fx.request(candles(0, 100), policy).unwrap();
        fx.feed.publish_snapshot(&Symbol::new("AAPL{=1m}"), vec![candle(2, 20), candle(1, 10)], false);

        let events = query.await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].index, 1);
    }

    #[tokio::test]
    async fn test_order_source_filter() {
        let fx = Fixture::new();
        let query = RangeQuery {
            symbol: Symbol::new("IBM"),
            kind: EventKind::Order,
            source: Some(OrderSource::new("NTV")),
            from: 0,
            to: 10_000,
        };
        let pending = fx.request(query, DeadlinePolicy::default()).unwrap();
        fx.feed.publish_snapshot(&Symbol::new("IBM"), vec![order(1, "NTV"), order(2, "DEX"), order(3, "NTV")], true);

        let events = pending.await.unwrap();
        let indices: Vec<i64> = events.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_invalid_range_rejected_synchronously() {
        let fx = Fixture::new();
        let err = fx.request(candles(10, 5), DeadlinePolicy::default()).unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidArgument(_)));
        assert_eq!(fx.feed.subscribe_calls(), 0);
    }

    #[tokio::test]
    async fn test_registry_fail_all() {
        let fx = Fixture::new();
        let first = fx.request(candles(0, 10), DeadlinePolicy::default()).unwrap();
        let second = fx.request(candles(0, 10), DeadlinePolicy::default()).unwrap();
        assert_eq!(fx.registry.len(), 2);

        fx.registry.fail_all("connection closed");
        assert!(matches!(first.await, Err(RequestError::ConnectionFailure(_))));
        assert!(matches!(second.await, Err(RequestError::ConnectionFailure(_))));
        assert_eq!(fx.feed.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_unpolled_request_times_out_and_unsubscribes() {
        let fx = Fixture::new();
        let query = fx.request(candles(0, 10), DeadlinePolicy::with_timeout(Duration::from_millis(50))).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(query.status(), RequestStatus::TimedOut);
        assert_eq!(fx.feed.active_subscriptions(), 0);
        assert_eq!(fx.registry.len(), 0);
        assert!(matches!(query.await, Err(RequestError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_unpolled_request_follows_token() {
        let fx = Fixture::new();
        let token = CancellationToken::new();
        let query = fx.request(candles(0, 10), DeadlinePolicy::cancellable(token.clone())).unwrap();
        token.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(query.status(), RequestStatus::Cancelled);
        assert_eq!(fx.feed.active_subscriptions(), 0);
        assert_eq!(query.await.unwrap_err(), RequestError::Cancelled);
    }

    #[tokio::test]
    async fn test_empty_completion_marker_resolves_accumulated() {
        let fx = Fixture::new();
        let query = fx.request(candles(0, 100), DeadlinePolicy::default()).unwrap();
        let symbol = Symbol::new("AAPL{=1m}");
        fx.feed.publish_snapshot(&symbol, vec![candle(1, 10), candle(2, 20)], false);
        fx.feed.complete_snapshot(&symbol, EventKind::Candle);

        let events = query.await.unwrap();
        let indices: Vec<i64> = events.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert_eq!(fx.feed.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_feed_rejection_surfaces_synchronously() {
        let fx = Fixture::new();
        fx.feed.reject_next_subscribe(FeedError::Rejected("no history entitlement".to_string()));
        let err = fx.request(candles(0, 10), DeadlinePolicy::default()).unwrap_err();

        assert!(matches!(err, ConnectionError::Feed(FeedError::Rejected(_))));
        assert_eq!(fx.dispatcher.route_count(), 0);
        assert_eq!(fx.registry.len(), 0);
        assert_eq!(fx.feed.active_subscriptions(), 0);
    }

    #[test]
    fn test_request_outside_runtime_rejected() {
        let fx = Fixture::new();
        let err = fx.request(candles(0, 10), DeadlinePolicy::default()).unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidArgument(_)));
        assert_eq!(fx.feed.subscribe_calls(), 0);
    }

    #[tokio::test]
    async fn test_non_indexed_kind_rejected() {
        let fx = Fixture::new();
        let query = RangeQuery { kind: EventKind::Quote, ..candles(0, 10) };
        let err = fx.request(query, DeadlinePolicy::default()).unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidArgument(_)));
    }

    #[test]
    fn test_policy_composition() {
        let start = Instant::now();
        let policy = DeadlinePolicy::with_timeout(Duration::from_secs(10))
            .deadline((start + Duration::from_secs(2)).into_std());
        assert_eq!(policy.effective_deadline(start), Some(start + Duration::from_secs(2)));
        assert_eq!(DeadlinePolicy::cancellable(CancellationToken::new()).effective_deadline(start), None);
        assert_eq!(DeadlinePolicy::default().effective_deadline(start), Some(start + DEFAULT_REQUEST_TIMEOUT));
    }
}
