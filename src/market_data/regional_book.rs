//! Consolidated multi-exchange view of one symbol, built from per-exchange quotes.

use std::collections::BTreeMap;
use std::sync::Arc;

use ordered_float::OrderedFloat;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, instrument, trace};

use crate::error::{invalid_argument, ConnectionResult};
use crate::events::{EventBatch, EventKind, EventKinds, MarketEvent, Quote, Symbol};
use crate::feed::{FeedEngine, FeedSubscribeRequest};
use crate::market_data::dispatch::{isolate, Dispatcher, EventListener};
use crate::market_data::subscription::Subscription;

pub trait RegionalBookListener: Send + Sync {
    fn on_book(&self, snapshot: &RegionalBookSnapshot);
}

impl<F> RegionalBookListener for F
where
    F: Fn(&RegionalBookSnapshot) + Send + Sync,
{
    fn on_book(&self, snapshot: &RegionalBookSnapshot) {
        self(snapshot)
    }
}

/// Receives every raw quote the book consumes, independently of the book listener.
pub trait QuoteListener: Send + Sync {
    fn on_quote(&self, symbol: &Symbol, quote: &Quote);
}

impl<F> QuoteListener for F
where
    F: Fn(&Symbol, &Quote) + Send + Sync,
{
    fn on_quote(&self, symbol: &Symbol, quote: &Quote) {
        self(symbol, quote)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
    /// Latest quote time among the exchanges contributing to this level.
    pub time: i64,
}

/// Immutable view emitted after each quote update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionalBookSnapshot {
    pub symbol: Symbol,
    pub sequence: u64,
    /// Descending by price.
    pub bids: Vec<PriceLevel>,
    /// Ascending by price.
    pub asks: Vec<PriceLevel>,
}

impl RegionalBookSnapshot {
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    pub fn spread(&self) -> Option<f64> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }
}

fn side_is_live(price: f64, size: f64) -> bool {
    price.is_finite() && price > 0.0 && size > 0.0
}

fn add_level(levels: &mut BTreeMap<OrderedFloat<f64>, PriceLevel>, price: f64, size: f64, time: i64) {
    levels
        .entry(OrderedFloat(price))
        .and_modify(|level| {
            level.size += size;
            level.time = level.time.max(time);
        })
        .or_insert(PriceLevel { price, size, time });
}

/// Aggregate the current per-exchange quotes into (bids, asks).
pub fn aggregate(quotes: &[Quote]) -> (Vec<PriceLevel>, Vec<PriceLevel>) {
    let mut bids = BTreeMap::new();
    let mut asks = BTreeMap::new();
    // Walk in exchange insertion order so equal-price merges are deterministic.
    for quote in quotes {
        if side_is_live(quote.bid_price, quote.bid_size) {
            add_level(&mut bids, quote.bid_price, quote.bid_size, quote.bid_time);
        }
        if side_is_live(quote.ask_price, quote.ask_size) {
            add_level(&mut asks, quote.ask_price, quote.ask_size, quote.ask_time);
        }
    }
    (bids.into_values().rev().collect(), asks.into_values().collect())
}

#[derive(Default)]
struct BookState {
    // One entry per exchange code, in first-seen order.
    quotes: Vec<Quote>,
    sequence: u64,
    last: Option<Arc<RegionalBookSnapshot>>,
    closed: bool,
}

struct BookCore {
    symbol: Symbol,
    state: Mutex<BookState>,
    book_listener: Option<Arc<dyn RegionalBookListener>>,
    quote_listener: Option<Arc<dyn QuoteListener>>,
}

impl BookCore {
    fn new(
        symbol: Symbol,
        book_listener: Option<Arc<dyn RegionalBookListener>>,
        quote_listener: Option<Arc<dyn QuoteListener>>,
    ) -> Self {
        Self { symbol, state: Mutex::new(BookState::default()), book_listener, quote_listener }
    }

    /// Fold one quote into the book. Returns None once the book is closed.
    fn apply(&self, quote: &Quote) -> Option<Arc<RegionalBookSnapshot>> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        match state.quotes.iter_mut().find(|q| q.exchange_code == quote.exchange_code) {
            Some(slot) => *slot = quote.clone(),
            None => state.quotes.push(quote.clone()),
        }
        let (bids, asks) = aggregate(&state.quotes);
        state.sequence += 1;
        let snapshot = Arc::new(RegionalBookSnapshot {
            symbol: self.symbol.clone(),
            sequence: state.sequence,
            bids,
            asks,
        });
        state.last = Some(snapshot.clone());
        Some(snapshot)
    }

    fn on_quote(&self, quote: &Quote) {
        let Some(snapshot) = self.apply(quote) else { return };
        trace!(
            symbol = %self.symbol,
            exchange = %quote.exchange_code,
            sequence = snapshot.sequence,
            bids = snapshot.bids.len(),
            asks = snapshot.asks.len(),
            "Regional book recomputed"
        );
        metrics::counter!("mdx_book_updates_total").increment(1);
        if let Some(listener) = &self.book_listener {
            isolate("regional_book", || listener.on_book(&snapshot));
        }
        if let Some(listener) = &self.quote_listener {
            isolate("quote", || listener.on_quote(&self.symbol, quote));
        }
    }

    fn discard(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.quotes.clear();
        state.last = None;
    }
}

impl EventListener for BookCore {
    fn on_events(&self, batch: &EventBatch) {
        for event in &batch.events {
            if let MarketEvent::Quote(quote) = event {
                self.on_quote(quote);
            }
        }
    }

    fn on_closed(&self) {
        self.discard();
    }
}

/// Live regional book for one symbol. Dropping it closes the underlying subscription.
pub struct RegionalBook {
    core: Arc<BookCore>,
    subscription: Subscription,
}

impl RegionalBook {
    #[instrument(level = "debug", skip(engine, dispatcher, book_listener, quote_listener), fields(symbol = %symbol))]
    pub(crate) fn open(
        engine: Arc<dyn FeedEngine>,
        dispatcher: Arc<Dispatcher>,
        symbol: Symbol,
        book_listener: Option<Arc<dyn RegionalBookListener>>,
        quote_listener: Option<Arc<dyn QuoteListener>>,
    ) -> ConnectionResult<Self> {
        if symbol.is_empty() {
            return Err(invalid_argument("regional book symbol must not be empty"));
        }
        let core = Arc::new(BookCore::new(symbol.clone(), book_listener, quote_listener));
        let request = FeedSubscribeRequest {
            symbols: vec![symbol.clone()],
            ..FeedSubscribeRequest::stream(EventKinds::single(EventKind::Quote))
        };
        let subscription = Subscription::open(engine, dispatcher, request, core.clone())?;
        info!(%symbol, id = subscription.id(), "Regional book created");
        Ok(RegionalBook { core, subscription })
    }

    pub fn symbol(&self) -> &Symbol {
        &self.core.symbol
    }

    /// Last emitted snapshot, None before the first quote or after close.
    pub fn snapshot(&self) -> Option<Arc<RegionalBookSnapshot>> {
        self.core.state.lock().last.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.subscription.is_closed()
    }

    pub fn close(&self) {
        self.subscription.close();
        self.core.discard();
        debug!(symbol = %self.core.symbol, "Regional book closed");
    }
}

impl Drop for RegionalBook {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::simulated::SimulatedFeed;
    use crate::feed::FeedSink;
    use proptest::prelude::*;

    fn bid_ask(code: char, bid: (f64, f64), ask: (f64, f64), time: i64) -> Quote {
        Quote::new(code).with_bid(bid.0, bid.1, time).with_ask(ask.0, ask.1, time)
    }

    fn core() -> BookCore {
        BookCore::new(Symbol::new("IBM"), None, None)
    }

    #[test]
    fn test_ibm_two_exchanges_merge_on_price() {
        let book = core();
        book.apply(&bid_ask('N', (100.00, 300.0), (100.05, 100.0), 1));
        let snapshot = book.apply(&Quote::new('A').with_bid(100.00, 200.0, 2)).unwrap();

        assert_eq!(snapshot.bids, vec![PriceLevel { price: 100.00, size: 500.0, time: 2 }]);
        assert_eq!(snapshot.asks, vec![PriceLevel { price: 100.05, size: 100.0, time: 1 }]);
        assert_eq!(snapshot.sequence, 2);
        assert!((snapshot.spread().unwrap() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_replacing_quote_drops_previous_contribution() {
        let book = core();
        book.apply(&bid_ask('N', (100.0, 300.0), (101.0, 50.0), 1));
        book.apply(&bid_ask('A', (99.5, 10.0), (101.0, 20.0), 1));
        let snapshot = book.apply(&bid_ask('N', (99.0, 70.0), (102.0, 5.0), 3)).unwrap();

        let bid_prices: Vec<f64> = snapshot.bids.iter().map(|l| l.price).collect();
        let ask_prices: Vec<f64> = snapshot.asks.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, vec![99.5, 99.0]);
        assert_eq!(ask_prices, vec![101.0, 102.0]);
        assert_eq!(snapshot.asks[0].size, 20.0);
    }

    #[test]
    fn test_withdrawn_side_contributes_nothing() {
        let book = core();
        book.apply(&bid_ask('N', (100.0, 300.0), (101.0, 50.0), 1));
        // Ask withdrawn: NaN price, zero size.
        let snapshot = book.apply(&Quote::new('N').with_bid(100.0, 300.0, 2)).unwrap();
        assert!(snapshot.asks.is_empty());
        assert_eq!(snapshot.best_bid().map(|l| l.size), Some(300.0));
        assert_eq!(snapshot.spread(), None);
    }

    #[test]
    fn test_closed_book_ignores_quotes() {
        let book = core();
        book.apply(&bid_ask('N', (100.0, 1.0), (101.0, 1.0), 1));
        book.discard();
        assert!(book.apply(&bid_ask('N', (100.0, 1.0), (101.0, 1.0), 2)).is_none());
        assert!(book.state.lock().last.is_none());
    }

    #[test]
    fn test_book_over_simulated_feed() {
        let feed = Arc::new(SimulatedFeed::new("sim:7300"));
        let dispatcher = Arc::new(Dispatcher::new());
        feed.connect(dispatcher.clone() as Arc<dyn FeedSink>).unwrap();

        let books = Arc::new(Mutex::new(Vec::new()));
        let quotes = Arc::new(Mutex::new(Vec::new()));
        let (seen_books, seen_quotes) = (books.clone(), quotes.clone());
        let book = RegionalBook::open(
            feed.clone() as Arc<dyn FeedEngine>,
            dispatcher.clone(),
            Symbol::new("IBM"),
            Some(Arc::new(move |snapshot: &RegionalBookSnapshot| seen_books.lock().push(snapshot.clone()))),
            Some(Arc::new(move |_symbol: &Symbol, quote: &Quote| seen_quotes.lock().push(quote.exchange_code))),
        )
        .unwrap();

        let symbol = Symbol::new("IBM");
        feed.publish(&symbol, vec![MarketEvent::Quote(bid_ask('N', (100.0, 300.0), (100.05, 100.0), 1))]);
        feed.publish(&symbol, vec![MarketEvent::Quote(Quote::new('A').with_bid(100.0, 200.0, 2))]);
        feed.flush();

        assert_eq!(books.lock().len(), 2);
        assert_eq!(*quotes.lock(), vec!['N', 'A']);
        let last = book.snapshot().unwrap();
        assert_eq!(last.bids[0].size, 500.0);

        book.close();
        assert!(book.snapshot().is_none());
        feed.publish(&symbol, vec![MarketEvent::Quote(bid_ask('Q', (1.0, 1.0), (2.0, 1.0), 3))]);
        feed.flush();
        assert_eq!(books.lock().len(), 2);
        assert_eq!(feed.active_subscriptions(), 0);
    }

    #[test]
    fn test_panicking_book_listener_keeps_state_and_quote_listener() {
        let book = BookCore::new(
            Symbol::new("IBM"),
            Some(Arc::new(|_snapshot: &RegionalBookSnapshot| panic!("book listener bug"))),
            Some(Arc::new(|_symbol: &Symbol, _quote: &Quote| {})),
        );
        book.on_quote(&bid_ask('N', (100.0, 1.0), (101.0, 1.0), 1));
        book.on_quote(&bid_ask('A', (100.0, 2.0), (101.0, 2.0), 1));
        let last = book.state.lock().last.clone().unwrap();
        assert_eq!(last.sequence, 2);
        assert_eq!(last.bids[0].size, 3.0);
    }

    #[test]
    fn test_empty_symbol_rejected() {
        let feed = Arc::new(SimulatedFeed::new("sim:7300"));
        let dispatcher = Arc::new(Dispatcher::new());
        feed.connect(dispatcher.clone() as Arc<dyn FeedSink>).unwrap();
        let result = RegionalBook::open(feed.clone() as Arc<dyn FeedEngine>, dispatcher, Symbol::new(""), None, None);
        assert!(matches!(result, Err(crate::error::ConnectionError::InvalidArgument(_))));
        assert_eq!(feed.subscribe_calls(), 0);
    }

    fn quote_strategy() -> impl Strategy<Value = Quote> {
        // Quarter-point prices on a narrow grid so exchanges collide on levels.
        (
            prop::sample::select(vec!['A', 'B', 'N', 'Q', 'Z']),
            0u32..20,
            0u32..1000,
            0u32..20,
            0u32..1000,
            0i64..10_000,
        )
            .prop_map(|(code, bid_ticks, bid_size, ask_ticks, ask_size, time)| {
                Quote::new(code)
                    .with_bid(90.0 + bid_ticks as f64 * 0.25, bid_size as f64, time)
                    .with_ask(95.0 + ask_ticks as f64 * 0.25, ask_size as f64, time)
            })
    }

    proptest! {
        #[test]
        fn prop_levels_unique_and_sorted(quotes in prop::collection::vec(quote_strategy(), 1..60)) {
            let book = core();
            let mut last = None;
            for quote in &quotes {
                last = book.apply(quote);
            }
            let snapshot = last.unwrap();
            prop_assert!(snapshot.bids.windows(2).all(|w| w[0].price > w[1].price));
            prop_assert!(snapshot.asks.windows(2).all(|w| w[0].price < w[1].price));
            prop_assert!(snapshot.bids.iter().chain(&snapshot.asks).all(|l| l.size > 0.0));
        }

        #[test]
        fn prop_book_reflects_only_latest_quote_per_exchange(quotes in prop::collection::vec(quote_strategy(), 1..60)) {
            let book = core();
            for quote in &quotes {
                book.apply(quote);
            }
            let snapshot = book.state.lock().last.clone().unwrap();

            let mut latest: BTreeMap<char, &Quote> = BTreeMap::new();
            for quote in &quotes {
                latest.insert(quote.exchange_code, quote);
            }
            let expected_bid: f64 = latest.values().filter(|q| q.bid_size > 0.0).map(|q| q.bid_size).sum();
            let actual_bid: f64 = snapshot.bids.iter().map(|l| l.size).sum();
            prop_assert!((expected_bid - actual_bid).abs() < 1e-6);
            prop_assert_eq!(book.state.lock().quotes.len(), latest.len());
        }
    }
}
