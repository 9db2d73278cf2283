use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Opaque instrument identifier, e.g. "IBM" or "AAPL{=1m}".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn new(s: &str) -> Self {
        Symbol(Arc::from(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Symbol(Arc::from(s))
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    Trade,
    TradeEth,
    Quote,
    Summary,
    Profile,
    Order,
    SpreadOrder,
    TimeAndSale,
    Candle,
    Greeks,
    TheoPrice,
    Underlying,
    Series,
}

impl EventKind {
    pub const ALL: [EventKind; 13] = [
        EventKind::Trade,
        EventKind::TradeEth,
        EventKind::Quote,
        EventKind::Summary,
        EventKind::Profile,
        EventKind::Order,
        EventKind::SpreadOrder,
        EventKind::TimeAndSale,
        EventKind::Candle,
        EventKind::Greeks,
        EventKind::TheoPrice,
        EventKind::Underlying,
        EventKind::Series,
    ];

    /// Kinds whose records carry an ordering index and can be requested by period.
    pub fn is_indexed(self) -> bool {
        matches!(
            self,
            EventKind::Order
                | EventKind::SpreadOrder
                | EventKind::TimeAndSale
                | EventKind::Candle
                | EventKind::Greeks
                | EventKind::Series
        )
    }

    pub fn is_order_like(self) -> bool {
        matches!(self, EventKind::Order | EventKind::SpreadOrder)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|k| k.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown event kind: {}", s))
    }
}

/// Small ordered set of event kinds a subscription is interested in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventKinds(SmallVec<[EventKind; 4]>);

impl EventKinds {
    pub fn new() -> Self {
        EventKinds(SmallVec::new())
    }

    pub fn single(kind: EventKind) -> Self {
        let mut kinds = EventKinds::new();
        kinds.insert(kind);
        kinds
    }

    /// Returns false when the kind was already present.
    pub fn insert(&mut self, kind: EventKind) -> bool {
        if self.contains(kind) {
            return false;
        }
        self.0.push(kind);
        true
    }

    pub fn contains(&self, kind: EventKind) -> bool {
        self.0.contains(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = EventKind> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<EventKind> for EventKinds {
    fn from_iter<I: IntoIterator<Item = EventKind>>(iter: I) -> Self {
        let mut kinds = EventKinds::new();
        for kind in iter {
            kinds.insert(kind);
        }
        kinds
    }
}

impl From<EventKind> for EventKinds {
    fn from(kind: EventKind) -> Self {
        EventKinds::single(kind)
    }
}

/// Order source (exchange or aggregation feed) used to narrow order-like subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderSource(Arc<str>);

impl OrderSource {
    pub fn new(name: &str) -> Self {
        OrderSource(Arc::from(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

// Per-exchange top of book. Prices and sizes are as decoded by the feed engine;
// a side with NaN price or zero size means the exchange has no quote on that side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub exchange_code: char,
    pub bid_price: f64,
    pub bid_size: f64,
    pub bid_time: i64,
    pub ask_price: f64,
    pub ask_size: f64,
    pub ask_time: i64,
}

impl Quote {
    pub fn new(exchange_code: char) -> Self {
        Quote {
            exchange_code,
            bid_price: f64::NAN,
            bid_size: 0.0,
            bid_time: 0,
            ask_price: f64::NAN,
            ask_size: 0.0,
            ask_time: 0,
        }
    }

    pub fn with_bid(mut self, price: f64, size: f64, time: i64) -> Self {
        self.bid_price = price;
        self.bid_size = size;
        self.bid_time = time;
        self
    }

    pub fn with_ask(mut self, price: f64, size: f64, time: i64) -> Self {
        self.ask_price = price;
        self.ask_size = size;
        self.ask_time = time;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub exchange_code: char,
    pub time: i64,
    pub price: f64,
    pub size: f64,
    pub day_volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub day_id: i32,
    pub day_open: f64,
    pub day_high: f64,
    pub day_low: f64,
    pub prev_day_close: f64,
    pub open_interest: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub description: String,
    pub high_limit: f64,
    pub low_limit: f64,
}

/// Order book entry. Also carries spread orders, where `spread_symbol` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub index: i64,
    pub time: i64,
    pub source: OrderSource,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub exchange_code: char,
    pub market_maker: Option<String>,
    pub spread_symbol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeAndSale {
    pub index: i64,
    pub time: i64,
    pub exchange_code: char,
    pub price: f64,
    pub size: f64,
    pub bid_price: f64,
    pub ask_price: f64,
    pub side: Option<Side>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub index: i64,
    pub time: i64,
    pub count: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Greeks {
    pub index: i64,
    pub time: i64,
    pub price: f64,
    pub volatility: f64,
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub rho: f64,
    pub vega: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TheoPrice {
    pub time: i64,
    pub price: f64,
    pub underlying_price: f64,
    pub delta: f64,
    pub gamma: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Underlying {
    pub volatility: f64,
    pub front_volatility: f64,
    pub back_volatility: f64,
    pub put_call_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub index: i64,
    pub time: i64,
    pub expiration: i32,
    pub volatility: f64,
    pub put_call_ratio: f64,
    pub forward_price: f64,
}

/// Decoded record handed over by the feed engine, owned by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MarketEvent {
    Trade(Trade),
    TradeEth(Trade),
    Quote(Quote),
    Summary(Summary),
    Profile(Profile),
    Order(Order),
    SpreadOrder(Order),
    TimeAndSale(TimeAndSale),
    Candle(Candle),
    Greeks(Greeks),
    TheoPrice(TheoPrice),
    Underlying(Underlying),
    Series(Series),
}

impl MarketEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MarketEvent::Trade(_) => EventKind::Trade,
            MarketEvent::TradeEth(_) => EventKind::TradeEth,
            MarketEvent::Quote(_) => EventKind::Quote,
            MarketEvent::Summary(_) => EventKind::Summary,
            MarketEvent::Profile(_) => EventKind::Profile,
            MarketEvent::Order(_) => EventKind::Order,
            MarketEvent::SpreadOrder(_) => EventKind::SpreadOrder,
            MarketEvent::TimeAndSale(_) => EventKind::TimeAndSale,
            MarketEvent::Candle(_) => EventKind::Candle,
            MarketEvent::Greeks(_) => EventKind::Greeks,
            MarketEvent::TheoPrice(_) => EventKind::TheoPrice,
            MarketEvent::Underlying(_) => EventKind::Underlying,
            MarketEvent::Series(_) => EventKind::Series,
        }
    }

    /// (index, time) for indexed records, None otherwise.
    pub fn index_and_time(&self) -> Option<(i64, i64)> {
        match self {
            MarketEvent::Order(o) | MarketEvent::SpreadOrder(o) => Some((o.index, o.time)),
            MarketEvent::TimeAndSale(t) => Some((t.index, t.time)),
            MarketEvent::Candle(c) => Some((c.index, c.time)),
            MarketEvent::Greeks(g) => Some((g.index, g.time)),
            MarketEvent::Series(s) => Some((s.index, s.time)),
            _ => None,
        }
    }

    pub fn order_source(&self) -> Option<&OrderSource> {
        match self {
            MarketEvent::Order(o) | MarketEvent::SpreadOrder(o) => Some(&o.source),
            _ => None,
        }
    }
}

/// A historical record that can be ordered by its feed-assigned index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedEvent {
    pub symbol: Symbol,
    pub index: i64,
    pub time: i64,
    pub event: MarketEvent,
}

impl IndexedEvent {
    pub fn from_event(symbol: Symbol, event: MarketEvent) -> Option<Self> {
        let (index, time) = event.index_and_time()?;
        Some(IndexedEvent { symbol, index, time, event })
    }
}

/// One delivery from the feed engine: events of a single kind for a single symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch {
    pub symbol: Symbol,
    pub kind: EventKind,
    pub events: Vec<MarketEvent>,
    /// Set on the last batch of a snapshot transmission.
    pub snapshot_complete: bool,
}

impl EventBatch {
    pub fn new(symbol: Symbol, kind: EventKind, events: Vec<MarketEvent>) -> Self {
        EventBatch { symbol, kind, events, snapshot_complete: false }
    }

    pub fn completing(mut self) -> Self {
        self.snapshot_complete = true;
        self
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
