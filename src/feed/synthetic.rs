//! Synthetic market data for the simulated feed: random-walk quotes across a few exchanges
//! and evenly spaced historical records of any indexed kind.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::events::{
    Candle, EventKind, Greeks, MarketEvent, Order, OrderSource, Quote, Series, Side, TimeAndSale,
};

const EXCHANGES: [char; 5] = ['N', 'A', 'Q', 'Z', 'B'];
const TICK: f64 = 0.01;

pub struct QuoteGenerator {
    rng: StdRng,
    mid: f64,
    clock: i64,
}

impl QuoteGenerator {
    pub fn new(seed: u64, mid: f64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed), mid, clock: 0 }
    }

    /// Next quote from a random exchange. Occasionally one side is withdrawn.
    pub fn next_quote(&mut self) -> Quote {
        self.clock += self.rng.gen_range(1..50);
        self.mid = (self.mid + self.rng.gen_range(-3i32..=3) as f64 * TICK).max(TICK * 10.0);

        let code = EXCHANGES[self.rng.gen_range(0..EXCHANGES.len())];
        let half_spread = self.rng.gen_range(1..=5) as f64 * TICK;
        let bid = round_tick(self.mid - half_spread);
        let ask = round_tick(self.mid + half_spread);
        let mut quote = Quote::new(code);
        if self.rng.gen_bool(0.95) {
            quote = quote.with_bid(bid, self.rng.gen_range(1..=10) as f64 * 100.0, self.clock);
        }
        if self.rng.gen_bool(0.95) {
            quote = quote.with_ask(ask, self.rng.gen_range(1..=10) as f64 * 100.0, self.clock);
        }
        quote
    }
}

fn round_tick(price: f64) -> f64 {
    (price / TICK).round() * TICK
}

/// Records of `kind` every `step_ms` in `[from, to]`, indices counting up from 1.
/// Non-indexed kinds produce nothing.
pub fn history(
    kind: EventKind,
    source: Option<&OrderSource>,
    from: i64,
    to: i64,
    step_ms: i64,
    seed: u64,
) -> Vec<MarketEvent> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut price: f64 = 100.0;
    let source = source.cloned().unwrap_or_else(|| OrderSource::new("NTV"));
    let step = step_ms.max(1);

    let mut events = Vec::new();
    let mut index = 1;
    let mut time = from;
    while time <= to {
        let open = price;
        price = round_tick((price + rng.gen_range(-0.5..0.5)).max(1.0));
        let event = match kind {
            EventKind::Candle => MarketEvent::Candle(Candle {
                index,
                time,
                count: rng.gen_range(1..200),
                open,
                high: open.max(price) + TICK,
                low: open.min(price) - TICK,
                close: price,
                volume: rng.gen_range(100..10_000) as f64,
            }),
            EventKind::TimeAndSale => MarketEvent::TimeAndSale(TimeAndSale {
                index,
                time,
                exchange_code: EXCHANGES[rng.gen_range(0..EXCHANGES.len())],
                price,
                size: rng.gen_range(1..10) as f64 * 100.0,
                bid_price: price - TICK,
                ask_price: price + TICK,
                side: Some(if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell }),
            }),
            EventKind::Greeks => MarketEvent::Greeks(Greeks {
                index,
                time,
                price,
                volatility: rng.gen_range(0.1..0.6),
                delta: rng.gen_range(-1.0..1.0),
                gamma: rng.gen_range(0.0..0.1),
                theta: rng.gen_range(-0.2..0.0),
                rho: rng.gen_range(0.0..0.1),
                vega: rng.gen_range(0.0..0.3),
            }),
            EventKind::Series => MarketEvent::Series(Series {
                index,
                time,
                expiration: 19_000 + index as i32,
                volatility: rng.gen_range(0.1..0.6),
                put_call_ratio: rng.gen_range(0.5..1.5),
                forward_price: price,
            }),
            EventKind::Order | EventKind::SpreadOrder => {
                let order = Order {
                    index,
                    time,
                    source: source.clone(),
                    side: if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell },
                    price,
                    size: rng.gen_range(1..10) as f64 * 100.0,
                    exchange_code: 'Q',
                    market_maker: None,
                    spread_symbol: None,
                };
                if kind == EventKind::Order {
                    MarketEvent::Order(order)
                } else {
                    MarketEvent::SpreadOrder(order)
                }
            }
            _ => return Vec::new(),
        };
        events.push(event);
        index += 1;
        time += step;
    }
    events
}
