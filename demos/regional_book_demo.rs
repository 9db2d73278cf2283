// Regional book over the in-process feed: two exchanges quoting IBM merge on price.
// Run with: cargo run --example regional_book_demo

use std::sync::Arc;

use mdx_rs::events::{MarketEvent, Quote, Symbol};
use mdx_rs::feed::simulated::SimulatedFeed;
use mdx_rs::feed::FeedEngine;
use mdx_rs::market_data::regional_book::RegionalBookSnapshot;
use mdx_rs::{telemetry, Connection, MdxConfig};

fn print_levels(snapshot: &RegionalBookSnapshot) {
    println!("--- {} #{} ---", snapshot.symbol, snapshot.sequence);
    for level in snapshot.asks.iter().rev() {
        println!("          {:>10.2} x {:<8}", level.price, level.size);
    }
    for level in &snapshot.bids {
        println!("{:>8} x {:>10.2}", level.size, level.price);
    }
}

fn main() -> anyhow::Result<()> {
    telemetry::init_tracing("info");

    let feed = Arc::new(SimulatedFeed::new("sim:7300"));
    let connection = Connection::connect(feed.clone() as Arc<dyn FeedEngine>, MdxConfig::default())?;
    let book = connection.create_regional_book(
        "IBM",
        Some(Arc::new(print_levels)),
        Some(Arc::new(|symbol: &Symbol, quote: &Quote| {
            println!("quote {} {}: {:?}", symbol, quote.exchange_code, quote);
        })),
    )?;

    let ibm = Symbol::new("IBM");
    feed.publish(&ibm, vec![MarketEvent::Quote(Quote::new('N').with_bid(100.00, 300.0, 1).with_ask(100.05, 100.0, 1))]);
    feed.publish(&ibm, vec![MarketEvent::Quote(Quote::new('A').with_bid(100.00, 200.0, 2))]);
    // N pulls its bid: its earlier contribution disappears entirely.
    feed.publish(&ibm, vec![MarketEvent::Quote(Quote::new('N').with_ask(100.04, 50.0, 3))]);
    feed.flush();

    if let Some(last) = book.snapshot() {
        println!("{}", serde_json::to_string_pretty(&*last)?);
    }
    connection.disconnect();
    Ok(())
}
