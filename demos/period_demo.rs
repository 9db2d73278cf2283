// Period requests against the in-process feed: completion, timeout and cancellation.
// Run with: cargo run --example period_demo

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use mdx_rs::events::{EventKind, Symbol};
use mdx_rs::feed::simulated::SimulatedFeed;
use mdx_rs::feed::synthetic;
use mdx_rs::feed::FeedEngine;
use mdx_rs::{telemetry, Connection, DeadlinePolicy, MdxConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing("info,mdx_rs=debug");

    let feed = Arc::new(SimulatedFeed::new("sim:7300"));
    let connection = Connection::connect(feed.clone() as Arc<dyn FeedEngine>, MdxConfig::default())?;
    let symbol = Symbol::new("AAPL{=1m}");

    // 1. The feed marks the snapshot complete.
    let query = connection.get_data_for_period(EventKind::Candle, symbol.clone(), 0, 300_000, None)?;
    feed.publish_snapshot(&symbol, synthetic::history(EventKind::Candle, None, 0, 300_000, 60_000, 1), true);
    let candles = query.await?;
    println!("completed: {} candles", candles.len());

    // 2. No completion marker: the request times out and discards what it saw.
    let policy = DeadlinePolicy::with_timeout(Duration::from_millis(200));
    let query = connection.get_data_for_period(EventKind::Candle, symbol.clone(), 0, 300_000, Some(policy))?;
    feed.publish_snapshot(&symbol, synthetic::history(EventKind::Candle, None, 0, 120_000, 60_000, 2), false);
    println!("timeout: {:?}", query.await);

    // 3. Cancellation fires before the deadline.
    let token = CancellationToken::new();
    let policy = DeadlinePolicy::default().cancel_on(token.clone());
    let query = connection.get_data_for_period(EventKind::Candle, symbol.clone(), 0, 300_000, Some(policy))?;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });
    println!("cancelled: {:?}", query.await);

    connection.disconnect();
    Ok(())
}
