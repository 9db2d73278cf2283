use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use mdx_rs::events::time::{from_unix_millis, to_unix_millis};
use mdx_rs::events::{EventKind, MarketEvent, OrderSource, Symbol};
use mdx_rs::feed::simulated::SimulatedFeed;
use mdx_rs::feed::synthetic::{self, QuoteGenerator};
use mdx_rs::feed::{ConnectionStatus, FeedEngine};
use mdx_rs::market_data::regional_book::RegionalBookSnapshot;
use mdx_rs::{telemetry, Connection, DeadlinePolicy, MdxConfig};

#[derive(Parser)]
#[command(name = "mdx-rs")]
#[command(about = "Market data subscriptions, regional books and period requests over a simulated feed")]
#[command(version)]
struct Cli {
    /// Config file (TOML), `mdx.toml` when omitted. Missing file means defaults plus MDX_* environment.
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream random quotes for a symbol and print each regional book snapshot as JSON
    Book {
        symbol: String,

        /// Number of quotes to publish
        #[arg(short = 'n', long, default_value_t = 20)]
        updates: usize,

        #[arg(long, default_value_t = 50)]
        interval_ms: u64,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },

    /// Request historical records for a time range and print them as JSON
    Period {
        symbol: String,

        /// candle, timeandsale, greeks, series, order or spreadorder
        #[arg(short, long, default_value = "candle")]
        kind: EventKind,

        /// Order source, required for order kinds
        #[arg(short, long)]
        source: Option<String>,

        /// Range start, Unix ms or RFC 3339
        #[arg(short, long, default_value = "0", value_parser = parse_time)]
        from: i64,

        /// Range end, Unix ms or RFC 3339 (inclusive)
        #[arg(short, long, default_value = "600000", value_parser = parse_time)]
        to: i64,

        #[arg(long, default_value_t = 60_000)]
        step_ms: i64,

        /// Leave the snapshot incomplete so the request runs into its timeout
        #[arg(long)]
        never_complete: bool,

        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

fn parse_time(raw: &str) -> Result<i64, String> {
    if let Ok(millis) = raw.parse::<i64>() {
        return Ok(millis);
    }
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|time| to_unix_millis(time.with_timezone(&chrono::Utc)))
        .map_err(|e| format!("expected Unix ms or RFC 3339 time: {e}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => MdxConfig::load(path).with_context(|| format!("loading {path}"))?,
        None => MdxConfig::load_default().context("loading mdx.toml")?,
    };
    telemetry::init_tracing(&config.log_filter);
    telemetry::init_metrics(9000)?;

    let feed = Arc::new(SimulatedFeed::new(&config.feed_address));
    let connection = Connection::connect(feed.clone() as Arc<dyn FeedEngine>, config)?;
    connection.on_status_change(|old: ConnectionStatus, new: ConnectionStatus| {
        info!(?old, ?new, "Feed status");
    });

    let outcome = match cli.command {
        Commands::Book { symbol, updates, interval_ms, seed } => {
            run_book(&connection, &feed, Symbol::from(symbol), updates, interval_ms, seed).await
        }
        Commands::Period { symbol, kind, source, from, to, step_ms, never_complete, timeout_ms } => {
            let args = PeriodArgs { kind, source, from, to, step_ms, never_complete, timeout_ms };
            run_period(&connection, &feed, Symbol::from(symbol), args).await
        }
    };

    connection.disconnect();
    outcome
}

async fn run_book(
    connection: &Connection,
    feed: &SimulatedFeed,
    symbol: Symbol,
    updates: usize,
    interval_ms: u64,
    seed: u64,
) -> anyhow::Result<()> {
    let book = connection.create_regional_book(
        symbol.clone(),
        Some(Arc::new(|snapshot: &RegionalBookSnapshot| match serde_json::to_string(snapshot) {
            Ok(json) => println!("{json}"),
            Err(e) => warn!(error = %e, "Snapshot not serializable"),
        })),
        None,
    )?;

    let mut quotes = QuoteGenerator::new(seed, 100.0);
    for _ in 0..updates {
        feed.publish(&symbol, vec![MarketEvent::Quote(quotes.next_quote())]);
        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
    }
    feed.flush();

    if let Some(last) = book.snapshot() {
        info!(
            sequence = last.sequence,
            best_bid = ?last.best_bid().map(|l| l.price),
            best_ask = ?last.best_ask().map(|l| l.price),
            spread = ?last.spread(),
            "Final regional book"
        );
    }
    book.close();
    Ok(())
}

struct PeriodArgs {
    kind: EventKind,
    source: Option<String>,
    from: i64,
    to: i64,
    step_ms: i64,
    never_complete: bool,
    timeout_ms: Option<u64>,
}

async fn run_period(connection: &Connection, feed: &SimulatedFeed, symbol: Symbol, args: PeriodArgs) -> anyhow::Result<()> {
    let policy = args.timeout_ms.map(|ms| DeadlinePolicy::with_timeout(Duration::from_millis(ms)));
    let source = args.source.as_deref().map(OrderSource::new);
    let query = if args.kind.is_order_like() {
        let source = source.clone().context("--source is required for order kinds")?;
        connection.get_order_data_for_period(args.kind, source, symbol.clone(), args.from, args.to, policy)?
    } else {
        connection.get_data_for_period(args.kind, symbol.clone(), args.from, args.to, policy)?
    };

    // Serve a little more than asked for; out-of-range records are filtered by the request.
    let history = synthetic::history(
        args.kind,
        source.as_ref(),
        args.from - args.step_ms,
        args.to + args.step_ms,
        args.step_ms,
        7,
    );
    feed.publish_snapshot(&symbol, history, !args.never_complete);

    let events = query.await?;
    info!(
        count = events.len(),
        from = ?from_unix_millis(args.from),
        to = ?from_unix_millis(args.to),
        "Period request finished"
    );
    println!("{}", serde_json::to_string_pretty(&events)?);
    Ok(())
}
