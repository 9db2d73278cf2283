//! Client-side market data core: subscriptions over a feed engine, a consolidated
//! regional book, and bounded period requests resolved through futures.

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod feed;
pub mod market_data;
pub mod telemetry;

pub use config::MdxConfig;
pub use connection::Connection;
pub use error::{ConnectionError, FeedError, RequestError};
pub use market_data::period::{DeadlinePolicy, PeriodQuery, RequestStatus};
pub use market_data::regional_book::{PriceLevel, RegionalBook, RegionalBookSnapshot};
pub use market_data::subscription::Subscription;
