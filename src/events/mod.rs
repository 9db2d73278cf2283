// Event model handed over by the feed engine
pub mod types;
pub mod time;
pub use types::*;
