// Market data core
pub mod dispatch;       // feed callbacks -> subscription listeners
pub mod subscription;   // live (symbol, kind) interest with exactly-once close
pub mod regional_book;  // consolidated per-exchange quote book
pub mod period;         // bounded snapshot requests resolved through a future
