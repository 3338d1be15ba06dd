pub mod client;
pub mod rate_limit;

// Re-export the client surface (e.g. `use crate::broker::CandleSource`).
pub use client::{BrokerCandle, BrokerClient, CandleSource, Ohlc, PriceSides};
pub use rate_limit::TokenBucket;
