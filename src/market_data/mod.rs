pub mod candle;
pub mod feed;

// Re-export the Candle struct for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle::Candle;
pub use feed::{CandleSource, FeedClient};
