use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV bar as delivered by the upstream intraday feed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
    #[serde(rename = "v")]
    pub volume: f64,
}

impl Candle {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// A zero-volume bar whose OHLC are all `close`. Used to report the last
    /// known price when no fresh bars arrived.
    pub fn flat(timestamp: DateTime<Utc>, close: f64) -> Self {
        Self::new(timestamp, close, close, close, close, 0.0)
    }
}

/// Sort candles oldest-first. Stable, so equal timestamps keep feed order.
pub fn sort_chronological(candles: &mut [Candle]) {
    candles.sort_by_key(|c| c.timestamp);
}

/// Keep only candles strictly newer than `since`. `None` keeps everything.
pub fn newer_than(candles: &[Candle], since: Option<DateTime<Utc>>) -> Vec<Candle> {
    match since {
        Some(ts) => candles.iter().filter(|c| c.timestamp > ts).copied().collect(),
        None => candles.to_vec(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
