// =============================================================================
// Relative Strength Index (RSI) — Incremental Wilder's Smoothing
// =============================================================================
//
// Unlike a batch RSI over a closes slice, the state here is carried between
// requests so a symbol never has to be re-scanned from full history.
//
// Step 1 — Seed average gain / average loss with the SMA of the first
//          `RSI_PERIOD` close-to-close changes.
// Step 2 — Every later candle applies Wilder's exponential smoothing:
//            avg_gain = (prev_avg_gain * (period - 1) + current_gain) / period
//            avg_loss = (prev_avg_loss * (period - 1) + current_loss) / period
// Step 3 — RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS)    (100 when avg_loss == 0)
//
// Every function here is total: no I/O, no error returns.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::market_data::candle::{newer_than, sort_chronological, Candle};

/// Look-back period for the seed and the smoothing factor.
pub const RSI_PERIOD: usize = 14;

/// Sample count at which an RSI reading is considered stable.
pub const STABLE_COUNT: u64 = 50;

const PERIOD_F: f64 = RSI_PERIOD as f64;

// =============================================================================
// State
// =============================================================================

/// Running RSI state for one symbol. This is the unit stored by the state
/// router, both in the primary store and in the in-memory fallback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorState {
    pub avg_gain: f64,
    pub avg_loss: f64,
    /// Candles incorporated since the last seed.
    #[serde(rename = "rsi_count")]
    pub count: u64,
    /// Timestamp of the last applied candle. `None` means nothing applied yet.
    pub last_ts: Option<DateTime<Utc>>,
    pub last_close: f64,
    pub prev_close: f64,
    pub rsi: f64,
    pub change_pct: f64,
}

/// Qualitative confidence label for an RSI value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmupStatus {
    /// Fewer than `RSI_PERIOD` samples, or no losses recorded yet.
    Processing,
    /// Valid but fewer than `STABLE_COUNT` samples.
    Warming,
    /// At least `STABLE_COUNT` samples.
    Stable,
    /// Enough samples but no down moves to compare against.
    Insufficient,
}

impl std::fmt::Display for WarmupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Processing => write!(f, "processing"),
            Self::Warming => write!(f, "warming"),
            Self::Stable => write!(f, "stable"),
            Self::Insufficient => write!(f, "insufficient"),
        }
    }
}

/// Threshold crossing reported alongside an RSI reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alert {
    Oversold,
    Overbought,
    None,
}

impl Alert {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oversold => "OVERSOLD",
            Self::Overbought => "OVERBOUGHT",
            Self::None => "",
        }
    }
}

impl std::fmt::Display for Alert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Alert {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// =============================================================================
// Engine operations
// =============================================================================

impl IndicatorState {
    /// `true` once the seed period is complete and at least one loss exists.
    pub fn is_valid(&self) -> bool {
        self.count >= RSI_PERIOD as u64 && self.avg_loss > 0.0
    }

    pub fn warmup_status(&self) -> WarmupStatus {
        if !self.is_valid() {
            return WarmupStatus::Processing;
        }
        // Unreachable while `is_valid` requires a positive loss; kept so the
        // label stays correct if validity is ever relaxed.
        if self.avg_loss == 0.0 {
            return WarmupStatus::Insufficient;
        }
        if self.count >= STABLE_COUNT {
            WarmupStatus::Stable
        } else {
            WarmupStatus::Warming
        }
    }

    /// Fold a single candle into the running averages.
    ///
    /// The very first sample after an empty state initialises the averages
    /// directly; every later sample is Wilder-smoothed. Returns `true` once
    /// `count >= RSI_PERIOD`.
    pub fn apply_one(&mut self, candle: &Candle) -> bool {
        self.prev_close = self.last_close;
        let change = candle.close - self.last_close;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);

        if self.count == 0 {
            self.avg_gain = gain;
            self.avg_loss = loss;
        } else {
            self.avg_gain = (self.avg_gain * (PERIOD_F - 1.0) + gain) / PERIOD_F;
            self.avg_loss = (self.avg_loss * (PERIOD_F - 1.0) + loss) / PERIOD_F;
        }
        self.count += 1;
        self.last_close = candle.close;
        self.last_ts = Some(candle.timestamp);
        self.refresh_derived();

        self.count >= RSI_PERIOD as u64
    }

    /// Reset and seed from a history batch (any order; sorted internally).
    ///
    /// With at least `RSI_PERIOD` candles the first `RSI_PERIOD` changes are
    /// averaged (SMA) and everything after the seed cursor is smoothed one
    /// candle at a time. Shorter batches go through [`apply_one`] only.
    ///
    /// [`apply_one`]: Self::apply_one
    pub fn seed(&mut self, candles: &[Candle]) {
        if candles.is_empty() {
            return;
        }

        let mut sorted = candles.to_vec();
        sort_chronological(&mut sorted);

        *self = Self::default();
        self.last_close = sorted[0].close;
        self.last_ts = Some(sorted[0].timestamp);

        if sorted.len() < RSI_PERIOD {
            for candle in &sorted[1..] {
                self.apply_one(candle);
            }
            return;
        }

        // SMA seed over changes 1..=RSI_PERIOD. A batch of exactly
        // RSI_PERIOD candles has one change fewer; the divisor stays fixed.
        let (sum_gain, sum_loss) = sorted
            .windows(2)
            .take(RSI_PERIOD)
            .fold((0.0_f64, 0.0_f64), |(g, l), w| {
                let change = w[1].close - w[0].close;
                (g + change.max(0.0), l + (-change).max(0.0))
            });
        self.avg_gain = sum_gain / PERIOD_F;
        self.avg_loss = sum_loss / PERIOD_F;
        self.count = RSI_PERIOD as u64;

        let cursor = RSI_PERIOD.min(sorted.len() - 1);
        self.prev_close = sorted[cursor - 1].close;
        self.last_close = sorted[cursor].close;
        self.last_ts = Some(sorted[cursor].timestamp);
        self.refresh_derived();

        for candle in sorted.iter().skip(RSI_PERIOD + 1) {
            self.apply_one(candle);
        }
    }

    /// Apply every candle strictly newer than `last_ts`, oldest first.
    /// Returns the candles that were applied.
    pub fn apply_new(&mut self, candles: &[Candle]) -> Vec<Candle> {
        let mut fresh = newer_than(candles, self.last_ts);
        sort_chronological(&mut fresh);
        fresh.dedup_by_key(|c| c.timestamp);
        for candle in &fresh {
            self.apply_one(candle);
        }
        fresh
    }

    fn refresh_derived(&mut self) {
        self.rsi = rsi_from_averages(self.avg_gain, self.avg_loss);
        self.change_pct = if self.prev_close != 0.0 {
            (self.last_close - self.prev_close) / self.prev_close * 100.0
        } else {
            0.0
        };
    }
}

/// Classify an RSI reading against caller-supplied thresholds. Oversold is
/// checked first, so it wins when `low >= high`.
pub fn check_alert(rsi: f64, low: f64, high: f64) -> Alert {
    if rsi <= low {
        Alert::Oversold
    } else if rsi >= high {
        Alert::Overbought
    } else {
        Alert::None
    }
}

// =============================================================================
// Internal helpers
// =============================================================================

/// Convert average gain / average loss into an RSI value in [0, 100].
/// No recorded losses reads as maximal strength.
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss > 0.0 {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    } else {
        100.0
    }
}
