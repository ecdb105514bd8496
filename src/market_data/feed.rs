// =============================================================================
// Intraday Feed Client — AlphaVantage-style TIME_SERIES_INTRADAY
// =============================================================================
//
// The upstream returns one object whose series lives under a key that varies
// with the interval ("Time Series (5min)", "Time Series (1min)", ...). Every
// numeric value is a JSON string. Rows that fail to parse are skipped rather
// than failing the whole batch.
//
// Requests are spaced by a shared ticker so bursts of symbol lookups do not
// trip the upstream rate limit.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, instrument};

use super::candle::Candle;

/// Bars requested per call.
const TAIL_CANDLES: u32 = 200;
/// Per-request HTTP timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(8);
/// Minimum spacing between upstream requests.
const REQUEST_SPACING: Duration = Duration::from_millis(250);

const SERIES_PREFIX: &str = "Time Series (";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Anything that can produce candles for a symbol.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Candles strictly newer than `since`; `None` means full available
    /// history. No ordering guarantee.
    async fn fetch(&self, symbol: &str, since: Option<DateTime<Utc>>) -> Result<Vec<Candle>>;
}

/// HTTP client for the intraday endpoint.
pub struct FeedClient {
    client: reqwest::Client,
    base_url: String,
    spacer: Mutex<Interval>,
}

impl FeedClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build reqwest client")?;

        let mut spacer = tokio::time::interval(REQUEST_SPACING);
        spacer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(base_url, "FeedClient initialised");

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            spacer: Mutex::new(spacer),
        })
    }

    fn intraday_request(&self, symbol: &str) -> reqwest::RequestBuilder {
        let tail = TAIL_CANDLES.to_string();
        self.client
            .get(format!("{}/query", self.base_url))
            .query(&[
                ("function", "TIME_SERIES_INTRADAY"),
                ("symbol", symbol),
                ("interval", "5min"),
                ("apikey", "demo"),
                ("tail", tail.as_str()),
            ])
            .header(reqwest::header::ACCEPT, "application/json")
    }
}

#[async_trait]
impl CandleSource for FeedClient {
    #[instrument(skip(self), name = "feed::fetch")]
    async fn fetch(&self, symbol: &str, since: Option<DateTime<Utc>>) -> Result<Vec<Candle>> {
        self.spacer.lock().await.tick().await;

        let resp = self
            .intraday_request(symbol)
            .send()
            .await
            .context("intraday feed request failed")?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .context("failed to read intraday feed response")?;

        if !status.is_success() {
            anyhow::bail!("upstream {}: {}", status.as_u16(), body);
        }

        let candles = parse_intraday(&body, since)?;
        debug!(symbol, count = candles.len(), "intraday candles fetched");
        Ok(candles)
    }
}

impl std::fmt::Debug for FeedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Parsing
// =============================================================================

#[derive(Deserialize)]
struct RawCandle {
    #[serde(rename = "1. open")]
    open: String,
    #[serde(rename = "2. high")]
    high: String,
    #[serde(rename = "3. low")]
    low: String,
    #[serde(rename = "4. close")]
    close: String,
    #[serde(rename = "5. volume")]
    volume: String,
}

impl RawCandle {
    fn to_candle(&self, timestamp: DateTime<Utc>) -> Option<Candle> {
        Some(Candle::new(
            timestamp,
            self.open.trim().parse().ok()?,
            self.high.trim().parse().ok()?,
            self.low.trim().parse().ok()?,
            self.close.trim().parse().ok()?,
            self.volume.trim().parse().ok()?,
        ))
    }
}

/// Parse an intraday payload into candles newer than `since`, newest first.
pub fn parse_intraday(body: &str, since: Option<DateTime<Utc>>) -> Result<Vec<Candle>> {
    let root: serde_json::Value =
        serde_json::from_str(body).context("failed to parse intraday JSON")?;
    let obj = root
        .as_object()
        .context("intraday response is not an object")?;

    if let Some(err) = obj.get("error").and_then(|v| v.as_str()) {
        anyhow::bail!("upstream error: {err}");
    }
    if let Some(note) = obj.get("Note").and_then(|v| v.as_str()) {
        anyhow::bail!("upstream note: {note}");
    }

    let Some(series) = obj
        .iter()
        .find(|(k, _)| k.starts_with(SERIES_PREFIX))
        .map(|(_, v)| v)
    else {
        return Ok(Vec::new());
    };

    let rows = series
        .as_object()
        .context("time series is not an object")?;

    let mut out = Vec::with_capacity(rows.len());
    for (ts_str, raw) in rows {
        let Ok(naive) = NaiveDateTime::parse_from_str(ts_str, TIMESTAMP_FORMAT) else {
            continue;
        };
        let ts = naive.and_utc();
        if since.is_some_and(|s| ts <= s) {
            continue;
        }
        let Ok(raw) = serde_json::from_value::<RawCandle>(raw.clone()) else {
            continue;
        };
        if let Some(candle) = raw.to_candle(ts) {
            out.push(candle);
        }
    }

    out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(out)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SAMPLE: &str = r#"{
        "Meta Data": { "1. Information": "Intraday (5min)", "2. Symbol": "IBM" },
        "Time Series (5min)": {
            "2026-01-15 08:50:00": { "1. open": "101.0", "2. high": "102.0", "3. low": "100.5", "4. close": "101.5", "5. volume": "1200" },
            "2026-01-15 08:45:00": { "1. open": "100.0", "2. high": "101.2", "3. low": "99.8",  "4. close": "101.0", "5. volume": "900" },
            "2026-01-15 08:55:00": { "1. open": "101.5", "2. high": "101.9", "3. low": "101.1", "4. close": "101.7", "5. volume": "800" },
            "not a time":          { "1. open": "1", "2. high": "1", "3. low": "1", "4. close": "1", "5. volume": "1" },
            "2026-01-15 09:00:00": { "1. open": "x", "2. high": "1", "3. low": "1", "4. close": "1", "5. volume": "1" }
        }
    }"#;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, h, m, 0).unwrap()
    }

    #[test]
    fn parses_series_newest_first_and_skips_bad_rows() {
        let candles = parse_intraday(SAMPLE, None).unwrap();
        let stamps: Vec<_> = candles.iter().map(|c| c.timestamp).collect();
        assert_eq!(stamps, vec![ts(8, 55), ts(8, 50), ts(8, 45)]);
        assert_eq!(candles[1].close, 101.5);
        assert_eq!(candles[1].volume, 1200.0);
    }

    #[test]
    fn since_is_exclusive() {
        let candles = parse_intraday(SAMPLE, Some(ts(8, 50))).unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].timestamp, ts(8, 55));
    }

    #[test]
    fn interval_key_is_discovered() {
        let body = r#"{ "Time Series (1min)": {
            "2026-01-15 08:01:00": { "1. open": "1", "2. high": "2", "3. low": "0.5", "4. close": "1.5", "5. volume": "10" }
        } }"#;
        assert_eq!(parse_intraday(body, None).unwrap().len(), 1);
    }

    #[test]
    fn missing_series_is_empty() {
        let body = r#"{ "Meta Data": {} }"#;
        assert!(parse_intraday(body, None).unwrap().is_empty());
    }

    #[test]
    fn upstream_error_and_note_fail() {
        assert!(parse_intraday(r#"{ "error": "bad symbol" }"#, None).is_err());
        assert!(parse_intraday(r#"{ "Note": "rate limited" }"#, None).is_err());
        assert!(parse_intraday("[1, 2]", None).is_err());
        assert!(parse_intraday("not json", None).is_err());
    }

    #[tokio::test]
    async fn request_carries_encoded_query() {
        let client = FeedClient::new("http://localhost:9000/").unwrap();
        let req = client.intraday_request("BRK B&C").build().unwrap();

        assert_eq!(req.url().path(), "/query");
        let query: Vec<(String, String)> = req
            .url()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(query.contains(&("function".into(), "TIME_SERIES_INTRADAY".into())));
        assert!(query.contains(&("symbol".into(), "BRK B&C".into())));
        assert!(query.contains(&("tail".into(), "200".into())));
        assert!(!req.url().as_str().contains("BRK B&C"));
        assert_eq!(
            req.headers()[reqwest::header::ACCEPT],
            "application/json"
        );
    }
}
