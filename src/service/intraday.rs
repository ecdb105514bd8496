// =============================================================================
// Intraday Service — fetch, fold into RSI state, persist, report
// =============================================================================
//
// One request walks through:
//
//   1. Resolve the symbol's state through the router (primary or fallback).
//   2. Cold symbol (`count == 0`): pull full history and seed.
//   3. Pull candles newer than the cursor and apply them. A symbol that is
//      still unseeded skips this step and is retried on the next request.
//   4. Nothing new: report a flat "last known" candle so pollers always get
//      a price.
//   5. Save, then build the response with alert classification.
//
// Feed and save failures are logged and absorbed; the caller still gets the
// best state available. Only a bad request or a router invariant failure is
// returned as an error.
//
// With `serialize_updates` on, steps 1-5 hold a per-symbol async mutex so two
// requests for the same symbol cannot both read the same snapshot and lose
// one of the updates.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};

use crate::indicators::{check_alert, Alert, IndicatorState, WarmupStatus};
use crate::market_data::candle::sort_chronological;
use crate::market_data::{Candle, CandleSource};
use crate::runtime_config::RuntimeConfig;
use crate::state::{RouterError, StateOrigin, StateRouter};

// =============================================================================
// Request / Response
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IntradayRequest {
    pub symbol: String,
    /// Keep at most this many candles in the response. `0` means no limit.
    #[serde(default)]
    pub tail: Option<usize>,
    #[serde(default)]
    pub rsi_low: Option<f64>,
    #[serde(default)]
    pub rsi_high: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntradayResponse {
    pub symbol: String,
    /// Oldest first.
    pub candles: Vec<Candle>,
    pub rsi: f64,
    /// Percent change of the last candle applied by this request, else 0.
    pub change_pct: f64,
    pub alert: Alert,
    pub is_valid_rsi: bool,
    pub warmup_status: WarmupStatus,
    /// History size used for seeding during this request (0 if not seeded).
    pub seeded_candles: usize,
    pub rsi_count: u64,
    pub last_fetch: DateTime<Utc>,
    /// Where the state was resolved from at the start of the request.
    pub storage: StateOrigin,
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    State(#[from] RouterError),
}

// =============================================================================
// Per-symbol update locks
// =============================================================================

/// Async mutex per symbol. Entries are dropped once no caller holds or waits
/// on them, so the map only grows with concurrent distinct symbols.
#[derive(Default)]
struct SymbolLocks {
    inner: Mutex<HashMap<String, LockSlot>>,
}

struct LockSlot {
    lock: Arc<tokio::sync::Mutex<()>>,
    /// Holders plus waiters.
    users: usize,
}

/// Counts one user of a slot; dropping it (including when a waiter is
/// cancelled mid-acquire) releases the count.
struct Registration<'a> {
    locks: &'a SymbolLocks,
    symbol: String,
}

struct SymbolGuard<'a> {
    _held: OwnedMutexGuard<()>,
    _registration: Registration<'a>,
}

impl SymbolLocks {
    async fn acquire(&self, symbol: &str) -> SymbolGuard<'_> {
        let lock = {
            let mut map = self.inner.lock();
            let slot = map.entry(symbol.to_string()).or_insert_with(|| LockSlot {
                lock: Arc::default(),
                users: 0,
            });
            slot.users += 1;
            slot.lock.clone()
        };
        let registration = Registration {
            locks: self,
            symbol: symbol.to_string(),
        };
        let held = lock.lock_owned().await;
        SymbolGuard {
            _held: held,
            _registration: registration,
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut map = self.locks.inner.lock();
        if let Some(slot) = map.get_mut(&self.symbol) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                map.remove(&self.symbol);
            }
        }
    }
}

// =============================================================================
// IntradayService
// =============================================================================

pub struct IntradayService {
    router: Arc<StateRouter>,
    source: Arc<dyn CandleSource>,
    locks: Option<SymbolLocks>,
    default_low: f64,
    default_high: f64,
}

impl IntradayService {
    pub fn new(
        router: Arc<StateRouter>,
        source: Arc<dyn CandleSource>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            router,
            source,
            locks: config.serialize_updates.then(SymbolLocks::default),
            default_low: config.rsi_low,
            default_high: config.rsi_high,
        }
    }

    #[instrument(skip(self, req), fields(symbol = %req.symbol), name = "intraday::get")]
    pub async fn get_intraday(
        &self,
        req: &IntradayRequest,
    ) -> Result<IntradayResponse, ServiceError> {
        let symbol = normalize_symbol(&req.symbol)?;
        let low = threshold(req.rsi_low, self.default_low, "rsi_low")?;
        let high = threshold(req.rsi_high, self.default_high, "rsi_high")?;
        let tail = req.tail.filter(|&n| n > 0);

        let _guard = match &self.locks {
            Some(locks) => Some(locks.acquire(&symbol).await),
            None => None,
        };

        let resolved = self.router.get_or_update(&symbol).await?;
        if let Some(e) = &resolved.primary_error {
            warn!(symbol = %symbol, error = %e, "primary store degraded during read");
        }
        let mut state = resolved.state;

        let mut candles = Vec::new();
        let mut seeded_candles = 0;

        if state.count == 0 {
            if let Some((history, recent)) = self.seed(&symbol, &mut state, tail).await {
                seeded_candles = history;
                candles = recent;
            }
        }

        // Without a seeded cursor an incremental pass would fold the whole
        // history in from a zero close. Leave the symbol cold for next time.
        let applied = if state.count == 0 && seeded_candles == 0 {
            Vec::new()
        } else {
            match self.source.fetch(&symbol, state.last_ts).await {
                Ok(batch) => state.apply_new(&batch),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "incremental fetch failed");
                    Vec::new()
                }
            }
        };
        let change_pct = if applied.is_empty() { 0.0 } else { state.change_pct };
        if !applied.is_empty() {
            debug!(symbol = %symbol, applied = applied.len(), "incremental candles applied");
        }
        candles.extend(applied);

        if candles.is_empty() && state.count > 0 {
            candles.push(last_known_candle(&state));
        }

        if let Err(e) = self.router.save(&symbol, &state).await {
            warn!(symbol = %symbol, error = %e, "state save failed");
        }

        if let Some(n) = tail {
            if candles.len() > n {
                candles.drain(..candles.len() - n);
            }
        }

        Ok(IntradayResponse {
            symbol,
            candles,
            rsi: state.rsi,
            change_pct,
            alert: check_alert(state.rsi, low, high),
            is_valid_rsi: state.is_valid(),
            warmup_status: state.warmup_status(),
            seeded_candles,
            rsi_count: state.count,
            last_fetch: Utc::now(),
            storage: resolved.origin,
        })
    }

    /// Seed a cold state from full history. Returns the history size and the
    /// newest `tail` candles, oldest first, or `None` when nothing was seeded.
    async fn seed(
        &self,
        symbol: &str,
        state: &mut IndicatorState,
        tail: Option<usize>,
    ) -> Option<(usize, Vec<Candle>)> {
        let mut history = match self.source.fetch(symbol, None).await {
            Ok(h) if !h.is_empty() => h,
            Ok(_) => {
                debug!(symbol, "no history available to seed");
                return None;
            }
            Err(e) => {
                warn!(symbol, error = %e, "history fetch failed; seeding skipped");
                return None;
            }
        };

        state.seed(&history);
        if let Err(e) = self.router.save(symbol, state).await {
            warn!(symbol, error = %e, "seed save failed");
        }
        info!(symbol, candles = history.len(), rsi = state.rsi, "RSI seeded from history");

        let total = history.len();
        sort_chronological(&mut history);
        let keep = tail.map_or(total, |n| n.min(total));
        Some((total, history.split_off(total - keep)))
    }

    #[cfg(test)]
    fn held_locks(&self) -> usize {
        self.locks.as_ref().map_or(0, SymbolLocks::len)
    }
}

impl std::fmt::Debug for IntradayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntradayService")
            .field("serialize_updates", &self.locks.is_some())
            .field("default_low", &self.default_low)
            .field("default_high", &self.default_high)
            .finish()
    }
}

fn normalize_symbol(raw: &str) -> Result<String, ServiceError> {
    let symbol = raw.trim().to_ascii_uppercase();
    if symbol.is_empty() {
        return Err(ServiceError::InvalidRequest("symbol required".into()));
    }
    Ok(symbol)
}

fn threshold(value: Option<f64>, default: f64, name: &str) -> Result<f64, ServiceError> {
    match value {
        Some(v) if !v.is_finite() => Err(ServiceError::InvalidRequest(format!(
            "{name} must be a finite number"
        ))),
        Some(v) => Ok(v),
        None => Ok(default),
    }
}

fn last_known_candle(state: &IndicatorState) -> Candle {
    Candle::flat(state.last_ts.unwrap_or_default(), state.last_close)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::candle::newer_than;
    use crate::state::testing::FakePrimary;
    use crate::state::EvictionPolicy;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeSource {
        candles: Mutex<Vec<Candle>>,
        fail: AtomicBool,
        /// Fail this many upcoming fetches, then recover.
        fail_next: AtomicUsize,
        history_calls: AtomicUsize,
    }

    impl FakeSource {
        fn with_history(n: usize) -> Self {
            let source = Self::default();
            *source.candles.lock() = (0..n).map(candle_at).collect();
            source
        }

        fn push(&self, candle: Candle) {
            self.candles.lock().push(candle);
        }
    }

    #[async_trait]
    impl CandleSource for FakeSource {
        async fn fetch(
            &self,
            _symbol: &str,
            since: Option<DateTime<Utc>>,
        ) -> anyhow::Result<Vec<Candle>> {
            if since.is_none() {
                self.history_calls.fetch_add(1, Ordering::SeqCst);
            }
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("upstream 503");
            }
            let transient = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if transient {
                anyhow::bail!("upstream timeout");
            }
            let mut out = newer_than(&self.candles.lock(), since);
            // Feed order is newest first.
            out.reverse();
            Ok(out)
        }
    }

    fn ts(i: usize) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 9, 30, 0).unwrap()
            + ChronoDuration::minutes(5 * i as i64)
    }

    fn candle_at(i: usize) -> Candle {
        let close = 100.0 + (i % 5) as f64 - (i % 3) as f64 * 1.5;
        Candle::new(ts(i), close, close + 0.5, close - 0.5, close, 1000.0)
    }

    struct Harness {
        primary: Arc<FakePrimary>,
        router: Arc<StateRouter>,
        source: Arc<FakeSource>,
        service: IntradayService,
    }

    fn harness(source: FakeSource, serialize_updates: bool) -> Harness {
        let primary = Arc::new(FakePrimary::default());
        let router = Arc::new(StateRouter::new(
            primary.clone(),
            100,
            EvictionPolicy::Arbitrary,
            Duration::from_millis(100),
        ));
        let source = Arc::new(source);
        let config = RuntimeConfig {
            serialize_updates,
            ..Default::default()
        };
        let service = IntradayService::new(router.clone(), source.clone(), &config);
        Harness {
            primary,
            router,
            source,
            service,
        }
    }

    fn request(symbol: &str) -> IntradayRequest {
        IntradayRequest {
            symbol: symbol.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn cold_symbol_seeds_from_history() {
        let h = harness(FakeSource::with_history(30), true);
        let req = IntradayRequest {
            tail: Some(5),
            ..request("IBM")
        };

        let resp = h.service.get_intraday(&req).await.unwrap();

        assert_eq!(resp.seeded_candles, 30);
        assert_eq!(resp.rsi_count, 29);
        assert_eq!(resp.storage, StateOrigin::Fallback);
        assert_eq!(resp.candles.len(), 5);
        assert_eq!(resp.candles.last().unwrap().timestamp, ts(29));
        assert_eq!(resp.candles.first().unwrap().timestamp, ts(25));
        assert_eq!(resp.change_pct, 0.0);
        assert!(resp.is_valid_rsi);
        assert_eq!(resp.warmup_status, WarmupStatus::Warming);

        let stored = h.primary.data.lock().get("IBM").copied().unwrap();
        assert_eq!(stored.count, 29);
        assert_eq!(stored.last_ts, Some(ts(29)));
    }

    #[tokio::test]
    async fn warm_symbol_without_news_reports_last_known_candle() {
        let h = harness(FakeSource::with_history(20), true);
        h.service.get_intraday(&request("IBM")).await.unwrap();

        let resp = h.service.get_intraday(&request("IBM")).await.unwrap();
        assert_eq!(resp.storage, StateOrigin::Primary);
        assert_eq!(resp.seeded_candles, 0);
        assert_eq!(resp.candles.len(), 1);

        let flat = resp.candles[0];
        assert_eq!(flat.timestamp, ts(19));
        assert_eq!(flat.open, flat.close);
        assert_eq!(flat.volume, 0.0);
        assert_eq!(h.source.history_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn incremental_candle_is_applied_once() {
        let h = harness(FakeSource::with_history(20), true);
        let first = h.service.get_intraday(&request("IBM")).await.unwrap();

        let last_close = candle_at(19).close;
        h.source.push(Candle::flat(ts(20), last_close * 1.01));

        let resp = h.service.get_intraday(&request("IBM")).await.unwrap();
        assert_eq!(resp.rsi_count, first.rsi_count + 1);
        assert_eq!(resp.candles.len(), 1);
        assert_eq!(resp.candles[0].timestamp, ts(20));
        assert!((resp.change_pct - 1.0).abs() < 1e-9);

        let again = h.service.get_intraday(&request("IBM")).await.unwrap();
        assert_eq!(again.rsi_count, resp.rsi_count);
        assert_eq!(again.change_pct, 0.0);
    }

    #[tokio::test]
    async fn symbol_is_trimmed_and_uppercased() {
        let h = harness(FakeSource::with_history(3), true);
        let resp = h.service.get_intraday(&request("  msft ")).await.unwrap();
        assert_eq!(resp.symbol, "MSFT");
        assert!(h.primary.data.lock().contains_key("MSFT"));
    }

    #[tokio::test]
    async fn empty_symbol_is_rejected() {
        let h = harness(FakeSource::default(), true);
        let err = h.service.get_intraday(&request("   ")).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn non_finite_threshold_is_rejected() {
        let h = harness(FakeSource::default(), true);
        let req = IntradayRequest {
            rsi_high: Some(f64::NAN),
            ..request("IBM")
        };
        let err = h.service.get_intraday(&req).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn feed_failure_returns_unseeded_state() {
        let h = harness(FakeSource::with_history(30), true);
        h.source.fail.store(true, Ordering::SeqCst);

        let resp = h.service.get_intraday(&request("IBM")).await.unwrap();
        assert_eq!(resp.rsi_count, 0);
        assert_eq!(resp.seeded_candles, 0);
        assert!(resp.candles.is_empty());
        assert!(!resp.is_valid_rsi);
        assert_eq!(resp.warmup_status, WarmupStatus::Processing);
    }

    #[tokio::test]
    async fn failed_history_fetch_leaves_symbol_cold_until_next_request() {
        let h = harness(FakeSource::with_history(20), true);
        h.source.fail_next.store(1, Ordering::SeqCst);

        let resp = h.service.get_intraday(&request("IBM")).await.unwrap();
        assert_eq!(resp.rsi_count, 0);
        assert!(!resp.is_valid_rsi);
        assert!(resp.candles.is_empty());
        assert_eq!(h.primary.data.lock().get("IBM").unwrap().count, 0);

        let resp = h.service.get_intraday(&request("IBM")).await.unwrap();
        let mut expected = IndicatorState::default();
        expected.seed(&h.source.candles.lock());
        assert_eq!(resp.seeded_candles, 20);
        assert_eq!(resp.rsi_count, expected.count);
        assert!((resp.rsi - expected.rsi).abs() < 1e-12);
    }

    #[tokio::test]
    async fn primary_outage_is_served_from_fallback() {
        let h = harness(FakeSource::with_history(30), true);
        h.primary.fail_probe.store(true, Ordering::SeqCst);
        assert!(h.router.probe().await.is_err());

        let resp = h.service.get_intraday(&request("IBM")).await.unwrap();
        assert_eq!(resp.storage, StateOrigin::Fallback);
        assert_eq!(resp.rsi_count, 29);
        assert_eq!(h.primary.writes.load(Ordering::SeqCst), 0);

        let again = h.service.get_intraday(&request("IBM")).await.unwrap();
        assert_eq!(again.rsi_count, 29);
        assert_eq!(again.seeded_candles, 0);
    }

    #[tokio::test]
    async fn save_failure_is_not_fatal() {
        let h = harness(FakeSource::with_history(30), true);
        h.primary.fail_writes.store(true, Ordering::SeqCst);

        let resp = h.service.get_intraday(&request("IBM")).await.unwrap();
        assert_eq!(resp.rsi_count, 29);
        assert_eq!(h.router.fallback_len(), 1);
    }

    #[tokio::test]
    async fn thresholds_drive_alert() {
        let h = harness(FakeSource::with_history(30), true);
        let seeded = h.service.get_intraday(&request("IBM")).await.unwrap();

        let req = IntradayRequest {
            rsi_low: Some(seeded.rsi + 1.0),
            ..request("IBM")
        };
        let resp = h.service.get_intraday(&req).await.unwrap();
        assert_eq!(resp.alert, Alert::Oversold);

        let req = IntradayRequest {
            rsi_low: Some(0.0),
            rsi_high: Some(seeded.rsi - 1.0),
            ..request("IBM")
        };
        let resp = h.service.get_intraday(&req).await.unwrap();
        assert_eq!(resp.alert, Alert::Overbought);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cold_requests_seed_once_when_serialized() {
        let h = harness(FakeSource::with_history(30), true);
        let service = Arc::new(h.service);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.get_intraday(&request("IBM")).await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().rsi_count, 29);
        }

        assert_eq!(h.source.history_calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.held_locks(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_lock_entry() {
        let locks = SymbolLocks::default();
        let held = locks.acquire("IBM").await;

        let waiter = tokio::time::timeout(Duration::from_millis(10), locks.acquire("IBM")).await;
        assert!(waiter.is_err());
        assert_eq!(locks.len(), 1);

        drop(held);
        assert_eq!(locks.len(), 0);

        // The symbol is lockable again afterwards.
        let _again = locks.acquire("IBM").await;
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn unserialized_service_holds_no_locks() {
        let h = harness(FakeSource::with_history(5), false);
        h.service.get_intraday(&request("IBM")).await.unwrap();
        assert_eq!(h.service.held_locks(), 0);
    }
}
