// =============================================================================
// State Router — primary store with an in-memory fallback
// =============================================================================
//
// Callers see one `get_or_update` / `save` interface. Behind it:
//
//   - Reads go to the primary while it is healthy. A hit is written straight
//     back (refresh). Any failure, timeout or miss falls through to the
//     fallback map instead of surfacing an error.
//   - The fallback path runs under single-flight per symbol, so a burst of
//     misses for one symbol creates exactly one zeroed state.
//   - Writes go to the primary while healthy (errors are returned) and always
//     to the fallback map, which keeps it warm for the next outage.
//
// Health is a flag flipped only by `probe()`. Per-call timeouts never change
// it.
//
// Ordering: `get_or_update -> compute -> save` is NOT serialized per symbol
// here. Two callers can read the same snapshot and the last `save` wins.
// Callers that need strict per-symbol consistency must serialize themselves
// (the intraday service does).
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, instrument};

use super::error::{RouterError, StoreError};
use super::memory::{EvictionPolicy, FallbackStats, FallbackStore};
use super::primary::{PrimaryHealth, PrimaryStore};
use super::single_flight::SingleFlight;
use crate::indicators::IndicatorState;

/// Where a resolved state came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StateOrigin {
    Primary,
    Fallback,
}

/// Outcome of [`StateRouter::get_or_update`].
#[derive(Debug, Clone)]
pub struct Resolved {
    pub state: IndicatorState,
    pub origin: StateOrigin,
    /// A primary failure that was absorbed on the way: a failed read that
    /// degraded to the fallback, or a failed refresh write after a hit.
    pub primary_error: Option<StoreError>,
}

pub struct StateRouter {
    primary: Arc<dyn PrimaryStore>,
    health: PrimaryHealth,
    memory: Arc<FallbackStore>,
    flights: SingleFlight<Result<IndicatorState, RouterError>>,
    timeout: Duration,
}

impl StateRouter {
    pub fn new(
        primary: Arc<dyn PrimaryStore>,
        max_symbols: usize,
        policy: EvictionPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            primary,
            health: PrimaryHealth::new(),
            memory: Arc::new(FallbackStore::new(max_symbols, policy)),
            flights: SingleFlight::new(),
            timeout,
        }
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Resolve the current state for `symbol` using the default deadline.
    pub async fn get_or_update(&self, symbol: &str) -> Result<Resolved, RouterError> {
        self.get_or_update_by(symbol, Instant::now() + self.timeout)
            .await
    }

    /// Like [`get_or_update`](Self::get_or_update) with a caller-supplied
    /// deadline for the primary round trips.
    #[instrument(skip(self, deadline), level = "debug", name = "state::get_or_update")]
    pub async fn get_or_update_by(
        &self,
        symbol: &str,
        deadline: Instant,
    ) -> Result<Resolved, RouterError> {
        let mut primary_error = None;

        if !self.health.is_down() {
            match self.within(deadline, self.primary.read(symbol)).await {
                Ok(Some(state)) => {
                    let refresh = self.within(deadline, self.primary.write(symbol, &state)).await;
                    if let Err(e) = &refresh {
                        debug!(symbol, error = %e, "primary refresh write failed");
                    }
                    return Ok(Resolved {
                        state,
                        origin: StateOrigin::Primary,
                        primary_error: refresh.err(),
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(symbol, error = %e, "primary read failed; using fallback");
                    primary_error = Some(e);
                }
            }
        }

        let state = self.fallback_get_or_init(symbol).await?;
        Ok(Resolved {
            state,
            origin: StateOrigin::Fallback,
            primary_error,
        })
    }

    // ── Writes ──────────────────────────────────────────────────────────

    /// Persist `state` using the default deadline.
    pub async fn save(&self, symbol: &str, state: &IndicatorState) -> Result<(), RouterError> {
        self.save_by(symbol, state, Instant::now() + self.timeout)
            .await
    }

    /// Write to the primary (when healthy) and always to the fallback map.
    /// A primary failure is returned only after the fallback write is done.
    #[instrument(skip(self, state, deadline), level = "debug", name = "state::save")]
    pub async fn save_by(
        &self,
        symbol: &str,
        state: &IndicatorState,
        deadline: Instant,
    ) -> Result<(), RouterError> {
        let primary = if self.health.is_down() {
            Ok(())
        } else {
            self.within(deadline, self.primary.write(symbol, state)).await
        };

        self.memory.put(symbol, *state);

        primary.map_err(RouterError::from)
    }

    // ── Health ──────────────────────────────────────────────────────────

    /// Probe the primary and update the health flag from the outcome.
    pub async fn probe(&self) -> Result<(), StoreError> {
        let outcome = self
            .within(Instant::now() + self.timeout, self.primary.probe())
            .await;
        self.health.record_probe(&outcome);
        outcome
    }

    pub fn is_primary_down(&self) -> bool {
        self.health.is_down()
    }

    pub fn fallback_len(&self) -> usize {
        self.memory.len()
    }

    pub fn fallback_stats(&self) -> FallbackStats {
        self.memory.stats()
    }

    pub fn fallback_capacity(&self) -> usize {
        self.memory.capacity()
    }

    // ── Internal helpers ────────────────────────────────────────────────

    async fn fallback_get_or_init(&self, symbol: &str) -> Result<IndicatorState, RouterError> {
        let memory = self.memory.clone();
        let key = symbol.to_string();
        let state = self
            .flights
            .run(symbol, move || async move { Ok(memory.get_or_init(&key)) })
            .await?;

        if !is_sane(&state) {
            return Err(RouterError::Internal(format!(
                "fallback returned corrupt state for {symbol}"
            )));
        }
        Ok(state)
    }

    async fn within<T, F>(&self, deadline: Instant, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let budget = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(budget.as_millis() as u64)),
        }
    }
}

impl std::fmt::Debug for StateRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateRouter")
            .field("primary_down", &self.health.is_down())
            .field("memory", &self.memory)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn is_sane(state: &IndicatorState) -> bool {
    state.avg_gain.is_finite()
        && state.avg_loss.is_finite()
        && state.avg_gain >= 0.0
        && state.avg_loss >= 0.0
}

// =============================================================================
// Tests
// =============================================================================
