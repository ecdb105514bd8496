// =============================================================================
// Runtime Configuration — JSON file plus environment overrides
// =============================================================================
//
// Every tunable lives here. The optional JSON file supplies a baseline; any
// environment variable (optionally from `.env`) overrides the matching field.
// All fields carry `#[serde(default)]` so adding a field never breaks loading
// an older file.
// =============================================================================

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::state::EvictionPolicy;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_upstream_url() -> String {
    "http://localhost:9000".to_string()
}

fn default_max_symbols_memory() -> usize {
    1000
}

fn default_store_timeout_ms() -> u64 {
    500
}

fn default_probe_interval_secs() -> u64 {
    5
}

fn default_rsi_low() -> f64 {
    30.0
}

fn default_rsi_high() -> f64 {
    70.0
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the MarketPulse service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Network -------------------------------------------------------------

    /// Address the HTTP API binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Primary store connection string.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Base URL of the intraday candle feed.
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,

    /// Bearer token required by authenticated endpoints. Empty rejects all.
    #[serde(default, skip_serializing)]
    pub api_token: String,

    // --- State cache ---------------------------------------------------------

    /// Maximum symbols resident in the in-memory fallback.
    #[serde(default = "default_max_symbols_memory")]
    pub max_symbols_memory: usize,

    /// Deadline for each primary-store round trip.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Seconds between primary-store health probes.
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    /// Which fallback entry to evict at capacity.
    #[serde(default)]
    pub eviction_policy: EvictionPolicy,

    /// Serialize read-compute-save per symbol in the intraday service.
    #[serde(default = "default_true")]
    pub serialize_updates: bool,

    // --- Alerts --------------------------------------------------------------

    /// Default oversold threshold when a request does not supply one.
    #[serde(default = "default_rsi_low")]
    pub rsi_low: f64,

    /// Default overbought threshold when a request does not supply one.
    #[serde(default = "default_rsi_high")]
    pub rsi_high: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            redis_url: default_redis_url(),
            upstream_url: default_upstream_url(),
            api_token: String::new(),
            max_symbols_memory: default_max_symbols_memory(),
            store_timeout_ms: default_store_timeout_ms(),
            probe_interval_secs: default_probe_interval_secs(),
            eviction_policy: EvictionPolicy::default(),
            serialize_updates: true,
            rsi_low: default_rsi_low(),
            rsi_high: default_rsi_high(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Unparseable values are ignored
    /// with a warning and the previous value is kept.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MARKETPULSE_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("REDIS_URL") {
            self.redis_url = v;
        }
        if let Some(v) = lookup("UPSTREAM_URL") {
            self.upstream_url = v;
        }
        if let Some(v) = lookup("MARKETPULSE_API_TOKEN") {
            self.api_token = v;
        }
        override_parsed(&lookup, "MAX_SYMBOLS_MEMORY", &mut self.max_symbols_memory);
        override_parsed(&lookup, "STORE_TIMEOUT_MS", &mut self.store_timeout_ms);
        override_parsed(&lookup, "PROBE_INTERVAL_SECS", &mut self.probe_interval_secs);
        override_parsed(&lookup, "EVICTION_POLICY", &mut self.eviction_policy);
        override_parsed(&lookup, "SERIALIZE_UPDATES", &mut self.serialize_updates);
        override_parsed(&lookup, "RSI_LOW", &mut self.rsi_low);
        override_parsed(&lookup, "RSI_HIGH", &mut self.rsi_high);
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_symbols_memory == 0 {
            anyhow::bail!("max_symbols_memory must be positive");
        }
        if self.store_timeout_ms == 0 {
            anyhow::bail!("store_timeout_ms must be positive");
        }
        if self.probe_interval_secs == 0 {
            anyhow::bail!("probe_interval_secs must be positive");
        }
        if self.api_token.is_empty() {
            warn!("MARKETPULSE_API_TOKEN is not set — authenticated requests will be rejected");
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

fn override_parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else { return };
    match raw.trim().parse::<T>() {
        Ok(v) => *slot = v,
        Err(e) => warn!(key, value = %raw, error = %e, "ignoring invalid config override"),
    }
}
