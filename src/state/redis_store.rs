// =============================================================================
// Redis primary store — one hash per symbol
// =============================================================================
//
// Key:    symbol:{SYMBOL}:compact
// Fields: avg_gain, avg_loss, rsi_count, last_ts (RFC 3339), last_close,
//         prev_close, rsi, change_pct
//
// Floats are written with Rust's shortest round-trip formatting so a
// write/read cycle returns the exact same value. Unparseable fields decode to
// zero instead of failing the whole read. Writes run as one MULTI/EXEC so a
// reader never sees half a state.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, info, instrument};

use super::error::StoreError;
use super::primary::PrimaryStore;
use crate::indicators::IndicatorState;

pub struct RedisStore {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStore {
    /// Parse `url` (e.g. `redis://:password@127.0.0.1:6379/0`). No connection
    /// is made until the first call, so a dead server does not block startup.
    pub fn new(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    pub fn key_for(symbol: &str) -> String {
        format!("symbol:{symbol}:compact")
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let cached = self.conn.lock().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }
        let conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        info!("redis connection established");
        *self.conn.lock() = Some(conn.clone());
        Ok(conn)
    }

    /// Forget the cached connection after an I/O failure so the next call
    /// reconnects.
    fn reset_on_io(&self, err: &redis::RedisError) {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            *self.conn.lock() = None;
        }
    }

    fn map_err(&self, err: redis::RedisError) -> StoreError {
        self.reset_on_io(&err);
        if err.is_io_error() || err.is_connection_refusal() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

#[async_trait]
impl PrimaryStore for RedisStore {
    #[instrument(skip(self), level = "debug", name = "redis::read")]
    async fn read(&self, symbol: &str) -> Result<Option<IndicatorState>, StoreError> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = conn
            .hgetall(Self::key_for(symbol))
            .await
            .map_err(|e| self.map_err(e))?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(decode_state(&fields)))
    }

    #[instrument(skip(self, state), level = "debug", name = "redis::write")]
    async fn write(&self, symbol: &str, state: &IndicatorState) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        write_pipeline(&Self::key_for(symbol), state)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| self.map_err(e))?;
        debug!(symbol, count = state.count, "state written to redis");
        Ok(())
    }

    async fn probe(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(())
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connected", &self.conn.lock().is_some())
            .finish()
    }
}

// =============================================================================
// Field encoding
// =============================================================================

pub fn encode_state(state: &IndicatorState) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("avg_gain", state.avg_gain.to_string()),
        ("avg_loss", state.avg_loss.to_string()),
        ("rsi_count", state.count.to_string()),
        ("last_close", state.last_close.to_string()),
        ("prev_close", state.prev_close.to_string()),
        ("rsi", state.rsi.to_string()),
        ("change_pct", state.change_pct.to_string()),
    ];
    if let Some(ts) = state.last_ts {
        fields.push(("last_ts", ts.to_rfc3339()));
    }
    fields
}

/// One atomic write. `HSET` merges into the existing hash, so a state without
/// a cursor must also drop any `last_ts` left by an earlier write.
pub fn write_pipeline(key: &str, state: &IndicatorState) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();
    if state.last_ts.is_none() {
        pipe.hdel(key, "last_ts").ignore();
    }
    pipe.hset_multiple(key, encode_state(state).as_slice()).ignore();
    pipe
}

pub fn decode_state(fields: &HashMap<String, String>) -> IndicatorState {
    let float = |name: &str| -> f64 {
        fields
            .get(name)
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0)
    };

    IndicatorState {
        avg_gain: float("avg_gain"),
        avg_loss: float("avg_loss"),
        count: fields
            .get("rsi_count")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0),
        last_ts: fields
            .get("last_ts")
            .and_then(|v| DateTime::parse_from_rfc3339(v.trim_matches('"')).ok())
            .map(|ts| ts.with_timezone(&Utc)),
        last_close: float("last_close"),
        prev_close: float("prev_close"),
        rsi: float("rsi"),
        change_pct: float("change_pct"),
    }
}
