// =============================================================================
// Fallback Store — capacity-bounded in-memory map of per-symbol state
// =============================================================================
//
// Thread safety:
//   - parking_lot::RwLock around the map: concurrent lookups across symbols,
//     exclusive access for insert / evict.
//   - Per-entry atomic access tick so LRU bookkeeping works under the read
//     lock.
//   - Locks are never held across an `.await`.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::IndicatorState;

/// Which entry to drop when the map grows past its capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Any entry other than the one just written (hash-map iteration order).
    #[default]
    Arbitrary,
    /// The least recently read or written entry other than the one just
    /// written.
    Lru,
}

impl std::str::FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arbitrary" => Ok(Self::Arbitrary),
            "lru" => Ok(Self::Lru),
            other => Err(format!("unknown eviction policy: {other}")),
        }
    }
}

/// Counters exposed for health reporting and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FallbackStats {
    pub entries: usize,
    pub initializations: u64,
    pub evictions: u64,
}

struct Entry {
    state: IndicatorState,
    last_access: AtomicU64,
}

pub struct FallbackStore {
    entries: RwLock<HashMap<String, Entry>>,
    max_symbols: usize,
    policy: EvictionPolicy,
    clock: AtomicU64,
    initializations: AtomicU64,
    evictions: AtomicU64,
}

impl FallbackStore {
    /// `max_symbols` is clamped to at least one resident symbol.
    pub fn new(max_symbols: usize, policy: EvictionPolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_symbols: max_symbols.max(1),
            policy,
            clock: AtomicU64::new(0),
            initializations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<IndicatorState> {
        let map = self.entries.read();
        map.get(symbol).map(|entry| {
            entry.last_access.store(self.tick(), Ordering::Relaxed);
            entry.state
        })
    }

    /// Return the resident state, inserting a zeroed one on a miss.
    ///
    /// Double-checked: the read lock serves hits, the write lock re-checks
    /// before inserting so two racing callers never both initialise.
    pub fn get_or_init(&self, symbol: &str) -> IndicatorState {
        if let Some(state) = self.get(symbol) {
            return state;
        }

        let mut map = self.entries.write();
        if let Some(existing) = map.get(symbol) {
            existing.last_access.store(self.tick(), Ordering::Relaxed);
            return existing.state;
        }

        let state = IndicatorState::default();
        map.insert(
            symbol.to_string(),
            Entry {
                state,
                last_access: AtomicU64::new(self.tick()),
            },
        );
        self.initializations.fetch_add(1, Ordering::Relaxed);
        debug!(symbol, "fallback state initialised");
        self.enforce_capacity(&mut map, symbol);
        state
    }

    /// Insert or overwrite `symbol`, then trim back to capacity.
    pub fn put(&self, symbol: &str, state: IndicatorState) {
        let mut map = self.entries.write();
        let tick = self.tick();
        match map.get_mut(symbol) {
            Some(entry) => {
                entry.state = state;
                entry.last_access.store(tick, Ordering::Relaxed);
            }
            None => {
                map.insert(
                    symbol.to_string(),
                    Entry {
                        state,
                        last_access: AtomicU64::new(tick),
                    },
                );
            }
        }
        self.enforce_capacity(&mut map, symbol);
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.entries.read().contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_symbols
    }

    pub fn stats(&self) -> FallbackStats {
        FallbackStats {
            entries: self.len(),
            initializations: self.initializations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop entries other than `keep` until the map fits.
    fn enforce_capacity(&self, map: &mut HashMap<String, Entry>, keep: &str) {
        while map.len() > self.max_symbols {
            let victim = match self.policy {
                EvictionPolicy::Arbitrary => map.keys().find(|k| k.as_str() != keep).cloned(),
                EvictionPolicy::Lru => map
                    .iter()
                    .filter(|(k, _)| k.as_str() != keep)
                    .min_by_key(|(_, e)| e.last_access.load(Ordering::Relaxed))
                    .map(|(k, _)| k.clone()),
            };
            let Some(victim) = victim else { break };
            map.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(evicted = %victim, kept = keep, policy = ?self.policy, "fallback capacity reached");
        }
    }
}

impl std::fmt::Debug for FallbackStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackStore")
            .field("entries", &self.len())
            .field("max_symbols", &self.max_symbols)
            .field("policy", &self.policy)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
