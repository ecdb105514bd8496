use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{info, warn};

use super::error::StoreError;
use crate::indicators::IndicatorState;

/// Durable per-symbol state store sitting in front of the in-memory fallback.
///
/// Implementations should be last-write-wins; the router never relies on
/// transactions.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// `Ok(None)` means the symbol has never been written.
    async fn read(&self, symbol: &str) -> Result<Option<IndicatorState>, StoreError>;

    async fn write(&self, symbol: &str, state: &IndicatorState) -> Result<(), StoreError>;

    /// Cheap liveness check.
    async fn probe(&self) -> Result<(), StoreError>;
}

/// Binary up/down flag for the primary store.
///
/// Only [`record_probe`](Self::record_probe) changes it; ordinary reads and
/// writes that fail do not.
#[derive(Debug, Default)]
pub struct PrimaryHealth {
    down: AtomicBool,
}

impl PrimaryHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    /// Apply a probe outcome, logging transitions only.
    pub fn record_probe(&self, outcome: &Result<(), StoreError>) {
        match outcome {
            Ok(()) => {
                if self.down.swap(false, Ordering::AcqRel) {
                    info!("primary store recovered");
                }
            }
            Err(e) => {
                if !self.down.swap(true, Ordering::AcqRel) {
                    warn!(error = %e, "primary store marked down; serving from memory");
                }
            }
        }
    }
}
