//! In-process primary store used by unit tests across the crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::error::StoreError;
use super::primary::PrimaryStore;
use crate::indicators::IndicatorState;

/// Primary store backed by a map, with switchable failure modes.
#[derive(Default)]
pub struct FakePrimary {
    pub data: Mutex<HashMap<String, IndicatorState>>,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
    pub fail_probe: AtomicBool,
    /// Reads and writes sleep far past any test deadline.
    pub hang: AtomicBool,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
}

#[async_trait]
impl PrimaryStore for FakePrimary {
    async fn read(&self, symbol: &str) -> Result<Option<IndicatorState>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("read refused".into()));
        }
        Ok(self.data.lock().get(symbol).copied())
    }

    async fn write(&self, symbol: &str, state: &IndicatorState) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("write refused".into()));
        }
        self.data.lock().insert(symbol.to_string(), *state);
        Ok(())
    }

    async fn probe(&self) -> Result<(), StoreError> {
        if self.fail_probe.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}
