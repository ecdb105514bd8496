// =============================================================================
// Central Application State — MarketPulse
// =============================================================================
//
// Built once in `main` and shared with every handler via `Arc<AppState>`.
// Subsystems manage their own interior mutability; this struct only ties
// them together.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::runtime_config::RuntimeConfig;
use crate::service::IntradayService;
use crate::state::StateRouter;

pub struct AppState {
    /// Effective configuration after file and environment overrides.
    pub config: RuntimeConfig,
    pub router: Arc<StateRouter>,
    pub service: Arc<IntradayService>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        router: Arc<StateRouter>,
        service: Arc<IntradayService>,
    ) -> Self {
        Self {
            config,
            router,
            service,
            started_at: Utc::now(),
        }
    }

    /// Seconds since the process started serving.
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
