// =============================================================================
// MarketPulse — incremental RSI service with a resilient state cache
// =============================================================================

pub mod api;
pub mod app_state;
pub mod indicators;
pub mod market_data;
pub mod runtime_config;
pub mod service;
pub mod state;
