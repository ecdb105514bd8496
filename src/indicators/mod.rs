// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free indicator state machines. Nothing in here performs
// I/O; persistence of the running state is the state router's job.

pub mod rsi;

pub use rsi::{check_alert, Alert, IndicatorState, WarmupStatus, RSI_PERIOD, STABLE_COUNT};
