// =============================================================================
// Per-symbol indicator state: primary store, in-memory fallback, and the
// router that chooses between them.
// =============================================================================

pub mod error;
pub mod memory;
pub mod primary;
pub mod redis_store;
pub mod router;
pub mod single_flight;

pub use error::{RouterError, StoreError};
pub use memory::{EvictionPolicy, FallbackStats, FallbackStore};
pub use primary::{PrimaryHealth, PrimaryStore};
pub use redis_store::RedisStore;
pub use router::{Resolved, StateOrigin, StateRouter};
pub use single_flight::SingleFlight;

#[cfg(test)]
pub(crate) mod testing;
