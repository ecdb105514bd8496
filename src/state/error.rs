use thiserror::Error;

/// Failures talking to the primary (durable) state store.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The store could not be reached at all.
    #[error("primary store unavailable: {0}")]
    Unavailable(String),

    /// The call did not finish before its deadline.
    #[error("primary store call timed out after {0} ms")]
    Timeout(u64),

    /// Any other error reported by the backend.
    #[error("primary store error: {0}")]
    Backend(String),
}

/// Errors surfaced by the state router.
#[derive(Error, Debug, Clone)]
pub enum RouterError {
    /// A primary write failed. The fallback copy was still updated.
    #[error("primary write failed: {0}")]
    Primary(#[from] StoreError),

    /// An invariant of the fallback path was violated.
    #[error("internal state error: {0}")]
    Internal(String),
}
