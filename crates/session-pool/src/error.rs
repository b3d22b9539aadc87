//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No credential is eligible right now. Retryable by the caller.
    #[error(
        "pool exhausted: {leased} of {total} sessions leased, {cooling} cooling down (concurrency limit {limit})"
    )]
    PoolExhausted {
        total: usize,
        leased: usize,
        cooling: usize,
        limit: usize,
    },
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
