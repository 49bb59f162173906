use thiserror::Error;

/// Errors surfaced by the AIO engine's public API.
///
/// Fatal durability failures (a failed WAL write, fsync, or generic write) are not represented
/// here: those are treated as unrecoverable and escalate through `panic!` after being logged,
/// matching the engine's own policy of never silently losing a durability guarantee.
#[derive(Error, Debug)]
pub enum AioError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no free I/O slots available after draining every provider context")]
    SlotsExhausted,

    #[error("reference is stale: slot was recycled")]
    StaleReference,

    #[error("no bounce buffers available")]
    BounceBuffersExhausted,

    #[error("provider error: {0}")]
    Provider(String),

    #[error("operation is not retryable: {0}")]
    NotRetryable(&'static str),

    #[error("invalid operation for current handle state: {0}")]
    InvalidState(&'static str),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AioError>;
