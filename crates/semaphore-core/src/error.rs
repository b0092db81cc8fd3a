use thiserror::Error;

/// Errors produced by the relay.
///
/// Recoverable errors (parse failures, unroutable envelopes) are handled at
/// the session that observed them and never escalate past it; `Config` is
/// only produced during startup and is fatal.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("routing error: {0}")]
    Routing(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RelayResult<T> = Result<T, RelayError>;
