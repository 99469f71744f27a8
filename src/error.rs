use std::io;
use thiserror::Error;

/// Central error type for the ravel server core.
///
/// Per-connection failures (bad requests, routing misses, broken pipes) are
/// not represented here; those resolve into HTTP error responses or a
/// disconnect of the single offending connection. `ServerError` covers the
/// conditions that abort startup or the event loop itself.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration file could not be read, parsed, or validated.
    #[error("config error: {0}")]
    Config(String),

    /// Socket setup (resolve/bind/listen) failed before the loop started.
    #[error("startup error: {0}")]
    Startup(String),
}

pub type ServerResult<T> = Result<T, ServerError>;
