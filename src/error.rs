//! Crate-wide error type.

use std::io;

/// Errors surfaced by internal operations.
///
/// Per the error handling design, these never reach a client directly — callers log them and
/// either terminate startup, close the offending connection, or fall back to a default
/// behavior. User-visible failures stay limited to `404`, `429`, and TCP resets.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A configuration file was missing, malformed, or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// `ThreadPool::enqueue` was called after `stop()`.
    #[error("thread pool has been stopped")]
    PoolStopped,
}

/// Convenience alias for fallible operations within this crate.
pub type Result<T> = std::result::Result<T, Error>;
