//! Error types shared across the service.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Unified error type. Variants map onto how the error surfaces: validation
/// failures become HTTP 400, store failures 500 (or a writer retry),
/// configuration failures abort startup, and source errors stay inside the
/// harvester that produced them.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("source error: {0}")]
    Source(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<lapin::Error> for Error {
    fn from(e: lapin::Error) -> Self {
        Error::Source(e.to_string())
    }
}
