//! Error types
//!
//! Only a missing or unparseable configuration document is fatal. Everything
//! else (probe failures, malformed entries, snapshot I/O) is absorbed and
//! reported as status data.

use std::path::PathBuf;
use std::time::Duration;

/// Fatal errors surfaced at engine construction or refresh
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("No configuration document found (searched: {searched:?})")]
    ConfigNotFound { searched: Vec<PathBuf> },

    #[error("Failed to read configuration document {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration document {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },
}

/// Why a single candidate probe did not succeed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("probe timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("unhealthy response: HTTP {0}")]
    Status(u16),

    #[error("no resolved bundle for descriptor '{0}'")]
    MissingBundle(String),

    #[error("bundle '{0}' is incomplete")]
    InvalidBundle(String),

    #[error("cannot probe: {0}")]
    Unsupported(String),
}
