//! Error types for trialsync-engine.

use std::path::PathBuf;

use thiserror::Error;

use trialsync_core::ConfigError;

/// Errors that abort a run or fail a single trial.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Configuration could not be loaded or is invalid.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A JSON document (state file or trial document) could not be parsed.
    #[error("malformed JSON in {path}: {source}")]
    JsonFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// JSON serialization error (state files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The status feed could not be read as CSV.
    #[error("malformed status feed {path}: {source}")]
    Feed {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    /// The status feed lacks columns the planner depends on.
    #[error("status feed {path} is missing column(s): {columns}")]
    FeedColumns { path: PathBuf, columns: String },

    /// A required input directory or file is absent.
    #[error("{what} not found at {path}")]
    Missing { what: &'static str, path: PathBuf },

    /// A trial document is not a JSON object.
    #[error("trial document {path} is not a JSON object")]
    NotAnObject { path: PathBuf },

    /// The remote registry rejected or failed a request.
    #[error("registry error: {0}")]
    Client(#[from] ClientError),
}

/// Failures talking to the remote registry.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection, TLS, DNS, or timeout failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The `If-Match` token no longer matches the stored document.
    #[error("concurrency token rejected for {registry_id} (HTTP {status})")]
    Conflict { registry_id: String, status: u16 },

    /// Any other non-2xx response.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body was not what the registry contract promises.
    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
