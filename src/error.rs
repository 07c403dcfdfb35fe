use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum GpmError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid bounding box: {0}")]
    InvalidBoundingBox(String),

    #[error("catalog listing unavailable at {url}: {reason}")]
    CatalogUnavailable { url: String, reason: String },

    #[error("granule fetch failed after {attempts} attempt(s) for {url}: {reason}")]
    GranuleFetchFailed {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("malformed catalog listing: {0}")]
    CatalogParse(String),

    #[error("nothing to retrieve: {0}")]
    EmptyRetrieval(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("server returned status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("malformed DAP response: {0}")]
    Dap(String),

    #[error("invalid granule metadata: {0}")]
    Metadata(String),

    #[error("cannot merge granules: {0}")]
    MergeConflict(String),

    #[error("worker pool error: {0}")]
    WorkerPool(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("missing config file gpmdap.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),
}
