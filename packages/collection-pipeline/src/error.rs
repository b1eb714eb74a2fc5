//! Typed errors for the collection pipeline.
//!
//! Uses `thiserror` for library errors (not `anyhow`) to provide
//! strongly-typed, composable error handling.

use thiserror::Error;

/// Errors that can occur while fetching from an external source.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transient network failure (connection reset, DNS, etc.)
    #[error("network error fetching {target}: {message}")]
    Network { target: String, message: String },

    /// HTTP-level failure with a status code
    #[error("HTTP {status} fetching {target}")]
    Http { target: String, status: u16 },

    /// Fetch exceeded its per-call budget
    #[error("timeout fetching {target}")]
    Timeout { target: String },

    /// The source returned something the adapter could not interpret.
    /// Surfaced for human review, never auto-healed.
    #[error("source structure changed at {target}: {message}")]
    StructureChanged { target: String, message: String },

    /// Adapter-specific failure
    #[error("extraction adapter error: {0}")]
    Adapter(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl FetchError {
    /// Whether a retry with backoff can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network { .. } | FetchError::Timeout { .. } => true,
            FetchError::Http { status, .. } => *status >= 500 || *status == 429,
            FetchError::StructureChanged { .. } | FetchError::Adapter(_) => false,
        }
    }
}

/// Errors from a storage destination.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Relational store operation failed
    #[error("relational store error: {0}")]
    Relational(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Document store operation failed
    #[error("document store error: {0}")]
    Document(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Cache write/read failed
    #[error("cache error: {0}")]
    Cache(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Vector index operation failed
    #[error("vector index error: {0}")]
    VectorIndex(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Store write exceeded its budget
    #[error("store write timed out after {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    /// Backend not reachable
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Relational(Box::new(e))
    }
}

/// Top-level pipeline errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No storage policy configured for a data type. Fatal at job start.
    #[error("no storage policy configured for data type '{data_type}'")]
    MissingPolicy { data_type: String },

    /// Unknown source name
    #[error("unknown source '{source_name}'")]
    UnknownSource { source_name: String },

    /// No extraction adapter registered for a source
    #[error("no extractor registered for source '{source_name}'")]
    MissingExtractor { source_name: String },

    /// Configuration document could not be parsed or failed validation
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Job not found in the tracker
    #[error("unknown job {0}")]
    UnknownJob(crate::types::JobId),

    /// Job was cancelled before completion
    #[error("job cancelled")]
    Cancelled,

    /// Fetch failure that survived retries
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Store failure that survived retries
    #[error(transparent)]
    Store(#[from] StoreError),

    /// JSON (de)serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for fetch operations.
pub type FetchResult<T> = std::result::Result<T, FetchError>;
