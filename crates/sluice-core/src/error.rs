//! Error taxonomy for the pipeline.
//!
//! [`StageError`] is fatal at construction. [`QueryError`] is recorded on a
//! single request and ends that request's processing in the current stage.
//! Collaborator errors ([`StoreError`], [`BackendError`]) are wrapped by both.

use thiserror::Error;
use uuid::Uuid;

/// Errors reported by a metadata graph store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid query: {0}")]
    Parse(String),

    #[error("query execution failed: {0}")]
    Execution(String),
}

/// Errors reported by a timeseries backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The backend does not implement the requested call (code 501).
    #[error("operation not supported by timeseries backend")]
    Unsupported,

    #[error("timeseries backend unavailable: {0}")]
    Unavailable(String),

    #[error("timeseries backend error: {0}")]
    Failed(String),
}

impl BackendError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, BackendError::Unsupported)
    }
}

/// Errors from [`crate::duration::parse_duration`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    #[error("invalid duration '{0}': must be a number followed by a recognized unit (h, m, s, us, ms, ns, d)")]
    Format(String),

    #[error("invalid unit '{0}': must be one of h, m, s, us, ms, ns, d")]
    Unit(String),

    #[error("duration '{0}' is out of range")]
    Overflow(String),
}

/// Fatal errors raised while constructing a stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("could not connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("bootstrap query failed: {0}")]
    Bootstrap(#[source] StoreError),

    #[error("invalid stage configuration: {0}")]
    Config(String),

    #[error("pipeline is shutting down")]
    ShuttingDown,
}

/// Errors recorded against one request.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("could not parse query for stream '{stream}': {source}")]
    Parse {
        stream: String,
        #[source]
        source: StoreError,
    },

    #[error("query for stream '{stream}' failed: {source}")]
    Execution {
        stream: String,
        #[source]
        source: StoreError,
    },

    #[error("could not parse {field} time ({value}): {reason}")]
    Timestamp {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("data frame '{frame}': {source}")]
    Duration {
        frame: String,
        #[source]
        source: DurationError,
    },

    #[error("data frame '{0}' requests an aggregate but has no window")]
    MissingWindow(String),

    #[error("stream {0} does not exist")]
    StreamNotFound(Uuid),

    #[error("could not fetch stream {uuid}: {source}")]
    StreamLookup {
        uuid: Uuid,
        #[source]
        source: BackendError,
    },

    #[error("error while reading stream {uuid}: {source}")]
    Backend {
        uuid: Uuid,
        #[source]
        source: BackendError,
    },
}
