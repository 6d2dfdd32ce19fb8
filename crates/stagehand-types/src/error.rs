use thiserror::Error;

/// Errors raised by a state contract implementation.
///
/// The scheduler treats every variant as transient: the current tick is
/// abandoned and retried on the next one.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("state store connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors detected while building a phase dependency graph.
///
/// These are configuration errors: a job whose graph fails validation is
/// rejected at creation time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("workflow declares no phases")]
    Empty,

    #[error("duplicate phase id '{0}'")]
    DuplicatePhase(String),

    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    #[error("{0}")]
    CycleDetected(String),
}

/// Errors returned by phase implementations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PhaseError {
    #[error("phase failed: {0}")]
    Failed(String),

    #[error("missing required input '{0}'")]
    MissingInput(String),

    #[error("input '{field}' expected {expected}")]
    InvalidInput { field: String, expected: String },

    #[error("phase timed out after {0}s")]
    Timeout(u64),

    #[error("external operation failed: {0}")]
    Activity(String),

    #[error("state error: {0}")]
    State(#[from] StateError),
}

/// Errors returned by a remote activity status source.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("activity not found: {0}")]
    NotFound(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}
