use shared::types::{ErrorReason, ServerId, SourceKind};
use thiserror::Error;

/// A single probe failed. Recorded on the record, never propagated past a sweep.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,

    #[error("server unreachable: {0}")]
    Unreachable(String),

    #[error("malformed response: {0}")]
    Protocol(String),
}

impl ProbeError {
    pub fn reason(&self) -> ErrorReason {
        match self {
            ProbeError::Timeout => ErrorReason::Timeout,
            ProbeError::Unreachable(_) => ErrorReason::Unreachable,
            ProbeError::Protocol(_) => ErrorReason::Protocol,
        }
    }
}

/// Directory-level failures surfaced to callers.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("no discovery source answered: {0}")]
    SourceUnavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("unknown server {0}")]
    NotFound(ServerId),

    #[error("directory task has stopped")]
    Closed,

    #[error("booking rejected: {0}")]
    BookingRejected(String),

    #[error("no car available on {0}")]
    NoCarAvailable(ServerId),

    #[error(transparent)]
    Probe(#[from] ProbeError),
}

/// One discovery source failed during a scan.
#[derive(Debug, Error)]
#[error("{kind} source failed: {message}")]
pub struct SourceError {
    pub kind: SourceKind,
    pub message: String,
}

impl SourceError {
    pub fn new(kind: SourceKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}
