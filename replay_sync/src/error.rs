//! Error types for the experience store and the synchronization protocol.
//!
//! Every error is raised synchronously to the immediate caller. A rejected
//! append never touches the ring buffer's existing contents, and a failed
//! pull or push never leaves the local model half-written.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised by [`TransitionRecord`](crate::TransitionRecord) construction,
/// [`ExperienceStore`](crate::ExperienceStore) appends and batch sampling.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BufferError {
    /// Required fields are absent, or the record's field set disagrees with
    /// the schema the store established from its first record.
    #[error("schema mismatch: missing fields {missing:?}, unexpected fields {unexpected:?}")]
    Schema {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    /// The record carries a different number of fields than stored records.
    #[error("record has {found} fields but stored records have {expected}")]
    LengthMismatch { expected: usize, found: usize },

    /// A sample strategy name that is not one of the built-in strategies.
    #[error("unknown sample strategy: {0:?}")]
    UnknownSampleStrategy(String),

    /// The record violates a construction-time invariant.
    #[error("invalid record field {field:?}: {reason}")]
    InvalidRecord { field: String, reason: String },

    /// A field requested for numeric concatenation holds a non-numeric value.
    #[error("field {field:?} is not numeric and cannot be concatenated")]
    NotNumeric { field: String },

    /// A field declared as a main (structured) field is not a tensor group.
    #[error("field {field:?} is not a tensor group")]
    NotStructured { field: String },

    /// Per-record values of a field cannot be stacked into one batch tensor.
    #[error("field {field:?} has incompatible shape: expected {expected}, found {found}")]
    ShapeMismatch {
        field: String,
        expected: usize,
        found: usize,
    },

    /// A custom sample strategy selected a position outside the buffer.
    #[error("custom strategy selected index {index} from a buffer of {len} records")]
    InvalidSelection { index: usize, len: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BufferError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        BufferError::InvalidRecord {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn missing(fields: Vec<String>) -> Self {
        BufferError::Schema {
            missing: fields,
            unexpected: Vec::new(),
        }
    }
}

/// Which side of the push/pull protocol an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncOp {
    Pull,
    Push,
}

impl fmt::Display for SyncOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOp::Pull => write!(f, "pull"),
            SyncOp::Push => write!(f, "push"),
        }
    }
}

/// Failure of a pull or push against an aggregator.
///
/// Never retried internally; the caller owns retry policy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// The aggregator could not be reached at all.
    #[error("{op} failed, aggregator unreachable: {reason}")]
    Unreachable { op: SyncOp, reason: String },

    /// The aggregator was reached but refused the payload.
    #[error("{op} rejected by aggregator: {reason}")]
    Rejected { op: SyncOp, reason: String },

    /// No answer within the caller-supplied timeout.
    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: SyncOp, timeout: Duration },
}

impl SyncError {
    /// The operation that failed.
    pub fn op(&self) -> SyncOp {
        match self {
            SyncError::Unreachable { op, .. }
            | SyncError::Rejected { op, .. }
            | SyncError::Timeout { op, .. } => *op,
        }
    }
}

/// Failure to start an aggregator service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn aggregator thread: {0}")]
    Spawn(#[from] std::io::Error),
}
