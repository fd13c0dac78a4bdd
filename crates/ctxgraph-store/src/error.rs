use ctxgraph_types::{CommitSeq, ObjectRef};

use crate::schema::SchemaViolation;

/// Errors from persistent store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store has not been opened with a schema yet.
    #[error("store is not open")]
    NotOpen,

    /// The store was created with a different schema.
    #[error("schema mismatch: store holds {stored}, opened with {requested}")]
    SchemaMismatch { stored: String, requested: String },

    /// A change set entry does not satisfy the schema.
    #[error("validation failed: {0}")]
    Validation(#[from] SchemaViolation),

    /// The change set does not apply to the current stored state.
    #[error("conflict on {reference}: {reason}")]
    Conflict { reference: ObjectRef, reason: String },

    /// A stamped change set does not follow the last stored commit.
    #[error("commit {seq} does not follow last commit {last}")]
    OutOfOrder { seq: CommitSeq, last: CommitSeq },

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Stored data cannot be decoded or replayed.
    #[error("corrupt journal at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
