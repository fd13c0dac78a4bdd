use std::io;

use thiserror::Error;

use ctxgraph_store::{SchemaViolation, StoreError};
use ctxgraph_types::{ContextId, ObjectRef};

/// Errors from [`StoreCoordinator::open`](crate::StoreCoordinator::open).
///
/// Fatal to the coordinator: it stays unopened and the caller decides
/// whether to retry.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("schema mismatch: store holds {stored}, opened with {requested}")]
    SchemaMismatch { stored: String, requested: String },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] io::Error),

    #[error("corrupt storage: {0}")]
    Corrupt(String),
}

impl From<StoreError> for OpenError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SchemaMismatch { stored, requested } => {
                Self::SchemaMismatch { stored, requested }
            }
            StoreError::Io(e) => Self::StorageUnavailable(e),
            other => Self::Corrupt(other.to_string()),
        }
    }
}

/// Errors from saving a context.
///
/// Pending edits are preserved on every failure, so a save can be retried.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("validation failed: {0}")]
    Validation(#[from] SchemaViolation),

    #[error("conflict on {reference}: {reason}")]
    Conflict { reference: ObjectRef, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("coordinator is not open")]
    NotOpen,

    #[error("context {0} is closed")]
    Closed(ContextId),
}

impl From<StoreError> for SaveError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotOpen => Self::NotOpen,
            StoreError::Validation(v) => Self::Validation(v),
            StoreError::Conflict { reference, reason } => Self::Conflict { reference, reason },
            StoreError::Io(e) => Self::Io(e),
            other => Self::Io(io::Error::new(io::ErrorKind::InvalidData, other.to_string())),
        }
    }
}

/// Errors from staging edits on, or reading through, a context.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectRef),

    #[error("object is pending deletion: {0}")]
    ObjectDeleted(ObjectRef),

    #[error("context {0} is closed")]
    Closed(ContextId),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An edit block gave up before saving.
    #[error("aborted: {0}")]
    Aborted(String),
}

/// Errors from the coordinator surface.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("coordinator is not open")]
    NotOpen,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("open failed: {0}")]
    Open(#[from] OpenError),

    #[error("save failed: {0}")]
    Save(#[from] SaveError),

    #[error("context error: {0}")]
    Context(#[from] ContextError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type ContextResult<T> = Result<T, ContextError>;

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_onto_save_errors() {
        let reference = ObjectRef::new();
        let conflict = StoreError::Conflict {
            reference,
            reason: "gone".into(),
        };
        assert!(matches!(
            SaveError::from(conflict),
            SaveError::Conflict { reference: r, .. } if r == reference
        ));
        assert!(matches!(SaveError::from(StoreError::NotOpen), SaveError::NotOpen));

        let corrupt = StoreError::Corrupt {
            offset: 8,
            reason: "bad crc".into(),
        };
        match SaveError::from(corrupt) {
            SaveError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::InvalidData),
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn store_errors_map_onto_open_errors() {
        let mismatch = StoreError::SchemaMismatch {
            stored: "aaaa".into(),
            requested: "bbbb".into(),
        };
        assert!(matches!(
            OpenError::from(mismatch),
            OpenError::SchemaMismatch { .. }
        ));
        let io = StoreError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert!(matches!(OpenError::from(io), OpenError::StorageUnavailable(_)));
        let corrupt = StoreError::Serialization("truncated".into());
        assert!(matches!(OpenError::from(corrupt), OpenError::Corrupt(_)));
    }

    #[test]
    fn display_messages() {
        let id = ContextId::new();
        let err = ContextError::Closed(id);
        assert_eq!(err.to_string(), format!("context {id} is closed"));
        let err = CoordinatorError::from(SaveError::NotOpen);
        assert_eq!(err.to_string(), "save failed: coordinator is not open");
    }
}
