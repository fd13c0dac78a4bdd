use ctxgraph_types::{ChangeSet, CommitSeq, ManagedObject, ObjectRef};

use crate::error::StoreResult;
use crate::schema::ObjectGraphSchema;

/// Durable storage for the object graph.
///
/// All implementations must satisfy these invariants:
/// - `save` is all-or-nothing: the whole change set is validated against
///   the stored state before anything is mutated.
/// - Reads are safe to run concurrently with a save and observe either the
///   state before or the state after it, never a mix.
/// - All I/O errors are propagated, never silently ignored.
///
/// Implementations may assume saves are serialized by the caller; the
/// coordinator holds its commit lock around every `save`.
pub trait PersistentStore: Send + Sync {
    /// Open the store for `schema`.
    ///
    /// The first open records the schema fingerprint. Later opens with a
    /// different fingerprint fail with `SchemaMismatch`; opening again with
    /// the same schema is a no-op.
    fn open(&self, schema: &ObjectGraphSchema) -> StoreResult<()>;

    /// Durably apply a stamped change set.
    fn save(&self, change_set: &ChangeSet) -> StoreResult<()>;

    /// Read an object by reference.
    ///
    /// Returns `Ok(None)` if the object does not exist.
    fn fetch(&self, reference: &ObjectRef) -> StoreResult<Option<ManagedObject>>;

    /// All stored references, sorted.
    fn references(&self) -> StoreResult<Vec<ObjectRef>>;

    /// Sequence number of the last change set saved, if any.
    fn last_commit_seq(&self) -> StoreResult<Option<CommitSeq>>;

    /// Read multiple objects in a batch.
    ///
    /// Default implementation calls `fetch()` for each reference.
    fn fetch_batch(&self, references: &[ObjectRef]) -> StoreResult<Vec<Option<ManagedObject>>> {
        references.iter().map(|r| self.fetch(r)).collect()
    }

    /// Number of stored objects.
    fn len(&self) -> StoreResult<usize> {
        Ok(self.references()?.len())
    }
}
