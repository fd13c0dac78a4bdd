use std::sync::RwLock;

use ctxgraph_types::{ChangeSet, CommitSeq, ManagedObject, ObjectRef};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::schema::{ObjectGraphSchema, SchemaFingerprint};
use crate::table::ObjectTable;
use crate::traits::PersistentStore;

/// In-memory store.
///
/// Intended for tests and embedding. State lives behind a `RwLock` so
/// fetches run concurrently with each other and never observe a half
/// applied change set.
pub struct InMemoryStore {
    fingerprint: RwLock<Option<SchemaFingerprint>>,
    table: RwLock<ObjectTable>,
}

impl InMemoryStore {
    /// Create a new, unopened, empty store.
    pub fn new() -> Self {
        Self {
            fingerprint: RwLock::new(None),
            table: RwLock::new(ObjectTable::new()),
        }
    }

    /// Number of objects currently stored.
    pub fn object_count(&self) -> usize {
        self.table.read().expect("table lock poisoned").len()
    }

    /// Returns `true` if no objects are stored.
    pub fn is_empty(&self) -> bool {
        self.table.read().expect("table lock poisoned").is_empty()
    }

    /// Fingerprint of the schema the store was opened with.
    pub fn fingerprint(&self) -> Option<SchemaFingerprint> {
        *self.fingerprint.read().expect("fingerprint lock poisoned")
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.fingerprint().is_none() {
            return Err(StoreError::NotOpen);
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentStore for InMemoryStore {
    fn open(&self, schema: &ObjectGraphSchema) -> StoreResult<()> {
        let requested = schema.fingerprint();
        let mut stored = self.fingerprint.write().expect("fingerprint lock poisoned");
        match *stored {
            Some(existing) if existing != requested => Err(StoreError::SchemaMismatch {
                stored: existing.short_hex(),
                requested: requested.short_hex(),
            }),
            Some(_) => Ok(()),
            None => {
                *stored = Some(requested);
                debug!(schema = %requested.short_hex(), "in-memory store opened");
                Ok(())
            }
        }
    }

    fn save(&self, change_set: &ChangeSet) -> StoreResult<()> {
        self.ensure_open()?;
        let mut table = self.table.write().expect("table lock poisoned");
        table.apply(change_set)
    }

    fn fetch(&self, reference: &ObjectRef) -> StoreResult<Option<ManagedObject>> {
        self.ensure_open()?;
        let table = self.table.read().expect("table lock poisoned");
        Ok(table.get(reference).cloned())
    }

    fn references(&self) -> StoreResult<Vec<ObjectRef>> {
        self.ensure_open()?;
        Ok(self.table.read().expect("table lock poisoned").references())
    }

    fn last_commit_seq(&self) -> StoreResult<Option<CommitSeq>> {
        Ok(self.table.read().expect("table lock poisoned").last_seq())
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("object_count", &self.object_count())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}
