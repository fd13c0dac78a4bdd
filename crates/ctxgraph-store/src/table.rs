use std::collections::{BTreeMap, BTreeSet};

use ctxgraph_types::{ChangeSet, CommitSeq, ManagedObject, ObjectRef};

use crate::error::{StoreError, StoreResult};

/// Materialized stored state shared by the store backends.
///
/// `check` validates a change set against the current state without touching
/// it; `apply` runs `check` first and only then mutates, so a rejected change
/// set leaves the table exactly as it was.
#[derive(Clone, Debug, Default)]
pub struct ObjectTable {
    objects: BTreeMap<ObjectRef, ManagedObject>,
    last_seq: Option<CommitSeq>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, reference: &ObjectRef) -> Option<&ManagedObject> {
        self.objects.get(reference)
    }

    pub fn contains(&self, reference: &ObjectRef) -> bool {
        self.objects.contains_key(reference)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn references(&self) -> Vec<ObjectRef> {
        self.objects.keys().copied().collect()
    }

    pub fn last_seq(&self) -> Option<CommitSeq> {
        self.last_seq
    }

    /// Validate `change_set` against the current state.
    pub fn check(&self, change_set: &ChangeSet) -> StoreResult<()> {
        if let (Some(seq), Some(last)) = (change_set.seq(), self.last_seq) {
            if seq <= last {
                return Err(StoreError::OutOfOrder { seq, last });
            }
        }

        let mut inserted = BTreeSet::new();
        for object in change_set.inserted() {
            if self.objects.contains_key(&object.reference) || !inserted.insert(object.reference) {
                return Err(conflict(object.reference, "object already exists"));
            }
        }

        for update in change_set.updated() {
            let current = self
                .objects
                .get(&update.reference)
                .ok_or_else(|| conflict(update.reference, "object no longer exists"))?;
            if current.entity != update.entity {
                return Err(conflict(
                    update.reference,
                    format!("entity is `{}`, update targets `{}`", current.entity, update.entity),
                ));
            }
            let stale = update.diff.stale_keys(&current.attributes);
            if !stale.is_empty() {
                return Err(conflict(
                    update.reference,
                    format!("attributes changed underneath: {}", stale.join(", ")),
                ));
            }
        }

        let mut deleted = BTreeSet::new();
        for reference in change_set.deleted() {
            if !self.objects.contains_key(reference) || !deleted.insert(*reference) {
                return Err(conflict(*reference, "object no longer exists"));
            }
        }

        Ok(())
    }

    /// Validate and then apply `change_set`.
    pub fn apply(&mut self, change_set: &ChangeSet) -> StoreResult<()> {
        self.check(change_set)?;

        for object in change_set.inserted() {
            self.objects.insert(object.reference, object.clone());
        }
        for update in change_set.updated() {
            if let Some(current) = self.objects.get_mut(&update.reference) {
                current.apply_diff(&update.diff);
            }
        }
        for reference in change_set.deleted() {
            self.objects.remove(reference);
        }
        if let Some(seq) = change_set.seq() {
            self.last_seq = Some(seq);
        }
        Ok(())
    }
}

fn conflict(reference: ObjectRef, reason: impl Into<String>) -> StoreError {
    StoreError::Conflict {
        reference,
        reason: reason.into(),
    }
}
