//! The state one context owns: materialized snapshots plus pending edits.
//!
//! `ContextState` is plain synchronous data. The context actor is the only
//! thing that ever touches it, which is what confines a context's state to
//! its own execution domain.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;

use ctxgraph_store::PersistentStore;
use ctxgraph_types::{
    diff_attributes, Attributes, ChangeSet, CommitSeq, ContextId, ContextRole, ManagedObject,
    ObjectRef,
};

use crate::error::{ContextError, ContextResult, SaveError};
use crate::merge::{MergeIssue, MergeReport};

/// One staged attribute edit; `None` removes the attribute.
pub type AttributeEdit = (String, Option<Value>);

/// Counters describing a context.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ContextStats {
    pub materialized: usize,
    pub pending_inserts: usize,
    pub pending_updates: usize,
    pub pending_deletes: usize,
    pub saves: u64,
    pub rollbacks: u64,
    pub merges_applied: u64,
    pub last_merged_seq: Option<CommitSeq>,
}

#[derive(Debug)]
pub struct ContextState {
    id: ContextId,
    role: ContextRole,
    /// Committed snapshots this context has faulted in.
    materialized: BTreeMap<ObjectRef, ManagedObject>,
    /// Last commit the store had reached before a snapshot was read; the
    /// snapshot reflects at least that commit.
    faulted_at: BTreeMap<ObjectRef, CommitSeq>,
    inserted: BTreeMap<ObjectRef, ManagedObject>,
    updated: BTreeMap<ObjectRef, BTreeMap<String, Option<Value>>>,
    deleted: BTreeSet<ObjectRef>,
    saves: u64,
    rollbacks: u64,
    merges_applied: u64,
    last_merged_seq: Option<CommitSeq>,
}

impl ContextState {
    pub fn new(id: ContextId, role: ContextRole) -> Self {
        Self {
            id,
            role,
            materialized: BTreeMap::new(),
            faulted_at: BTreeMap::new(),
            inserted: BTreeMap::new(),
            updated: BTreeMap::new(),
            deleted: BTreeSet::new(),
            saves: 0,
            rollbacks: 0,
            merges_applied: 0,
            last_merged_seq: None,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn role(&self) -> ContextRole {
        self.role
    }

    pub fn has_changes(&self) -> bool {
        !self.inserted.is_empty() || !self.updated.is_empty() || !self.deleted.is_empty()
    }

    pub fn is_materialized(&self, reference: &ObjectRef) -> bool {
        self.materialized.contains_key(reference)
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            materialized: self.materialized.len(),
            pending_inserts: self.inserted.len(),
            pending_updates: self.updated.len(),
            pending_deletes: self.deleted.len(),
            saves: self.saves,
            rollbacks: self.rollbacks,
            merges_applied: self.merges_applied,
            last_merged_seq: self.last_merged_seq,
        }
    }

    /// Make sure the committed snapshot of `reference` is materialized,
    /// fetching it from `store` if needed. Returns `false` if the object
    /// does not exist in the store.
    fn fault(&mut self, reference: &ObjectRef, store: &dyn PersistentStore) -> ContextResult<bool> {
        if self.materialized.contains_key(reference) {
            return Ok(true);
        }
        let seen = store.last_commit_seq()?;
        match store.fetch(reference)? {
            Some(object) => {
                self.materialize(*reference, object, seen);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn materialize(&mut self, reference: ObjectRef, object: ManagedObject, seen: Option<CommitSeq>) {
        self.materialized.insert(reference, object);
        match seen {
            Some(seq) => {
                self.faulted_at.insert(reference, seq);
            }
            None => {
                self.faulted_at.remove(&reference);
            }
        }
    }

    fn evict(&mut self, reference: &ObjectRef) -> bool {
        self.faulted_at.remove(reference);
        self.materialized.remove(reference).is_some()
    }

    /// The context's view of `reference`: pending edits layered over the
    /// committed snapshot.
    pub fn get(
        &mut self,
        reference: &ObjectRef,
        store: &dyn PersistentStore,
    ) -> ContextResult<Option<ManagedObject>> {
        if self.deleted.contains(reference) {
            return Ok(None);
        }
        if let Some(object) = self.inserted.get(reference) {
            return Ok(Some(object.clone()));
        }
        if !self.fault(reference, store)? {
            return Ok(None);
        }
        let mut object = self.materialized[reference].clone();
        if let Some(edits) = self.updated.get(reference) {
            apply_edits(&mut object.attributes, edits);
        }
        Ok(Some(object))
    }

    /// Stage a new object and return its reference.
    pub fn stage_insert(&mut self, entity: String, attributes: Attributes) -> ObjectRef {
        let object = ManagedObject::new(entity, attributes);
        let reference = object.reference;
        self.inserted.insert(reference, object);
        reference
    }

    /// Stage attribute edits on `reference`.
    pub fn stage_edits(
        &mut self,
        reference: ObjectRef,
        edits: Vec<AttributeEdit>,
        store: &dyn PersistentStore,
    ) -> ContextResult<()> {
        if self.deleted.contains(&reference) {
            return Err(ContextError::ObjectDeleted(reference));
        }
        if let Some(object) = self.inserted.get_mut(&reference) {
            for (key, value) in edits {
                match value {
                    Some(v) => object.attributes.insert(key, v),
                    None => object.attributes.remove(&key),
                };
            }
            return Ok(());
        }
        if !self.fault(&reference, store)? {
            return Err(ContextError::ObjectNotFound(reference));
        }
        self.updated.entry(reference).or_default().extend(edits);
        Ok(())
    }

    /// Stage a delete. Deleting a pending insert drops the insert.
    pub fn stage_delete(
        &mut self,
        reference: ObjectRef,
        store: &dyn PersistentStore,
    ) -> ContextResult<()> {
        if self.inserted.remove(&reference).is_some() || self.deleted.contains(&reference) {
            return Ok(());
        }
        if !self.fault(&reference, store)? {
            return Err(ContextError::ObjectNotFound(reference));
        }
        self.updated.remove(&reference);
        self.deleted.insert(reference);
        Ok(())
    }

    /// Discard every pending edit. Returns how many objects were touched.
    pub fn rollback(&mut self) -> usize {
        let discarded = self.inserted.len() + self.updated.len() + self.deleted.len();
        self.inserted.clear();
        self.updated.clear();
        self.deleted.clear();
        self.rollbacks += 1;
        discarded
    }

    /// Build the change set describing all pending edits.
    ///
    /// Snapshots evicted by an earlier merge are faulted in again first so
    /// every update diffs against the committed base. Pending edits are left
    /// untouched; they are cleared by [`commit_succeeded`](Self::commit_succeeded).
    pub fn prepare_save(&mut self, store: &dyn PersistentStore) -> Result<ChangeSet, SaveError> {
        let missing: Vec<ObjectRef> = self
            .updated
            .keys()
            .chain(self.deleted.iter())
            .filter(|r| !self.materialized.contains_key(*r))
            .copied()
            .collect();
        let seen = store.last_commit_seq()?;
        for reference in missing {
            match store.fetch(&reference)? {
                Some(object) => {
                    self.materialize(reference, object, seen);
                }
                None => {
                    return Err(SaveError::Conflict {
                        reference,
                        reason: "object no longer exists".into(),
                    })
                }
            }
        }

        let mut builder = ChangeSet::builder(self.id);
        for object in self.inserted.values() {
            builder = builder.insert(object.clone());
        }
        for (reference, edits) in &self.updated {
            let base = &self.materialized[reference];
            let mut target = base.attributes.clone();
            apply_edits(&mut target, edits);
            builder = builder.update(
                *reference,
                base.entity.clone(),
                diff_attributes(&base.attributes, &target),
            );
        }
        for reference in &self.deleted {
            builder = builder.delete(*reference);
        }
        Ok(builder.build())
    }

    /// Fold a committed change set into the materialized snapshots and clear
    /// the pending edits it was built from.
    pub fn commit_succeeded(&mut self, change_set: &ChangeSet) {
        for object in change_set.inserted() {
            self.materialized.insert(object.reference, object.clone());
        }
        for update in change_set.updated() {
            if let Some(object) = self.materialized.get_mut(&update.reference) {
                object.apply_diff(&update.diff);
            }
        }
        for reference in change_set.deleted() {
            self.evict(reference);
        }
        self.inserted.clear();
        self.updated.clear();
        self.deleted.clear();
        if !change_set.is_empty() {
            self.saves += 1;
        }
    }

    /// Merge a change set committed by another context.
    ///
    /// Only materialized objects are touched. Each entry is checked before it
    /// is applied: an update whose base no longer matches the materialized
    /// copy evicts the copy instead of half-applying.
    pub fn apply_merge(&mut self, change_set: &ChangeSet) -> MergeReport {
        let seq = change_set.seq();
        let mut report = MergeReport::new(self.id, change_set.origin(), seq);

        if let (Some(seq), Some(last)) = (seq, self.last_merged_seq) {
            if seq <= last {
                report.issues.push(MergeIssue::OutOfOrder { seq, last });
                return report;
            }
        }

        report.skipped_inserts = change_set.inserted().len();

        for update in change_set.updated() {
            let reflected = matches!(
                (seq, self.faulted_at.get(&update.reference)),
                (Some(seq), Some(seen)) if seq <= *seen
            );
            let Some(current) = self.materialized.get_mut(&update.reference) else {
                continue;
            };
            if reflected {
                // Snapshot was read after this commit reached the store.
                report.applied_updates += 1;
            } else if update.diff.base_matches(&current.attributes) {
                current.apply_diff(&update.diff);
                report.applied_updates += 1;
            } else if update.diff.already_applied(&current.attributes) {
                // Faulted in after the commit reached the store.
                report.applied_updates += 1;
            } else {
                let keys = update.diff.stale_keys(&current.attributes);
                self.evict(&update.reference);
                report.issues.push(MergeIssue::StaleBase {
                    reference: update.reference,
                    keys,
                });
            }
        }

        for reference in change_set.deleted() {
            if self.evict(reference) {
                report.applied_deletes += 1;
            }
            if self.updated.remove(reference).is_some() {
                report.issues.push(MergeIssue::DeletedWithPendingEdits {
                    reference: *reference,
                });
            }
            self.deleted.remove(reference);
        }

        self.merges_applied += 1;
        report.applied_index = self.merges_applied;
        if seq.is_some() {
            self.last_merged_seq = seq;
        }
        report
    }
}

fn apply_edits(attributes: &mut Attributes, edits: &BTreeMap<String, Option<Value>>) {
    for (key, value) in edits {
        match value {
            Some(v) => attributes.insert(key.clone(), v.clone()),
            None => attributes.remove(key),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxgraph_store::{InMemoryStore, ObjectGraphSchema};
    use ctxgraph_types::CommitStamp;
    use serde_json::json;

    fn store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.open(&ObjectGraphSchema::empty()).unwrap();
        store
    }

    fn note(title: &str) -> Attributes {
        Attributes::from([("title".to_string(), json!(title))])
    }

    /// Insert one object through a throwaway context and commit it as `seq`.
    fn seed(store: &InMemoryStore, seq: u64) -> ObjectRef {
        let mut writer = ContextState::new(ContextId::new(), ContextRole::Child);
        let reference = writer.stage_insert("Note".into(), note("seed"));
        let cs = writer
            .prepare_save(store)
            .unwrap()
            .stamped(CommitStamp::now(CommitSeq::new(seq)));
        store.save(&cs).unwrap();
        reference
    }

    fn commit(state: &mut ContextState, store: &InMemoryStore, seq: u64) -> ChangeSet {
        let cs = state
            .prepare_save(store)
            .unwrap()
            .stamped(CommitStamp::now(CommitSeq::new(seq)));
        store.save(&cs).unwrap();
        state.commit_succeeded(&cs);
        cs
    }

    #[test]
    fn insert_then_view() {
        let store = store();
        let mut state = ContextState::new(ContextId::new(), ContextRole::Child);
        let reference = state.stage_insert("Note".into(), note("a"));

        assert!(state.has_changes());
        let object = state.get(&reference, &store).unwrap().unwrap();
        assert_eq!(object.get("title"), Some(&json!("a")));
        assert!(!state.is_materialized(&reference));
    }

    #[test]
    fn edits_on_pending_insert_modify_it_in_place() {
        let store = store();
        let mut state = ContextState::new(ContextId::new(), ContextRole::Child);
        let reference = state.stage_insert("Note".into(), note("a"));
        state
            .stage_edits(reference, vec![("title".into(), Some(json!("b")))], &store)
            .unwrap();

        let cs = state.prepare_save(&store).unwrap();
        assert_eq!(cs.inserted().len(), 1);
        assert!(cs.updated().is_empty());
        assert_eq!(cs.inserted()[0].get("title"), Some(&json!("b")));
    }

    #[test]
    fn deleting_pending_insert_drops_it() {
        let store = store();
        let mut state = ContextState::new(ContextId::new(), ContextRole::Child);
        let reference = state.stage_insert("Note".into(), note("a"));
        state.stage_delete(reference, &store).unwrap();
        assert!(!state.has_changes());
        assert!(state.prepare_save(&store).unwrap().is_empty());
    }

    #[test]
    fn edit_faults_in_and_diffs_against_base() {
        let store = store();
        let reference = seed(&store, 1);
        let mut state = ContextState::new(ContextId::new(), ContextRole::Master);

        state
            .stage_edits(
                reference,
                vec![("title".into(), Some(json!("edited"))), ("tag".into(), Some(json!(1)))],
                &store,
            )
            .unwrap();
        assert!(state.is_materialized(&reference));

        let view = state.get(&reference, &store).unwrap().unwrap();
        assert_eq!(view.get("title"), Some(&json!("edited")));

        let cs = state.prepare_save(&store).unwrap();
        assert_eq!(cs.updated().len(), 1);
        assert_eq!(cs.updated()[0].diff.len(), 2);
        assert!(cs.updated()[0]
            .diff
            .base_matches(&store.fetch(&reference).unwrap().unwrap().attributes));
    }

    #[test]
    fn unknown_and_deleted_objects_are_rejected() {
        let store = store();
        let reference = seed(&store, 1);
        let mut state = ContextState::new(ContextId::new(), ContextRole::Child);

        let missing = ObjectRef::new();
        assert!(matches!(
            state.stage_edits(missing, vec![("k".into(), None)], &store),
            Err(ContextError::ObjectNotFound(r)) if r == missing
        ));
        assert!(matches!(
            state.stage_delete(missing, &store),
            Err(ContextError::ObjectNotFound(_))
        ));

        state.stage_delete(reference, &store).unwrap();
        assert!(matches!(
            state.stage_edits(reference, vec![("title".into(), None)], &store),
            Err(ContextError::ObjectDeleted(_))
        ));
        assert!(state.get(&reference, &store).unwrap().is_none());
    }

    #[test]
    fn commit_succeeded_clears_pending_and_materializes() {
        let store = store();
        let mut state = ContextState::new(ContextId::new(), ContextRole::Child);
        let reference = state.stage_insert("Note".into(), note("a"));
        commit(&mut state, &store, 1);

        assert!(!state.has_changes());
        assert!(state.is_materialized(&reference));
        assert_eq!(state.stats().saves, 1);
    }

    #[test]
    fn rollback_discards_everything() {
        let store = store();
        let existing = seed(&store, 1);
        let mut state = ContextState::new(ContextId::new(), ContextRole::Child);
        state.stage_insert("Note".into(), note("a"));
        state.stage_delete(existing, &store).unwrap();

        assert_eq!(state.rollback(), 2);
        assert!(!state.has_changes());
        assert_eq!(state.stats().rollbacks, 1);
        assert!(state.get(&existing, &store).unwrap().is_some());
    }

    #[test]
    fn merge_updates_materialized_objects_only() {
        let store = store();
        let reference = seed(&store, 1);
        let untouched = seed(&store, 2);

        let mut target = ContextState::new(ContextId::new(), ContextRole::Master);
        target.get(&reference, &store).unwrap();

        let mut writer = ContextState::new(ContextId::new(), ContextRole::Child);
        writer
            .stage_edits(reference, vec![("title".into(), Some(json!("merged")))], &store)
            .unwrap();
        writer
            .stage_edits(untouched, vec![("title".into(), Some(json!("x")))], &store)
            .unwrap();
        let cs = commit(&mut writer, &store, 3);

        let report = target.apply_merge(&cs);
        assert!(report.is_clean());
        assert_eq!(report.applied_updates, 1);
        assert_eq!(report.applied_index, 1);
        assert!(!target.is_materialized(&untouched));
        assert_eq!(
            target.get(&reference, &store).unwrap().unwrap().get("title"),
            Some(&json!("merged"))
        );
        assert_eq!(target.stats().last_merged_seq, Some(CommitSeq::new(3)));
    }

    #[test]
    fn merge_already_seen_through_fault_is_a_no_op() {
        let store = store();
        let reference = seed(&store, 1);

        let mut writer = ContextState::new(ContextId::new(), ContextRole::Child);
        writer
            .stage_edits(reference, vec![("title".into(), Some(json!("new")))], &store)
            .unwrap();
        let cs = commit(&mut writer, &store, 2);

        // Faulted in after the commit landed, before the merge arrives.
        let mut target = ContextState::new(ContextId::new(), ContextRole::Child);
        target.get(&reference, &store).unwrap();
        let report = target.apply_merge(&cs);
        assert!(report.is_clean());
        assert!(target.is_materialized(&reference));
    }

    #[test]
    fn merge_older_than_snapshot_is_skipped_quietly() {
        let store = store();
        let reference = seed(&store, 1);

        let mut writer = ContextState::new(ContextId::new(), ContextRole::Child);
        writer
            .stage_edits(reference, vec![("title".into(), Some(json!("second")))], &store)
            .unwrap();
        let second = commit(&mut writer, &store, 2);
        writer
            .stage_edits(reference, vec![("title".into(), Some(json!("third")))], &store)
            .unwrap();
        let third = commit(&mut writer, &store, 3);

        // Read after both commits landed, with both merges still queued.
        let mut target = ContextState::new(ContextId::new(), ContextRole::Master);
        target.get(&reference, &store).unwrap();

        let report = target.apply_merge(&second);
        assert!(report.is_clean());
        assert_eq!(report.applied_updates, 1);
        assert!(target.is_materialized(&reference));
        assert!(target.apply_merge(&third).is_clean());
        assert_eq!(
            target.get(&reference, &store).unwrap().unwrap().get("title"),
            Some(&json!("third"))
        );
    }

    #[test]
    fn stale_merge_evicts_and_keeps_pending_edits() {
        let store = store();
        let reference = seed(&store, 1);

        let mut target = ContextState::new(ContextId::new(), ContextRole::Child);
        target
            .stage_edits(reference, vec![("body".into(), Some(json!("mine")))], &store)
            .unwrap();

        // A diff whose base does not match what the target holds.
        let stale = ChangeSet::builder(ContextId::new())
            .update(
                reference,
                "Note",
                diff_attributes(&note("elsewhere"), &note("theirs")),
            )
            .build()
            .stamped(CommitStamp::now(CommitSeq::new(2)));

        let report = target.apply_merge(&stale);
        assert!(matches!(
            &report.issues[..],
            [MergeIssue::StaleBase { reference: r, keys }] if *r == reference && keys == &["title"]
        ));
        assert!(!target.is_materialized(&reference));
        assert!(target.has_changes());

        // The next save faults the base in again.
        let cs = target.prepare_save(&store).unwrap();
        assert_eq!(cs.updated().len(), 1);
        assert!(target.is_materialized(&reference));
    }

    #[test]
    fn merged_delete_discards_pending_edits() {
        let store = store();
        let reference = seed(&store, 1);

        let mut target = ContextState::new(ContextId::new(), ContextRole::Child);
        target
            .stage_edits(reference, vec![("title".into(), Some(json!("mine")))], &store)
            .unwrap();

        let mut writer = ContextState::new(ContextId::new(), ContextRole::Child);
        writer.stage_delete(reference, &store).unwrap();
        let cs = commit(&mut writer, &store, 2);

        let report = target.apply_merge(&cs);
        assert_eq!(report.applied_deletes, 1);
        assert_eq!(
            report.issues,
            vec![MergeIssue::DeletedWithPendingEdits { reference }]
        );
        assert!(!target.has_changes());
        assert!(target.get(&reference, &store).unwrap().is_none());
    }

    #[test]
    fn merged_delete_satisfies_pending_delete() {
        let store = store();
        let reference = seed(&store, 1);

        let mut target = ContextState::new(ContextId::new(), ContextRole::Child);
        target.stage_delete(reference, &store).unwrap();

        let mut writer = ContextState::new(ContextId::new(), ContextRole::Child);
        writer.stage_delete(reference, &store).unwrap();
        let cs = commit(&mut writer, &store, 2);

        let report = target.apply_merge(&cs);
        assert!(report.is_clean());
        assert!(!target.has_changes());
    }

    #[test]
    fn out_of_order_merge_is_refused() {
        let mut target = ContextState::new(ContextId::new(), ContextRole::Child);
        let origin = ContextId::new();

        let later = ChangeSet::builder(origin)
            .insert(ManagedObject::new("Note", note("b")))
            .build()
            .stamped(CommitStamp::now(CommitSeq::new(5)));
        let earlier = ChangeSet::builder(origin)
            .insert(ManagedObject::new("Note", note("a")))
            .build()
            .stamped(CommitStamp::now(CommitSeq::new(4)));

        assert!(target.apply_merge(&later).is_clean());
        let report = target.apply_merge(&earlier);
        assert_eq!(report.applied_index, 0);
        assert!(matches!(report.issues[..], [MergeIssue::OutOfOrder { .. }]));
        assert_eq!(target.stats().merges_applied, 1);
    }
}
