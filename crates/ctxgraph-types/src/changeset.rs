use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::diff::AttributeDiff;
use crate::identity::{CommitSeq, ContextId, ObjectRef};
use crate::object::ManagedObject;

/// Where a change set landed in the global commit order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStamp {
    pub seq: CommitSeq,
    /// Wall-clock milliseconds since UNIX epoch at commit time.
    pub committed_at_ms: u64,
}

impl CommitStamp {
    /// Stamp `seq` with the current wall-clock time.
    pub fn now(seq: CommitSeq) -> Self {
        let committed_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            seq,
            committed_at_ms,
        }
    }
}

/// Attribute changes made to one already-persisted object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectUpdate {
    pub reference: ObjectRef,
    pub entity: String,
    pub diff: AttributeDiff,
}

/// The immutable description of one context's saved edits.
///
/// Built atomically from a context's pending edits at save time. The
/// coordinator stamps it with its [`CommitSeq`] when it reaches the store,
/// after which it is shared read-only with every sibling context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    origin: ContextId,
    #[serde(default)]
    stamp: Option<CommitStamp>,
    #[serde(default)]
    inserted: Vec<ManagedObject>,
    #[serde(default)]
    updated: Vec<ObjectUpdate>,
    #[serde(default)]
    deleted: Vec<ObjectRef>,
}

impl ChangeSet {
    /// An empty, unstamped change set.
    pub fn empty(origin: ContextId) -> Self {
        Self {
            origin,
            stamp: None,
            inserted: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn builder(origin: ContextId) -> ChangeSetBuilder {
        ChangeSetBuilder {
            inner: Self::empty(origin),
        }
    }

    /// Attach the commit stamp. Consumes the change set so that a stamped
    /// value can only be produced once, before it is shared.
    pub fn stamped(mut self, stamp: CommitStamp) -> Self {
        self.stamp = Some(stamp);
        self
    }

    /// The context that produced this change set.
    pub fn origin(&self) -> ContextId {
        self.origin
    }

    pub fn stamp(&self) -> Option<CommitStamp> {
        self.stamp
    }

    /// Commit sequence number, if this change set reached the store.
    pub fn seq(&self) -> Option<CommitSeq> {
        self.stamp.map(|s| s.seq)
    }

    pub fn inserted(&self) -> &[ManagedObject] {
        &self.inserted
    }

    pub fn updated(&self) -> &[ObjectUpdate] {
        &self.updated
    }

    pub fn deleted(&self) -> &[ObjectRef] {
        &self.deleted
    }

    /// Returns `true` if the change set carries no edits.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Total number of object-level entries.
    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }

    /// Returns `true` if any entry refers to `reference`.
    pub fn touches(&self, reference: &ObjectRef) -> bool {
        self.inserted.iter().any(|o| &o.reference == reference)
            || self.updated.iter().any(|u| &u.reference == reference)
            || self.deleted.contains(reference)
    }
}

/// Accumulates entries for a [`ChangeSet`].
#[derive(Debug)]
pub struct ChangeSetBuilder {
    inner: ChangeSet,
}

impl ChangeSetBuilder {
    pub fn insert(mut self, object: ManagedObject) -> Self {
        self.inner.inserted.push(object);
        self
    }

    /// Record an update. Empty diffs are dropped.
    pub fn update(
        mut self,
        reference: ObjectRef,
        entity: impl Into<String>,
        diff: AttributeDiff,
    ) -> Self {
        if !diff.is_empty() {
            self.inner.updated.push(ObjectUpdate {
                reference,
                entity: entity.into(),
                diff,
            });
        }
        self
    }

    pub fn delete(mut self, reference: ObjectRef) -> Self {
        self.inner.deleted.push(reference);
        self
    }

    pub fn build(self) -> ChangeSet {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::diff_attributes;
    use crate::object::Attributes;
    use serde_json::json;

    #[test]
    fn empty_change_set() {
        let origin = ContextId::new();
        let cs = ChangeSet::empty(origin);
        assert!(cs.is_empty());
        assert_eq!(cs.len(), 0);
        assert_eq!(cs.origin(), origin);
        assert!(cs.seq().is_none());
    }

    #[test]
    fn builder_collects_entries() {
        let inserted = ManagedObject::new("Note", Attributes::new());
        let updated_ref = ObjectRef::new();
        let deleted_ref = ObjectRef::new();
        let diff = diff_attributes(
            &Attributes::new(),
            &Attributes::from([("title".to_string(), json!("x"))]),
        );

        let cs = ChangeSet::builder(ContextId::new())
            .insert(inserted.clone())
            .update(updated_ref, "Note", diff)
            .delete(deleted_ref)
            .build();

        assert_eq!(cs.len(), 3);
        assert!(cs.touches(&inserted.reference));
        assert!(cs.touches(&updated_ref));
        assert!(cs.touches(&deleted_ref));
        assert!(!cs.touches(&ObjectRef::new()));
    }

    #[test]
    fn empty_diffs_are_dropped() {
        let cs = ChangeSet::builder(ContextId::new())
            .update(ObjectRef::new(), "Note", AttributeDiff::new())
            .build();
        assert!(cs.is_empty());
    }

    #[test]
    fn stamping_sets_seq() {
        let cs = ChangeSet::empty(ContextId::new()).stamped(CommitStamp::now(CommitSeq::new(4)));
        assert_eq!(cs.seq(), Some(CommitSeq::new(4)));
        assert!(cs.stamp().unwrap().committed_at_ms > 0);
    }

    #[test]
    fn json_roundtrip_preserves_entries() {
        let cs = ChangeSet::builder(ContextId::new())
            .insert(ManagedObject::new(
                "Note",
                Attributes::from([("body".to_string(), json!({"nested": [1, 2]}))]),
            ))
            .delete(ObjectRef::new())
            .build()
            .stamped(CommitStamp::now(CommitSeq::first()));

        let encoded = serde_json::to_vec(&cs).unwrap();
        let decoded: ChangeSet = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, cs);
    }
}
