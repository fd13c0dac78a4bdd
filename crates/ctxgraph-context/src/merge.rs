use serde::Serialize;
use thiserror::Error;

use ctxgraph_types::{CommitSeq, ContextId, ObjectRef};

/// What applying one merged change set did to one target context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// The context the change set was merged into.
    pub target: ContextId,
    /// The context that committed the change set.
    pub origin: ContextId,
    pub seq: Option<CommitSeq>,
    /// Position of this merge among all merges applied by the target,
    /// starting at 1. Zero if the merge was refused.
    pub applied_index: u64,
    pub applied_updates: usize,
    pub applied_deletes: usize,
    /// Inserted objects are not materialized on merge; they are faulted in
    /// on first access.
    pub skipped_inserts: usize,
    pub issues: Vec<MergeIssue>,
}

impl MergeReport {
    pub fn new(target: ContextId, origin: ContextId, seq: Option<CommitSeq>) -> Self {
        Self {
            target,
            origin,
            seq,
            applied_index: 0,
            applied_updates: 0,
            applied_deletes: 0,
            skipped_inserts: 0,
            issues: Vec::new(),
        }
    }

    /// Returns `true` if every entry merged cleanly.
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// A merge entry the target could not apply as-is.
///
/// Issues are isolated per entry; the rest of the change set still applies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum MergeIssue {
    /// The materialized copy had drifted from the update's base values. The
    /// copy was evicted and will be faulted in fresh on next access.
    #[error("stale base for {reference}: {}", keys.join(", "))]
    StaleBase { reference: ObjectRef, keys: Vec<String> },

    /// An object with pending edits was deleted elsewhere; the edits were
    /// discarded.
    #[error("{reference} was deleted with pending edits")]
    DeletedWithPendingEdits { reference: ObjectRef },

    /// The change set does not follow the last one merged.
    #[error("merge {seq} arrived after {last}")]
    OutOfOrder { seq: CommitSeq, last: CommitSeq },
}
