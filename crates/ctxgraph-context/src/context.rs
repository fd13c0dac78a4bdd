use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use ctxgraph_types::{Attributes, ChangeSet, CommitSeq, ContextId, ContextRole, ManagedObject, ObjectRef};

use crate::coordinator::Shared;
use crate::error::{ContextError, ContextResult, SaveError};
use crate::merge::MergeReport;
use crate::state::{AttributeEdit, ContextState, ContextStats};
use crate::synchronizer::{PendingMerges, SaveSynchronizer};

/// Sending half of a context's mailbox.
pub(crate) type Mailbox = mpsc::UnboundedSender<Command>;

/// Messages handled by a context actor, in arrival order.
pub(crate) enum Command {
    Insert {
        entity: String,
        attributes: Attributes,
        reply: oneshot::Sender<ObjectRef>,
    },
    Update {
        reference: ObjectRef,
        edits: Vec<AttributeEdit>,
        reply: oneshot::Sender<ContextResult<()>>,
    },
    Delete {
        reference: ObjectRef,
        reply: oneshot::Sender<ContextResult<()>>,
    },
    Get {
        reference: ObjectRef,
        reply: oneshot::Sender<ContextResult<Option<ManagedObject>>>,
    },
    Save {
        reply: oneshot::Sender<Result<SaveOutcome, SaveError>>,
    },
    Rollback {
        reply: oneshot::Sender<usize>,
    },
    HasChanges {
        reply: oneshot::Sender<bool>,
    },
    Stats {
        reply: oneshot::Sender<ContextStats>,
    },
    IsMaterialized {
        reference: ObjectRef,
        reply: oneshot::Sender<bool>,
    },
    Merge {
        change_set: Arc<ChangeSet>,
        ack: oneshot::Sender<MergeReport>,
    },
}

/// A committed save whose merges may still be in flight.
#[derive(Debug)]
pub struct SaveOutcome {
    pub change_set: Arc<ChangeSet>,
    pub merges: PendingMerges,
}

impl SaveOutcome {
    /// Wait for every merge and turn this into a [`SaveReport`].
    pub async fn wait(self) -> SaveReport {
        SaveReport {
            change_set: self.change_set,
            merges: self.merges.wait().await,
        }
    }
}

/// A committed save together with the merge it caused in every other
/// context.
#[derive(Clone, Debug)]
pub struct SaveReport {
    pub change_set: Arc<ChangeSet>,
    pub merges: Vec<MergeReport>,
}

impl SaveReport {
    /// Commit sequence number, `None` for an empty save.
    pub fn seq(&self) -> Option<CommitSeq> {
        self.change_set.seq()
    }

    /// The report for one target context.
    pub fn merge_into(&self, target: ContextId) -> Option<&MergeReport> {
        self.merges.iter().find(|m| m.target == target)
    }
}

/// Handle to one context in the hierarchy.
///
/// Every context runs as an actor on its own task; handles are cheap to
/// clone and only ever talk to it through its mailbox. When the last handle
/// is dropped the context is deregistered and its actor stops.
#[derive(Clone)]
pub struct Context {
    handle: Arc<ContextHandle>,
}

struct ContextHandle {
    id: ContextId,
    role: ContextRole,
    parent: Option<ContextId>,
    mailbox: Arc<Mailbox>,
    synchronizer: Arc<SaveSynchronizer>,
}

impl Drop for ContextHandle {
    fn drop(&mut self) {
        self.synchronizer.deregister(self.id);
    }
}

impl Context {
    /// Register a new context and start its actor.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn spawn(shared: Arc<Shared>, role: ContextRole, parent: Option<ContextId>) -> Self {
        let id = ContextId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let mailbox = Arc::new(tx);
        let synchronizer = Arc::clone(shared.synchronizer());
        synchronizer.register(id, role, &mailbox);

        let actor = ContextActor {
            state: ContextState::new(id, role),
            shared,
            inbox: rx,
        };
        tokio::spawn(actor.run());
        debug!(context = %id, %role, parent = ?parent, "context spawned");

        Self {
            handle: Arc::new(ContextHandle {
                id,
                role,
                parent,
                mailbox,
                synchronizer,
            }),
        }
    }

    pub fn id(&self) -> ContextId {
        self.handle.id
    }

    pub fn role(&self) -> ContextRole {
        self.handle.role
    }

    /// The context this one was created from; `None` for the master.
    pub fn parent(&self) -> Option<ContextId> {
        self.handle.parent
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.handle.mailbox.send(command(tx)).ok()?;
        rx.await.ok()
    }

    fn closed(&self) -> ContextError {
        ContextError::Closed(self.id())
    }

    /// Stage a new object and return its reference.
    pub async fn insert(
        &self,
        entity: impl Into<String>,
        attributes: Attributes,
    ) -> ContextResult<ObjectRef> {
        let entity = entity.into();
        self.request(|reply| Command::Insert {
            entity,
            attributes,
            reply,
        })
        .await
        .ok_or_else(|| self.closed())
    }

    /// Stage every attribute in `attributes` on `reference`.
    pub async fn update(&self, reference: ObjectRef, attributes: Attributes) -> ContextResult<()> {
        let edits = attributes.into_iter().map(|(k, v)| (k, Some(v))).collect();
        self.edit(reference, edits).await
    }

    /// Stage a single attribute value.
    pub async fn set(
        &self,
        reference: ObjectRef,
        key: impl Into<String>,
        value: Value,
    ) -> ContextResult<()> {
        self.edit(reference, vec![(key.into(), Some(value))]).await
    }

    /// Stage the removal of an attribute.
    pub async fn remove_attribute(
        &self,
        reference: ObjectRef,
        key: impl Into<String>,
    ) -> ContextResult<()> {
        self.edit(reference, vec![(key.into(), None)]).await
    }

    async fn edit(&self, reference: ObjectRef, edits: Vec<AttributeEdit>) -> ContextResult<()> {
        self.request(|reply| Command::Update {
            reference,
            edits,
            reply,
        })
        .await
        .ok_or_else(|| self.closed())?
    }

    /// Stage a delete.
    pub async fn delete(&self, reference: ObjectRef) -> ContextResult<()> {
        self.request(|reply| Command::Delete { reference, reply })
            .await
            .ok_or_else(|| self.closed())?
    }

    /// This context's view of `reference`, faulting it in from the store on
    /// first access.
    pub async fn get(&self, reference: ObjectRef) -> ContextResult<Option<ManagedObject>> {
        self.request(|reply| Command::Get { reference, reply })
            .await
            .ok_or_else(|| self.closed())?
    }

    /// Commit pending edits without waiting for the merges into other
    /// contexts.
    ///
    /// With nothing pending this returns an empty, unstamped change set and
    /// commits nothing. On failure the pending edits are kept.
    pub async fn save(&self) -> Result<Arc<ChangeSet>, SaveError> {
        Ok(self.save_with_merges().await?.change_set)
    }

    /// Commit pending edits and hand back the merges still in flight.
    pub async fn save_with_merges(&self) -> Result<SaveOutcome, SaveError> {
        self.request(|reply| Command::Save { reply })
            .await
            .ok_or(SaveError::Closed(self.id()))?
    }

    /// Commit pending edits and wait until every other context has applied
    /// the merge.
    pub async fn save_and_wait(&self) -> Result<SaveReport, SaveError> {
        Ok(self.save_with_merges().await?.wait().await)
    }

    /// Discard all pending edits. Returns how many objects were touched.
    pub async fn rollback(&self) -> ContextResult<usize> {
        self.request(|reply| Command::Rollback { reply })
            .await
            .ok_or_else(|| self.closed())
    }

    pub async fn has_changes(&self) -> ContextResult<bool> {
        self.request(|reply| Command::HasChanges { reply })
            .await
            .ok_or_else(|| self.closed())
    }

    pub async fn stats(&self) -> ContextResult<ContextStats> {
        self.request(|reply| Command::Stats { reply })
            .await
            .ok_or_else(|| self.closed())
    }

    /// Returns `true` if this context holds a committed snapshot of
    /// `reference`.
    pub async fn is_materialized(&self, reference: ObjectRef) -> ContextResult<bool> {
        self.request(|reply| Command::IsMaterialized { reference, reply })
            .await
            .ok_or_else(|| self.closed())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.handle.id)
            .field("role", &self.handle.role)
            .field("parent", &self.handle.parent)
            .finish()
    }
}

struct ContextActor {
    state: ContextState,
    shared: Arc<Shared>,
    inbox: mpsc::UnboundedReceiver<Command>,
}

impl ContextActor {
    async fn run(mut self) {
        while let Some(command) = self.inbox.recv().await {
            self.handle(command).await;
        }
        debug!(context = %self.state.id(), "context stopped");
    }

    async fn handle(&mut self, command: Command) {
        // Replies are dropped silently when the caller stopped waiting.
        match command {
            Command::Insert {
                entity,
                attributes,
                reply,
            } => {
                let _ = reply.send(self.state.stage_insert(entity, attributes));
            }
            Command::Update {
                reference,
                edits,
                reply,
            } => {
                let result = self.state.stage_edits(reference, edits, self.shared.store());
                let _ = reply.send(result);
            }
            Command::Delete { reference, reply } => {
                let result = self.state.stage_delete(reference, self.shared.store());
                let _ = reply.send(result);
            }
            Command::Get { reference, reply } => {
                let result = self.state.get(&reference, self.shared.store());
                let _ = reply.send(result);
            }
            Command::Save { reply } => {
                let result = self.save().await;
                let _ = reply.send(result);
            }
            Command::Rollback { reply } => {
                let discarded = self.state.rollback();
                debug!(context = %self.state.id(), discarded, "pending edits rolled back");
                let _ = reply.send(discarded);
            }
            Command::HasChanges { reply } => {
                let _ = reply.send(self.state.has_changes());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.state.stats());
            }
            Command::IsMaterialized { reference, reply } => {
                let _ = reply.send(self.state.is_materialized(&reference));
            }
            Command::Merge { change_set, ack } => {
                self.merge(&change_set, ack).await;
            }
        }
    }

    async fn save(&mut self) -> Result<SaveOutcome, SaveError> {
        let change_set = self.state.prepare_save(self.shared.store())?;
        let (committed, merges) = self.shared.commit(change_set).await?;
        self.state.commit_succeeded(&committed);
        Ok(SaveOutcome {
            change_set: committed,
            merges,
        })
    }

    async fn merge(&mut self, change_set: &ChangeSet, ack: oneshot::Sender<MergeReport>) {
        let report = self.state.apply_merge(change_set);
        for issue in &report.issues {
            warn!(
                context = %report.target,
                origin = %report.origin,
                seq = ?report.seq,
                %issue,
                "merge entry not applied"
            );
        }
        debug!(
            context = %report.target,
            origin = %report.origin,
            seq = ?report.seq,
            updated = report.applied_updates,
            deleted = report.applied_deletes,
            inserted = report.skipped_inserts,
            "merge applied"
        );
        let _ = ack.send(report);

        if self.state.role() == ContextRole::Master
            && self.shared.config().auto_save_master_after_merge
            && self.state.has_changes()
        {
            match self.save().await {
                Ok(outcome) => {
                    debug!(context = %self.state.id(), seq = ?outcome.change_set.seq(), "master auto-saved");
                }
                Err(e) => {
                    warn!(context = %self.state.id(), error = %e, "master auto-save failed");
                }
            }
        }
    }
}
