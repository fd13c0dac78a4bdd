use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::oneshot;
use tracing::debug;

use ctxgraph_types::{ChangeSet, ContextId, ContextRole};

use crate::context::{Command, Mailbox};
use crate::merge::MergeReport;

/// A registered context: its role and a weak link to its mailbox.
struct Registration {
    role: ContextRole,
    mailbox: Weak<Mailbox>,
}

/// Fan-out of committed change sets to every other live context.
///
/// The registry holds weak links only, so being registered never keeps a
/// context alive. Dispatch snapshots the registry and releases the lock
/// before sending, so contexts can register or go away mid fan-out.
pub struct SaveSynchronizer {
    contexts: RwLock<BTreeMap<ContextId, Registration>>,
}

impl SaveSynchronizer {
    pub fn new() -> Self {
        Self {
            contexts: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn register(&self, id: ContextId, role: ContextRole, mailbox: &Arc<Mailbox>) {
        self.contexts
            .write()
            .expect("registry lock poisoned")
            .insert(
                id,
                Registration {
                    role,
                    mailbox: Arc::downgrade(mailbox),
                },
            );
        debug!(context = %id, %role, "context registered");
    }

    /// Remove `id` from the registry. Returns `false` if it was not registered.
    pub fn deregister(&self, id: ContextId) -> bool {
        let removed = self
            .contexts
            .write()
            .expect("registry lock poisoned")
            .remove(&id)
            .is_some();
        if removed {
            debug!(context = %id, "context deregistered");
        }
        removed
    }

    pub fn is_registered(&self, id: ContextId) -> bool {
        self.contexts
            .read()
            .expect("registry lock poisoned")
            .contains_key(&id)
    }

    /// Snapshot of the registered contexts and their roles.
    pub fn registered(&self) -> Vec<(ContextId, ContextRole)> {
        self.contexts
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|(id, reg)| (*id, reg.role))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue a merge of `change_set` on every registered context other
    /// than its origin.
    ///
    /// Never blocks on a target: mailboxes are unbounded and the returned
    /// [`PendingMerges`] is the only way to wait for the targets.
    pub fn dispatch(&self, change_set: &Arc<ChangeSet>) -> PendingMerges {
        let origin = change_set.origin();
        let mut dead = 0usize;
        let targets: Vec<(ContextId, Arc<Mailbox>)> = {
            let contexts = self.contexts.read().expect("registry lock poisoned");
            contexts
                .iter()
                .filter(|(id, _)| **id != origin)
                .filter_map(|(id, reg)| match reg.mailbox.upgrade() {
                    Some(mailbox) => Some((*id, mailbox)),
                    None => {
                        dead += 1;
                        None
                    }
                })
                .collect()
        };

        let mut acks = Vec::with_capacity(targets.len());
        for (id, mailbox) in targets {
            let (ack, rx) = oneshot::channel();
            let command = Command::Merge {
                change_set: Arc::clone(change_set),
                ack,
            };
            if mailbox.send(command).is_ok() {
                acks.push((id, rx));
            }
        }

        if dead > 0 {
            self.contexts
                .write()
                .expect("registry lock poisoned")
                .retain(|_, reg| reg.mailbox.strong_count() > 0);
        }

        debug!(
            origin = %origin,
            seq = ?change_set.seq(),
            targets = acks.len(),
            pruned = dead,
            "merge dispatched"
        );
        PendingMerges { acks }
    }
}

impl Default for SaveSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Merges dispatched for one commit that may still be in flight.
///
/// Dropping it does not cancel anything; the merges are applied either way.
#[derive(Debug, Default)]
pub struct PendingMerges {
    acks: Vec<(ContextId, oneshot::Receiver<MergeReport>)>,
}

impl PendingMerges {
    /// No merges: the result of an empty save.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.acks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }

    /// Contexts a merge was sent to.
    pub fn targets(&self) -> Vec<ContextId> {
        self.acks.iter().map(|(id, _)| *id).collect()
    }

    /// Wait for the merge into `target` only.
    ///
    /// Returns `None` if no merge was sent to `target`, or if the target
    /// stopped before applying it.
    pub async fn wait_for(&mut self, target: ContextId) -> Option<MergeReport> {
        let index = self.acks.iter().position(|(id, _)| *id == target)?;
        let (_, rx) = self.acks.swap_remove(index);
        rx.await.ok()
    }

    /// Wait until every target has applied the merge.
    ///
    /// Targets that stopped before applying it are left out of the result.
    pub async fn wait(self) -> Vec<MergeReport> {
        let mut reports = Vec::with_capacity(self.acks.len());
        for (_, rx) in self.acks {
            if let Ok(report) = rx.await {
                reports.push(report);
            }
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxgraph_types::{CommitSeq, CommitStamp, ManagedObject};
    use tokio::sync::mpsc;

    fn change_set(origin: ContextId) -> Arc<ChangeSet> {
        Arc::new(
            ChangeSet::builder(origin)
                .insert(ManagedObject::new("Note", Default::default()))
                .build()
                .stamped(CommitStamp::now(CommitSeq::first())),
        )
    }

    /// Register a bare mailbox and answer every merge with an empty report.
    fn fake_context(sync: &SaveSynchronizer, role: ContextRole) -> (ContextId, Arc<Mailbox>) {
        let id = ContextId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mailbox = Arc::new(tx);
        sync.register(id, role, &mailbox);
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                if let Command::Merge { change_set, ack } = command {
                    let _ = ack.send(MergeReport::new(id, change_set.origin(), change_set.seq()));
                }
            }
        });
        (id, mailbox)
    }

    #[tokio::test]
    async fn dispatch_skips_origin() {
        let sync = SaveSynchronizer::new();
        let (origin, _a) = fake_context(&sync, ContextRole::Child);
        let (other, _b) = fake_context(&sync, ContextRole::Master);

        let pending = sync.dispatch(&change_set(origin));
        assert_eq!(pending.targets(), vec![other]);

        let reports = pending.wait().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].target, other);
        assert_eq!(reports[0].origin, origin);
    }

    #[tokio::test]
    async fn dropped_contexts_are_skipped_and_pruned() {
        let sync = SaveSynchronizer::new();
        let (_live, _keep) = fake_context(&sync, ContextRole::Master);
        let (gone, mailbox) = fake_context(&sync, ContextRole::Child);
        drop(mailbox);
        assert!(sync.is_registered(gone));

        let pending = sync.dispatch(&change_set(ContextId::new()));
        assert_eq!(pending.len(), 1);
        assert!(!sync.is_registered(gone));
        assert_eq!(sync.len(), 1);
    }

    #[tokio::test]
    async fn wait_for_single_target() {
        let sync = SaveSynchronizer::new();
        let (a, _a) = fake_context(&sync, ContextRole::Master);
        let (b, _b) = fake_context(&sync, ContextRole::Background);

        let mut pending = sync.dispatch(&change_set(ContextId::new()));
        let report = pending.wait_for(a).await.unwrap();
        assert_eq!(report.target, a);
        assert_eq!(pending.targets(), vec![b]);
        assert!(pending.wait_for(a).await.is_none());
    }

    #[test]
    fn register_and_deregister() {
        let sync = SaveSynchronizer::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mailbox = Arc::new(tx);
        let id = ContextId::new();

        sync.register(id, ContextRole::Child, &mailbox);
        assert_eq!(sync.registered(), vec![(id, ContextRole::Child)]);
        assert!(sync.deregister(id));
        assert!(!sync.deregister(id));
        assert!(sync.is_empty());
    }

    #[test]
    fn empty_registry_dispatches_nothing() {
        let sync = SaveSynchronizer::new();
        let pending = sync.dispatch(&change_set(ContextId::new()));
        assert!(pending.is_empty());
    }
}
