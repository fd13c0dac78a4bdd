use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use ctxgraph_store::{ObjectGraphSchema, PersistentStore};
use ctxgraph_types::{ChangeSet, CommitSeq, CommitStamp, ContextId, ContextRole, ManagedObject, ObjectRef};

use crate::config::CoordinatorConfig;
use crate::context::{Context, SaveReport};
use crate::error::{ContextResult, CoordinatorError, CoordinatorResult, OpenError, SaveError};
use crate::synchronizer::{PendingMerges, SaveSynchronizer};

/// State shared by the coordinator and every context actor.
///
/// Holds no contexts, so actors can keep it alive without keeping each other
/// alive.
pub(crate) struct Shared {
    store: Arc<dyn PersistentStore>,
    config: CoordinatorConfig,
    schema: OnceLock<Arc<ObjectGraphSchema>>,
    /// Commit lock. Guards the last sequence number handed out.
    last_commit: Mutex<Option<CommitSeq>>,
    synchronizer: Arc<SaveSynchronizer>,
}

impl Shared {
    pub(crate) fn store(&self) -> &dyn PersistentStore {
        self.store.as_ref()
    }

    pub(crate) fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub(crate) fn synchronizer(&self) -> &Arc<SaveSynchronizer> {
        &self.synchronizer
    }

    /// Commit `change_set` to the store and dispatch its merges.
    ///
    /// At most one commit is in progress at a time. The merge is dispatched
    /// before the commit lock is released, so every context receives merges
    /// in commit order. An empty change set commits nothing.
    pub(crate) async fn commit(
        &self,
        change_set: ChangeSet,
    ) -> Result<(Arc<ChangeSet>, PendingMerges), SaveError> {
        if change_set.is_empty() {
            return Ok((Arc::new(change_set), PendingMerges::none()));
        }
        let schema = self.schema.get().ok_or(SaveError::NotOpen)?;
        if self.config.validate_on_save {
            schema.validate_change_set(&change_set)?;
        }

        let mut last = self.last_commit.lock().await;
        let seq = last.map_or(CommitSeq::first(), CommitSeq::next);
        let committed = Arc::new(change_set.stamped(CommitStamp::now(seq)));
        self.store.save(&committed)?;
        *last = Some(seq);
        let merges = self.synchronizer.dispatch(&committed);
        drop(last);

        debug!(
            node = %self.config.node_label,
            %seq,
            origin = %committed.origin(),
            inserted = committed.inserted().len(),
            updated = committed.updated().len(),
            deleted = committed.deleted().len(),
            "change set committed"
        );
        Ok((committed, merges))
    }
}

/// The contexts created at open time and owned for the coordinator's
/// lifetime.
struct Hierarchy {
    master: Context,
    background: Context,
}

/// Results of saving the background context and then the master.
#[derive(Clone, Debug)]
pub struct CombinedSave<T> {
    pub background: T,
    pub master: T,
}

/// Deregisters a context when dropped, on every exit path.
struct RegistrationScope {
    synchronizer: Arc<SaveSynchronizer>,
    id: ContextId,
}

impl Drop for RegistrationScope {
    fn drop(&mut self) {
        self.synchronizer.deregister(self.id);
    }
}

/// Owner of the persistent store and of the context hierarchy above it.
///
/// Cheap to clone; clones share the same store, contexts and commit lock.
///
/// ```no_run
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// use std::sync::Arc;
/// use ctxgraph_context::{ContextError, CoordinatorConfig, StoreCoordinator};
/// use ctxgraph_store::{InMemoryStore, ObjectGraphSchema};
///
/// let coordinator = StoreCoordinator::new(Arc::new(InMemoryStore::new()), CoordinatorConfig::default());
/// coordinator.open(ObjectGraphSchema::empty()).await?;
///
/// let report = coordinator
///     .save_data_in_background(|ctx| async move {
///         ctx.insert("Note", Default::default()).await?;
///         Ok::<_, ContextError>(())
///     })
///     .await?;
/// assert_eq!(report.change_set.inserted().len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct StoreCoordinator {
    shared: Arc<Shared>,
    hierarchy: Arc<OnceCell<Hierarchy>>,
}

impl StoreCoordinator {
    /// Create a coordinator over `store`. Nothing is opened yet.
    pub fn new(store: Arc<dyn PersistentStore>, config: CoordinatorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                config,
                schema: OnceLock::new(),
                last_commit: Mutex::new(None),
                synchronizer: Arc::new(SaveSynchronizer::new()),
            }),
            hierarchy: Arc::new(OnceCell::new()),
        }
    }

    /// Open the store with `schema` and create the master and background
    /// contexts.
    ///
    /// Once open, later calls return `Ok(())` without doing anything.
    /// Concurrent first calls are coalesced into one. A failed open leaves
    /// the coordinator unopened.
    pub async fn open(&self, schema: ObjectGraphSchema) -> Result<(), OpenError> {
        self.hierarchy
            .get_or_try_init(|| async move {
                let store = self.shared.store();
                store.open(&schema)?;
                let last = store.last_commit_seq()?;
                let fingerprint = schema.fingerprint();
                *self.shared.last_commit.lock().await = last;
                let _ = self.shared.schema.set(Arc::new(schema));

                let master = Context::spawn(Arc::clone(&self.shared), ContextRole::Master, None);
                let background = Context::spawn(
                    Arc::clone(&self.shared),
                    ContextRole::Background,
                    Some(master.id()),
                );
                info!(
                    node = %self.shared.config.node_label,
                    schema = %fingerprint.short_hex(),
                    last_commit = ?last,
                    master = %master.id(),
                    background = %background.id(),
                    "coordinator opened"
                );
                Ok::<_, OpenError>(Hierarchy { master, background })
            })
            .await
            .map(|_| ())
    }

    pub fn is_open(&self) -> bool {
        self.hierarchy.initialized()
    }

    fn hierarchy(&self) -> Result<&Hierarchy, SaveError> {
        self.hierarchy.get().ok_or(SaveError::NotOpen)
    }

    /// The master context.
    pub fn master_context(&self) -> CoordinatorResult<Context> {
        self.hierarchy
            .get()
            .map(|h| h.master.clone())
            .ok_or(CoordinatorError::NotOpen)
    }

    /// The long-lived default background context.
    pub fn background_context(&self) -> CoordinatorResult<Context> {
        self.hierarchy
            .get()
            .map(|h| h.background.clone())
            .ok_or(CoordinatorError::NotOpen)
    }

    /// Create a child of `parent`. It is registered for merges immediately
    /// and stays registered until its last handle is dropped.
    pub fn new_child_context(&self, parent: &Context) -> CoordinatorResult<Context> {
        if !self.is_open() {
            return Err(CoordinatorError::NotOpen);
        }
        Ok(Context::spawn(
            Arc::clone(&self.shared),
            ContextRole::Child,
            Some(parent.id()),
        ))
    }

    /// Create a child of the master context.
    pub fn new_managed_object_context(&self) -> CoordinatorResult<Context> {
        let master = self.master_context()?;
        self.new_child_context(&master)
    }

    /// Commit a change set built outside any context.
    ///
    /// Merges are dispatched to every registered context but not awaited.
    pub async fn commit(&self, change_set: ChangeSet) -> Result<Arc<ChangeSet>, SaveError> {
        self.hierarchy()?;
        let (committed, _merges) = self.shared.commit(change_set).await?;
        Ok(committed)
    }

    /// Read the committed state of `reference` straight from the store.
    ///
    /// Never waits on a commit in progress.
    pub fn fetch(&self, reference: &ObjectRef) -> CoordinatorResult<Option<ManagedObject>> {
        if !self.is_open() {
            return Err(CoordinatorError::NotOpen);
        }
        Ok(self.shared.store().fetch(reference)?)
    }

    /// All committed references.
    pub fn references(&self) -> CoordinatorResult<Vec<ObjectRef>> {
        if !self.is_open() {
            return Err(CoordinatorError::NotOpen);
        }
        Ok(self.shared.store().references()?)
    }

    /// Sequence number of the last committed change set.
    pub async fn last_commit_seq(&self) -> Option<CommitSeq> {
        *self.shared.last_commit.lock().await
    }

    /// Contexts currently registered for merges.
    pub fn registered_contexts(&self) -> Vec<ContextId> {
        self.shared
            .synchronizer
            .registered()
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    /// Registered contexts with their roles.
    pub fn registered_roles(&self) -> Vec<(ContextId, ContextRole)> {
        self.shared.synchronizer.registered()
    }

    /// The schema the coordinator was opened with.
    pub fn schema(&self) -> Option<Arc<ObjectGraphSchema>> {
        self.shared.schema.get().cloned()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// Save the master context without waiting for merges.
    pub async fn save_master_context(&self) -> Result<Arc<ChangeSet>, SaveError> {
        self.hierarchy()?.master.save().await
    }

    /// Save the master context and wait until every other context has
    /// merged the result.
    pub async fn save_master_context_merged(&self) -> Result<SaveReport, SaveError> {
        self.hierarchy()?.master.save_and_wait().await
    }

    /// Save the background context without waiting for merges.
    pub async fn save_background_context(&self) -> Result<Arc<ChangeSet>, SaveError> {
        self.hierarchy()?.background.save().await
    }

    /// Save the background context and wait for every merge.
    pub async fn save_background_context_merged(&self) -> Result<SaveReport, SaveError> {
        self.hierarchy()?.background.save_and_wait().await
    }

    /// Save the background context, wait for its merge into the master, then
    /// save the master. Only the background-to-master merge is awaited.
    ///
    /// If the background save fails the master is not saved.
    pub async fn save_master_and_background_context(
        &self,
    ) -> Result<CombinedSave<Arc<ChangeSet>>, SaveError> {
        let hierarchy = self.hierarchy()?;
        let mut outcome = hierarchy.background.save_with_merges().await?;
        outcome.merges.wait_for(hierarchy.master.id()).await;
        let master = hierarchy.master.save().await?;
        Ok(CombinedSave {
            background: outcome.change_set,
            master,
        })
    }

    /// Like [`save_master_and_background_context`](Self::save_master_and_background_context),
    /// but waits for every merge of both saves.
    pub async fn save_master_and_background_context_merged(
        &self,
    ) -> Result<CombinedSave<SaveReport>, SaveError> {
        let hierarchy = self.hierarchy()?;
        let background = hierarchy.background.save_and_wait().await?;
        let master = hierarchy.master.save_and_wait().await?;
        Ok(CombinedSave { background, master })
    }

    /// Run `edit` against a fresh child of the master, save it and wait for
    /// every merge.
    ///
    /// The child is deregistered when this returns, whether the edit block
    /// fails, the save fails or the edit block panics.
    pub async fn save_data_in_background<F, Fut>(&self, edit: F) -> CoordinatorResult<SaveReport>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = ContextResult<()>>,
    {
        let master = self.master_context()?;
        let context = Context::spawn(
            Arc::clone(&self.shared),
            ContextRole::Child,
            Some(master.id()),
        );
        let _scope = RegistrationScope {
            synchronizer: Arc::clone(&self.shared.synchronizer),
            id: context.id(),
        };

        edit(context.clone()).await?;
        let report = context.save_and_wait().await?;
        debug!(
            context = %context.id(),
            seq = ?report.seq(),
            merges = report.merges.len(),
            "background edit saved"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for StoreCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCoordinator")
            .field("open", &self.is_open())
            .field("contexts", &self.shared.synchronizer.len())
            .field("config", &self.shared.config)
            .finish()
    }
}
