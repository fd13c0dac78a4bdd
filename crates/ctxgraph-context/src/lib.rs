//! Context hierarchy over a single persistent store.
//!
//! A [`StoreCoordinator`] owns the store and, once opened, a master context
//! and a long-lived background context. Any number of child contexts can be
//! created on demand. Each context is an actor holding its own materialized
//! snapshots and pending edits; saving one commits its change set through
//! the coordinator, which serializes commits and has the
//! [`SaveSynchronizer`] merge the result into every other live context.
//!
//! # Guarantees
//!
//! 1. At most one change set is being committed to the store at any instant.
//! 2. A context never merges its own change set.
//! 3. Every context applies merges in global commit order, one at a time.
//! 4. A failed save leaves the store untouched and the pending edits intact.
//! 5. Saving with nothing pending commits nothing and merges nothing.

pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod merge;
pub mod state;
pub mod synchronizer;

pub use config::CoordinatorConfig;
pub use context::{Context, SaveOutcome, SaveReport};
pub use coordinator::{CombinedSave, StoreCoordinator};
pub use error::{
    ContextError, ContextResult, CoordinatorError, CoordinatorResult, OpenError, SaveError,
};
pub use merge::{MergeIssue, MergeReport};
pub use state::{AttributeEdit, ContextState, ContextStats};
pub use synchronizer::{PendingMerges, SaveSynchronizer};
