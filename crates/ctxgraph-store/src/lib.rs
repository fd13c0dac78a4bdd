//! Persistent store collaborators for ctxgraph.
//!
//! The coordinator commits stamped [`ChangeSet`](ctxgraph_types::ChangeSet)s
//! to a [`PersistentStore`] and faults objects in from it. This crate holds
//! the store trait, the schema it is opened with, and two backends.
//!
//! # Storage Backends
//!
//! - [`InMemoryStore`] -- `BTreeMap`-based store for tests and embedding
//! - [`JournalStore`] -- append-only, CRC-framed journal replayed at open
//!
//! # Design Rules
//!
//! 1. A save is all-or-nothing: [`ObjectTable::check`] runs before any mutation.
//! 2. Updates carry their base values; a base that no longer matches is a conflict.
//! 3. Commit sequence numbers only move forward.
//! 4. All I/O errors are propagated, never silently ignored.

pub mod error;
pub mod journal;
pub mod memory;
pub mod schema;
pub mod table;
pub mod traits;

// Re-export primary types at crate root for ergonomic imports.
pub use error::{StoreError, StoreResult};
pub use journal::{JournalConfig, JournalStore, SyncMode};
pub use memory::InMemoryStore;
pub use schema::{
    AttributeDescription, AttributeKind, EntityDescription, ObjectGraphSchema, SchemaFingerprint,
    SchemaViolation,
};
pub use table::ObjectTable;
pub use traits::PersistentStore;
