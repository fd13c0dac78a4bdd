//! Foundation types for ctxgraph.
//!
//! This crate provides the identity and value types shared by the store,
//! the contexts and the coordinator. Every other ctxgraph crate depends on
//! `ctxgraph-types`.
//!
//! # Key Types
//!
//! - [`ObjectRef`] -- store-wide identity of a persisted object (UUID v7)
//! - [`ContextId`] -- identity of one context in the hierarchy
//! - [`CommitSeq`] -- position of a change set in the global commit order
//! - [`ManagedObject`] -- an entity name plus its attribute map
//! - [`AttributeDiff`] -- attribute-level changes made to one object
//! - [`ChangeSet`] -- the immutable description of one committed save

pub mod changeset;
pub mod diff;
pub mod error;
pub mod identity;
pub mod object;

pub use changeset::{ChangeSet, ChangeSetBuilder, CommitStamp, ObjectUpdate};
pub use diff::{diff_attributes, AttributeChange, AttributeDiff};
pub use error::TypeError;
pub use identity::{CommitSeq, ContextId, ContextRole, ObjectRef};
pub use object::{Attributes, ManagedObject};
