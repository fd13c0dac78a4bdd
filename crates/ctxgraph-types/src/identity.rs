use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Store-wide identity of a persisted object.
///
/// An `ObjectRef` is a time-ordered UUID (v7) allocated when an object is
/// first inserted. Two references with equal identity denote the same logical
/// object in every context, even while each context holds its own in-memory
/// copy with context-local edits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef(uuid::Uuid);

impl ObjectRef {
    /// Allocate a new time-ordered reference.
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    /// Short representation (last 8 hex characters).
    ///
    /// The leading characters of a v7 UUID encode the creation time and
    /// collide for objects created in the same millisecond.
    pub fn short_id(&self) -> String {
        let simple = self.0.simple().to_string();
        simple[simple.len() - 8..].to_string()
    }
}

impl Default for ObjectRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({})", self.short_id())
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObjectRef {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| TypeError::InvalidReference(format!("{s}: {e}")))
    }
}

/// Identity of one context in the hierarchy.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(uuid::Uuid);

impl ContextId {
    /// Generate a new context id.
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    /// Short representation used in log lines.
    pub fn short_id(&self) -> String {
        let simple = self.0.simple().to_string();
        format!("ctx:{}", &simple[simple.len() - 8..])
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextId({})", self.short_id())
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_id())
    }
}

impl FromStr for ContextId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| TypeError::InvalidContextId(format!("{s}: {e}")))
    }
}

/// Position of a context in the hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextRole {
    /// The root context, bound to the host's main execution domain.
    Master,
    /// The coordinator's long-lived default background context.
    Background,
    /// A context created on demand.
    Child,
}

impl fmt::Display for ContextRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Background => write!(f, "background"),
            Self::Child => write!(f, "child"),
        }
    }
}

/// Position of a change set in the global commit order.
///
/// Sequence numbers start at 1 and increase by one for every change set the
/// coordinator commits to the store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitSeq(u64);

impl CommitSeq {
    /// The first sequence number ever assigned.
    pub const fn first() -> Self {
        Self(1)
    }

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The sequence number following this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for CommitSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitSeq({})", self.0)
    }
}

impl fmt::Display for CommitSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_references_are_unique() {
        let a = ObjectRef::new();
        let b = ObjectRef::new();
        assert_ne!(a, b);
    }

    #[test]
    fn reference_parses_from_display() {
        let r = ObjectRef::new();
        let parsed: ObjectRef = r.to_string().parse().unwrap();
        assert_eq!(parsed, r);
    }

    #[test]
    fn invalid_reference_is_rejected() {
        let err = "not-a-uuid".parse::<ObjectRef>().unwrap_err();
        assert!(matches!(err, TypeError::InvalidReference(_)));
    }

    #[test]
    fn short_id_is_8_chars() {
        assert_eq!(ObjectRef::new().short_id().len(), 8);
        assert!(ContextId::new().short_id().starts_with("ctx:"));
    }

    #[test]
    fn commit_seq_advances() {
        let first = CommitSeq::first();
        assert_eq!(first.value(), 1);
        assert_eq!(first.next(), CommitSeq::new(2));
        assert!(first < first.next());
        assert_eq!(format!("{}", CommitSeq::new(7)), "#7");
    }

    #[test]
    fn role_display() {
        assert_eq!(ContextRole::Master.to_string(), "master");
        assert_eq!(ContextRole::Background.to_string(), "background");
        assert_eq!(ContextRole::Child.to_string(), "child");
    }

    #[test]
    fn serde_roundtrip() {
        let r = ObjectRef::new();
        let json = serde_json::to_string(&r).unwrap();
        let parsed: ObjectRef = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, r);
    }
}
