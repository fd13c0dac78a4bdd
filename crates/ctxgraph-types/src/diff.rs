//! Attribute-level diff: compare two attribute maps of one object.
//!
//! Every change records the base value it was computed against. Stores use
//! the base for optimistic conflict detection at commit time, and contexts
//! use it to tell a fresh merge from one their materialized copy has already
//! seen.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::object::Attributes;

/// The attribute changes made to one object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDiff {
    pub changes: Vec<AttributeChange>,
}

/// A single attribute change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AttributeChange {
    /// The attribute was added (`old == None`) or modified.
    Set {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none", with = "present")]
        old: Option<Value>,
        new: Value,
    },
    /// The attribute was removed.
    Removed { key: String, old: Value },
}

impl AttributeChange {
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Removed { key, .. } => key,
        }
    }

    /// The base value this change was computed against.
    pub fn old(&self) -> Option<&Value> {
        match self {
            Self::Set { old, .. } => old.as_ref(),
            Self::Removed { old, .. } => Some(old),
        }
    }

    /// The value after the change (`None` for a removal).
    pub fn new_value(&self) -> Option<&Value> {
        match self {
            Self::Set { new, .. } => Some(new),
            Self::Removed { .. } => None,
        }
    }
}

impl AttributeDiff {
    /// Create an empty diff.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if there are no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn push(&mut self, change: AttributeChange) {
        self.changes.push(change);
    }

    /// Keys touched by this diff, in change order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(AttributeChange::key)
    }

    /// Number of set (added or modified) attributes.
    pub fn sets(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| matches!(c, AttributeChange::Set { .. }))
            .count()
    }

    /// Number of removed attributes.
    pub fn removals(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| matches!(c, AttributeChange::Removed { .. }))
            .count()
    }

    /// Apply every change to `attributes`, ignoring base values.
    pub fn apply_to(&self, attributes: &mut Attributes) {
        for change in &self.changes {
            match change {
                AttributeChange::Set { key, new, .. } => {
                    attributes.insert(key.clone(), new.clone());
                }
                AttributeChange::Removed { key, .. } => {
                    attributes.remove(key);
                }
            }
        }
    }

    /// Keys whose current value in `attributes` differs from the change's
    /// base value.
    pub fn stale_keys(&self, attributes: &Attributes) -> Vec<String> {
        self.changes
            .iter()
            .filter(|c| attributes.get(c.key()) != c.old())
            .map(|c| c.key().to_string())
            .collect()
    }

    /// Returns `true` if every change's base value matches `attributes`.
    pub fn base_matches(&self, attributes: &Attributes) -> bool {
        self.changes
            .iter()
            .all(|c| attributes.get(c.key()) == c.old())
    }

    /// Returns `true` if `attributes` already carries every change's result.
    pub fn already_applied(&self, attributes: &Attributes) -> bool {
        self.changes
            .iter()
            .all(|c| attributes.get(c.key()) == c.new_value())
    }
}

/// Encodes an absent base by omitting the field, so that a base value of
/// JSON `null` survives a round trip as `Some(Value::Null)`.
mod present {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &Option<Value>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => v.serialize(s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Value>, D::Error> {
        Value::deserialize(d).map(Some)
    }
}

/// Compute the diff that turns `old` into `new`.
///
/// Keys present only in `new`, or present in both with different values,
/// become `Set`; keys present only in `old` become `Removed`.
pub fn diff_attributes(old: &Attributes, new: &Attributes) -> AttributeDiff {
    let mut changes = Vec::new();

    for (key, old_val) in old {
        match new.get(key) {
            Some(new_val) if new_val != old_val => changes.push(AttributeChange::Set {
                key: key.clone(),
                old: Some(old_val.clone()),
                new: new_val.clone(),
            }),
            Some(_) => {}
            None => changes.push(AttributeChange::Removed {
                key: key.clone(),
                old: old_val.clone(),
            }),
        }
    }

    for (key, new_val) in new {
        if !old.contains_key(key) {
            changes.push(AttributeChange::Set {
                key: key.clone(),
                old: None,
                new: new_val.clone(),
            });
        }
    }

    AttributeDiff { changes }
}
