use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::diff::AttributeDiff;
use crate::identity::ObjectRef;

/// Attribute map of a managed object. Ordered so that diffs and encodings
/// are deterministic.
pub type Attributes = BTreeMap<String, Value>;

/// A persisted object: its identity, entity name and attribute values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedObject {
    pub reference: ObjectRef,
    pub entity: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl ManagedObject {
    /// Create an object with a freshly allocated reference.
    pub fn new(entity: impl Into<String>, attributes: Attributes) -> Self {
        Self::with_reference(ObjectRef::new(), entity, attributes)
    }

    pub fn with_reference(
        reference: ObjectRef,
        entity: impl Into<String>,
        attributes: Attributes,
    ) -> Self {
        Self {
            reference,
            entity: entity.into(),
            attributes,
        }
    }

    /// Value of a single attribute.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Apply an attribute diff to this object's values.
    pub fn apply_diff(&mut self, diff: &AttributeDiff) {
        diff.apply_to(&mut self.attributes);
    }
}
