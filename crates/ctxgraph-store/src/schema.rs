//! Object graph schema: entity descriptions supplied at open time.
//!
//! The schema is an external description of the application's model. The
//! store records its fingerprint when it is first opened and refuses to open
//! with a different one; contexts validate change sets against it before
//! committing.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ctxgraph_types::{AttributeChange, Attributes, ChangeSet, ObjectRef};

use crate::error::{StoreError, StoreResult};

/// Value type of a declared attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    String,
    Integer,
    Float,
    Boolean,
    /// Any JSON value.
    Json,
}

impl AttributeKind {
    /// Returns `true` if `value` is acceptable for this kind.
    ///
    /// `null` is accepted by every kind; requiredness is checked separately.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (Self::Json, _) => true,
            (Self::String, Value::String(_)) => true,
            (Self::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Self::Float, Value::Number(_)) => true,
            (Self::Boolean, Value::Bool(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Json => "json",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDescription {
    pub kind: AttributeKind,
    #[serde(default)]
    pub required: bool,
}

/// Declared attributes of one entity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescription {
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeDescription>,
    /// Accept attributes that are not declared.
    #[serde(default)]
    pub allow_undeclared: bool,
}

impl EntityDescription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an attribute.
    pub fn attribute(
        mut self,
        name: impl Into<String>,
        kind: AttributeKind,
        required: bool,
    ) -> Self {
        self.attributes
            .insert(name.into(), AttributeDescription { kind, required });
        self
    }

    pub fn allow_undeclared(mut self) -> Self {
        self.allow_undeclared = true;
        self
    }

    fn check_value(&self, key: &str, value: &Value) -> Result<(), String> {
        match self.attributes.get(key) {
            Some(desc) => {
                if desc.required && value.is_null() {
                    return Err(format!("required attribute `{key}` is null"));
                }
                if !desc.kind.accepts(value) {
                    return Err(format!(
                        "attribute `{key}` expects {}, got {value}",
                        desc.kind
                    ));
                }
                Ok(())
            }
            None if self.allow_undeclared => Ok(()),
            None => Err(format!("undeclared attribute `{key}`")),
        }
    }
}

/// A change set entry that does not satisfy the schema.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{entity}: {reason}")]
pub struct SchemaViolation {
    pub reference: Option<ObjectRef>,
    pub entity: String,
    pub reason: String,
}

impl SchemaViolation {
    fn new(reference: Option<ObjectRef>, entity: &str, reason: impl Into<String>) -> Self {
        Self {
            reference,
            entity: entity.to_string(),
            reason: reason.into(),
        }
    }
}

/// BLAKE3 hash of a schema's canonical JSON encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaFingerprint([u8; 32]);

impl SchemaFingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> StoreResult<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| StoreError::Serialization(format!("invalid fingerprint: {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| StoreError::Serialization("fingerprint must be 32 bytes".into()))?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for SchemaFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchemaFingerprint({})", self.short_hex())
    }
}

impl fmt::Display for SchemaFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Description of the entity types a store holds.
///
/// The default schema is empty and non-strict: it accepts every entity and
/// every attribute. Declared entities are always checked; undeclared
/// entities are rejected only in `strict` mode.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectGraphSchema {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub entities: BTreeMap<String, EntityDescription>,
}

impl ObjectGraphSchema {
    /// The empty, permissive schema.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, name: impl Into<String>, entity: EntityDescription) -> Self {
        self.entities.insert(name.into(), entity);
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDescription> {
        self.entities.get(name)
    }

    /// Parse a schema from TOML.
    pub fn from_toml_str(s: &str) -> StoreResult<Self> {
        toml::from_str(s).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Parse a schema from JSON.
    pub fn from_json_str(s: &str) -> StoreResult<Self> {
        serde_json::from_str(s).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn fingerprint(&self) -> SchemaFingerprint {
        // BTreeMaps keep the encoding canonical.
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"ctxgraph-schema-v1:");
        hasher.update(&encoded);
        SchemaFingerprint(*hasher.finalize().as_bytes())
    }

    /// Validate a complete object (an insertion).
    pub fn validate_object(
        &self,
        reference: Option<ObjectRef>,
        entity: &str,
        attributes: &Attributes,
    ) -> Result<(), SchemaViolation> {
        let Some(desc) = self.describe(reference, entity)? else {
            return Ok(());
        };
        for (key, value) in attributes {
            desc.check_value(key, value)
                .map_err(|reason| SchemaViolation::new(reference, entity, reason))?;
        }
        for (key, attr) in &desc.attributes {
            if attr.required && !attributes.contains_key(key) {
                return Err(SchemaViolation::new(
                    reference,
                    entity,
                    format!("missing required attribute `{key}`"),
                ));
            }
        }
        Ok(())
    }

    /// Validate the attribute changes of an update.
    pub fn validate_changes<'a>(
        &self,
        reference: Option<ObjectRef>,
        entity: &str,
        changes: impl IntoIterator<Item = &'a AttributeChange>,
    ) -> Result<(), SchemaViolation> {
        let Some(desc) = self.describe(reference, entity)? else {
            return Ok(());
        };
        for change in changes {
            match change {
                AttributeChange::Set { key, new, .. } => desc
                    .check_value(key, new)
                    .map_err(|reason| SchemaViolation::new(reference, entity, reason))?,
                AttributeChange::Removed { key, .. } => {
                    if desc.attributes.get(key).is_some_and(|a| a.required) {
                        return Err(SchemaViolation::new(
                            reference,
                            entity,
                            format!("cannot remove required attribute `{key}`"),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Validate every insertion and update of a change set.
    pub fn validate_change_set(&self, change_set: &ChangeSet) -> Result<(), SchemaViolation> {
        for object in change_set.inserted() {
            self.validate_object(Some(object.reference), &object.entity, &object.attributes)?;
        }
        for update in change_set.updated() {
            self.validate_changes(Some(update.reference), &update.entity, &update.diff.changes)?;
        }
        Ok(())
    }

    fn describe(
        &self,
        reference: Option<ObjectRef>,
        entity: &str,
    ) -> Result<Option<&EntityDescription>, SchemaViolation> {
        if entity.trim().is_empty() {
            return Err(SchemaViolation::new(reference, entity, "entity name is empty"));
        }
        match self.entities.get(entity) {
            Some(desc) => Ok(Some(desc)),
            None if self.strict => Err(SchemaViolation::new(reference, entity, "unknown entity")),
            None => Ok(None),
        }
    }
}
