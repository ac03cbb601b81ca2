//! Catalog mutations
//!
//! A transaction is recorded as an ordered list of mutations. Each mutation is
//! one line of newline-delimited JSON in the transaction's WAL body.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single attribute change inside an entity upsert.
///
/// A `null` value removes the attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub name: String,
    pub value: Value,
}

impl AttributeChange {
    pub fn set(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn remove(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Value::Null,
        }
    }
}

/// All mutations a transaction may record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// Create or update an entity; the collection is created when missing
    UpsertEntity {
        collection: String,
        primary_key: String,
        #[serde(default)]
        attributes: Vec<AttributeChange>,
    },
    /// Remove an entity; removing a missing entity is a no-op
    RemoveEntity {
        collection: String,
        primary_key: String,
    },
    /// Create an empty collection (schema mutation)
    CreateCollection { collection: String },
}

impl Mutation {
    pub fn upsert(
        collection: impl Into<String>,
        primary_key: impl Into<String>,
        attributes: Vec<AttributeChange>,
    ) -> Self {
        Mutation::UpsertEntity {
            collection: collection.into(),
            primary_key: primary_key.into(),
            attributes,
        }
    }

    pub fn remove(collection: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Mutation::RemoveEntity {
            collection: collection.into(),
            primary_key: primary_key.into(),
        }
    }

    pub fn create_collection(collection: impl Into<String>) -> Self {
        Mutation::CreateCollection {
            collection: collection.into(),
        }
    }

    /// Collection this mutation targets
    pub fn collection(&self) -> &str {
        match self {
            Mutation::UpsertEntity { collection, .. }
            | Mutation::RemoveEntity { collection, .. }
            | Mutation::CreateCollection { collection } => collection,
        }
    }

    /// Whether the mutation changes the catalog schema
    pub fn is_schema_mutation(&self) -> bool {
        matches!(self, Mutation::CreateCollection { .. })
    }

    /// Number of local (fine-grained) mutations this mutation expands into
    pub fn local_mutation_count(&self) -> u64 {
        match self {
            Mutation::UpsertEntity { attributes, .. } => (attributes.len() as u64).max(1),
            Mutation::RemoveEntity { .. } | Mutation::CreateCollection { .. } => 1,
        }
    }
}
