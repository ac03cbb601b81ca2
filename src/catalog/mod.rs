//! Versioned catalog snapshots
//!
//! A `Catalog` is the unit of database state the commit pipeline versions.
//! Snapshots are shared as `Arc<Catalog>` and never mutated once shared;
//! trunk incorporation clones the last finalized snapshot into a private
//! working copy, applies WAL-persisted mutations to it and publishes the
//! result as a new snapshot.
//!
//! Applying a mutation never fails. A transaction that reached the WAL must
//! always be incorporable, so missing collections are created on upsert and
//! removing a missing entity does nothing.

mod mutation;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use mutation::{AttributeChange, Mutation};

/// Attribute name to value
pub type Entity = BTreeMap<String, Value>;

/// Entities of one collection keyed by primary key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    entities: BTreeMap<String, Entity>,
}

impl Collection {
    pub fn entity(&self, primary_key: &str) -> Option<&Entity> {
        self.entities.get(primary_key)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// An immutable, versioned view of one catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    name: String,
    version: u64,
    schema_version: u64,
    collections: BTreeMap<String, Collection>,
}

impl Catalog {
    /// Empty catalog at version 0
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            schema_version: 0,
            collections: BTreeMap::new(),
        }
    }

    /// Same catalog positioned at the given versions
    pub fn with_versions(mut self, version: u64, schema_version: u64) -> Self {
        self.version = version;
        self.schema_version = schema_version;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn schema_version(&self) -> u64 {
        self.schema_version
    }

    pub fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.get(name)
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    pub fn entity(&self, collection: &str, primary_key: &str) -> Option<&Entity> {
        self.collection(collection)?.entity(primary_key)
    }

    /// Total number of entities across all collections
    pub fn entity_count(&self) -> usize {
        self.collections.values().map(Collection::len).sum()
    }

    /// Apply one mutation to this working copy.
    ///
    /// Returns the number of local mutations it expanded into.
    pub fn apply(&mut self, mutation: &Mutation) -> u64 {
        match mutation {
            Mutation::UpsertEntity {
                collection,
                primary_key,
                attributes,
            } => {
                let entity = self
                    .collections
                    .entry(collection.clone())
                    .or_default()
                    .entities
                    .entry(primary_key.clone())
                    .or_default();
                for change in attributes {
                    if change.value.is_null() {
                        entity.remove(&change.name);
                    } else {
                        entity.insert(change.name.clone(), change.value.clone());
                    }
                }
            }
            Mutation::RemoveEntity {
                collection,
                primary_key,
            } => {
                if let Some(target) = self.collections.get_mut(collection) {
                    target.entities.remove(primary_key);
                }
            }
            Mutation::CreateCollection { collection } => {
                self.collections.entry(collection.clone()).or_default();
            }
        }
        mutation.local_mutation_count()
    }

    /// Move the working copy to the versions of the transaction just applied.
    pub fn set_versions(&mut self, version: u64, schema_version: u64) {
        self.version = version;
        self.schema_version = schema_version;
    }

    /// Short description used by the CLI and logs
    pub fn summary(&self) -> CatalogSummary {
        CatalogSummary {
            name: self.name.clone(),
            version: self.version,
            schema_version: self.schema_version,
            collections: self
                .collections
                .iter()
                .map(|(name, c)| (name.clone(), c.len()))
                .collect(),
        }
    }
}

/// Entity counts per collection at one catalog version
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogSummary {
    pub name: String,
    pub version: u64,
    pub schema_version: u64,
    pub collections: BTreeMap<String, usize>,
}
