// src/sharding.rs
//! Shard keys and query routing
//!
//! Shards are modelled, not stored: every collection still lives in one
//! in-memory store, and the catalog only answers which shard a document or a
//! filter would go to. Routing never changes query results.
//!
//! Hashed keys spread values with a fixed-seed `ahash` so placement is stable
//! across processes. Ranged keys split the key space at quantiles of the
//! values present when the collection was sharded.

use crate::error::{Result, StoreLensError};
use crate::index::{IndexDefinition, IndexKey};
use crate::query_planner::QueryShape;
use crate::value_utils::{canonical_json_string, lookup_field};
use ahash::RandomState;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use tracing::info;

const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x5eed_0001_a5a5_0f0f,
    0x0bad_cafe_1234_5678,
    0x9e37_79b9_7f4a_7c15,
    0x2545_f491_4f6c_dd1d,
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ShardKey {
    Ranged(String),
    Hashed(String),
}

impl ShardKey {
    /// `{"_id": "hashed"}` or `{"customer_state": 1}`
    pub fn from_json(spec: &Value) -> Result<Self> {
        let obj = spec
            .as_object()
            .filter(|obj| obj.len() == 1)
            .ok_or_else(|| {
                StoreLensError::ShardingError("Shard key must name exactly one field".to_string())
            })?;
        let (field, kind) = obj.iter().next().ok_or_else(|| {
            StoreLensError::ShardingError("Shard key must name exactly one field".to_string())
        })?;
        match kind {
            Value::String(s) if s == "hashed" => Ok(ShardKey::Hashed(field.clone())),
            Value::Number(n) if n.as_i64() == Some(1) => Ok(ShardKey::Ranged(field.clone())),
            other => Err(StoreLensError::ShardingError(format!(
                "Unsupported shard key kind for '{}': {}",
                field, other
            ))),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            ShardKey::Ranged(field) | ShardKey::Hashed(field) => field,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut key = serde_json::Map::new();
        match self {
            ShardKey::Ranged(field) => key.insert(field.clone(), json!(1)),
            ShardKey::Hashed(field) => key.insert(field.clone(), json!("hashed")),
        };
        Value::Object(key)
    }

    /// Index that has to exist before a collection can be sharded on this key
    pub fn supporting_index(&self) -> IndexDefinition {
        match self {
            ShardKey::Ranged(field) => IndexDefinition::new(&[(field.as_str(), 1)]),
            ShardKey::Hashed(field) => IndexDefinition::hashed(field),
        }
    }
}

/// Where a query has to be sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Route {
    Targeted(usize),
    Broadcast,
}

/// Documents per shard, as in `getShardDistribution()`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardDistribution {
    pub shard: usize,
    pub documents: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
struct ShardedCollection {
    key: ShardKey,
    /// Ranged keys only: lower boundaries of shards 1..n
    split_points: Vec<IndexKey>,
}

impl ShardedCollection {
    fn shard_for_value(&self, value: &Value, shard_count: usize) -> usize {
        match &self.key {
            ShardKey::Hashed(_) => hash_shard(value, shard_count),
            ShardKey::Ranged(_) => self.range_shard(&IndexKey::from(value)),
        }
    }

    fn range_shard(&self, key: &IndexKey) -> usize {
        self.split_points.partition_point(|split| split <= key)
    }
}

fn hash_shard(value: &Value, shard_count: usize) -> usize {
    let state = RandomState::with_seeds(HASH_SEEDS.0, HASH_SEEDS.1, HASH_SEEDS.2, HASH_SEEDS.3);
    (state.hash_one(canonical_json_string(value)) % shard_count as u64) as usize
}

/// Cut sorted keys into `shard_count` runs of roughly equal size
fn split_points(mut keys: Vec<IndexKey>, shard_count: usize) -> Vec<IndexKey> {
    keys.sort();
    keys.dedup();
    if keys.is_empty() || shard_count < 2 {
        return Vec::new();
    }
    let per_shard = keys.len().div_ceil(shard_count);
    keys.into_iter()
        .skip(per_shard)
        .step_by(per_shard.max(1))
        .take(shard_count - 1)
        .collect()
}

/// Sharding metadata for every database of a store
#[derive(Debug)]
pub struct ShardingCatalog {
    shard_count: usize,
    enabled: RwLock<BTreeSet<String>>,
    collections: RwLock<BTreeMap<(String, String), ShardedCollection>>,
}

impl ShardingCatalog {
    pub fn new(shard_count: usize) -> Self {
        ShardingCatalog {
            shard_count: shard_count.max(1),
            enabled: RwLock::new(BTreeSet::new()),
            collections: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Returns `false` when the database was already enabled
    pub fn enable_sharding(&self, database: &str) -> bool {
        let added = self.enabled.write().insert(database.to_string());
        if added {
            info!(database, "sharding enabled");
        }
        added
    }

    /// Returns `false` when the database was not enabled. Refused while any
    /// of its collections still has a shard key.
    pub fn disable_sharding(&self, database: &str) -> Result<bool> {
        let mut enabled = self.enabled.write();
        let sharded: Vec<String> = self
            .collections
            .read()
            .keys()
            .filter(|(db, _)| db == database)
            .map(|(_, collection)| collection.clone())
            .collect();
        if !sharded.is_empty() {
            return Err(StoreLensError::ShardingError(format!(
                "cannot disable sharding for db {}: sharded collections {}",
                database,
                sharded.join(", ")
            )));
        }
        let removed = enabled.remove(database);
        if removed {
            info!(database, "sharding disabled");
        }
        Ok(removed)
    }

    pub fn is_enabled(&self, database: &str) -> bool {
        self.enabled.read().contains(database)
    }

    /// Declare the shard key of a collection; `existing` are the documents
    /// already stored, used to place ranged split points
    pub fn shard_collection<'a>(
        &self,
        database: &str,
        collection: &str,
        key: ShardKey,
        existing: impl Iterator<Item = &'a Value>,
    ) -> Result<()> {
        let enabled = self.enabled.read();
        if !enabled.contains(database) {
            return Err(StoreLensError::ShardingError(format!(
                "sharding not enabled for db {}",
                database
            )));
        }
        let mut collections = self.collections.write();
        let namespace = (database.to_string(), collection.to_string());
        if let Some(current) = collections.get(&namespace) {
            if current.key == key {
                return Ok(());
            }
            return Err(StoreLensError::ShardingError(format!(
                "{}.{} is already sharded with key {}",
                database,
                collection,
                current.key.to_json()
            )));
        }

        let split_points = match &key {
            ShardKey::Ranged(field) => split_points(
                existing
                    .map(|doc| {
                        lookup_field(doc, field)
                            .map(|v| IndexKey::from(v.as_ref()))
                            .unwrap_or(IndexKey::Null)
                    })
                    .collect(),
                self.shard_count,
            ),
            ShardKey::Hashed(_) => Vec::new(),
        };
        info!(
            namespace = %format!("{}.{}", database, collection),
            key = %key.to_json(),
            "collection sharded"
        );
        collections.insert(namespace, ShardedCollection { key, split_points });
        Ok(())
    }

    pub fn shard_key(&self, database: &str, collection: &str) -> Option<ShardKey> {
        self.collections
            .read()
            .get(&(database.to_string(), collection.to_string()))
            .map(|c| c.key.clone())
    }

    /// Shard a document is placed on; unsharded collections live on shard 0
    pub fn shard_for(&self, database: &str, collection: &str, doc: &Value) -> usize {
        let collections = self.collections.read();
        match collections.get(&(database.to_string(), collection.to_string())) {
            Some(sharded) => {
                let value = lookup_field(doc, sharded.key.field())
                    .map(|v| v.into_owned())
                    .unwrap_or(Value::Null);
                sharded.shard_for_value(&value, self.shard_count)
            }
            None => 0,
        }
    }

    /// Shards a filter has to visit
    pub fn route(&self, database: &str, collection: &str, filter: &Value) -> Route {
        let collections = self.collections.read();
        let Some(sharded) = collections.get(&(database.to_string(), collection.to_string())) else {
            return Route::Targeted(0);
        };
        let shape = QueryShape::from_filter(collection, filter, &[]);
        let field = sharded.key.field();

        let shards: BTreeSet<usize> = if let Some(values) = shape.equality_values(field) {
            values
                .iter()
                .map(|v| sharded.shard_for_value(v, self.shard_count))
                .collect()
        } else if let (ShardKey::Ranged(_), Some(range)) = (&sharded.key, shape.range(field)) {
            let low = match &range.lower {
                Bound::Included(v) | Bound::Excluded(v) => sharded.range_shard(&IndexKey::from(v)),
                Bound::Unbounded => 0,
            };
            let high = match &range.upper {
                Bound::Included(v) | Bound::Excluded(v) => sharded.range_shard(&IndexKey::from(v)),
                Bound::Unbounded => self.shard_count - 1,
            };
            (low..=high.max(low)).collect()
        } else {
            return Route::Broadcast;
        };

        match shards.len() {
            1 => shards
                .into_iter()
                .next()
                .map(Route::Targeted)
                .unwrap_or(Route::Broadcast),
            _ => Route::Broadcast,
        }
    }

    /// Per-shard document counts and sizes
    pub fn distribution<'a>(
        &self,
        database: &str,
        collection: &str,
        docs: impl Iterator<Item = &'a Value>,
    ) -> Vec<ShardDistribution> {
        let mut shards: Vec<ShardDistribution> = (0..self.shard_count)
            .map(|shard| ShardDistribution {
                shard,
                documents: 0,
                bytes: 0,
            })
            .collect();
        for doc in docs {
            let shard = self.shard_for(database, collection, doc);
            if let Some(entry) = shards.get_mut(shard) {
                entry.documents += 1;
                entry.bytes += doc.to_string().len() as u64;
            }
        }
        shards
    }
}
