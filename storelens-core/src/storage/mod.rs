// src/storage/mod.rs
//! Document store adapter
//!
//! ```text
//! DocumentStore + StoreAdmin (traits.rs)
//!   └── MemoryStore (memory_storage.rs)
//!         ├── IndexManager per collection
//!         ├── CompiledSchema validator per collection
//!         └── update operators (update_ops.rs)
//! ```

pub mod memory_storage;
pub mod traits;
pub mod update_ops;

pub use memory_storage::MemoryStore;
pub use traits::{DocumentStore, Store, StoreAdmin};

use crate::find_options::FindOptions;
use serde::Serialize;
use serde_json::{Map, Value};

/// Explicit database context passed to every store call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Session {
    database: String,
}

impl Session {
    pub fn new(database: &str) -> Self {
        Session {
            database: database.to_string(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// `database.collection`
    pub fn namespace(&self, collection: &str) -> String {
        format!("{}.{}", self.database, collection)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindRequest {
    pub collection: String,
    pub filter: Value,
    pub options: FindOptions,
}

impl FindRequest {
    pub fn new(collection: &str, filter: Value) -> Self {
        FindRequest {
            collection: collection.to_string(),
            filter,
            options: FindOptions::default(),
        }
    }

    /// Every document of a collection
    pub fn all(collection: &str) -> Self {
        Self::new(collection, Value::Object(Map::new()))
    }

    pub fn with_options(mut self, options: FindOptions) -> Self {
        self.options = options;
        self
    }
}

/// What a find had to touch to produce its result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub docs_examined: u64,
    pub keys_examined: u64,
    pub n_returned: u64,
    pub index_used: Option<String>,
    /// Plan summary, e.g. `IXSCAN { customer_id: 1 }` or `COLLSCAN`
    pub plan: String,
}

impl ScanStats {
    pub fn is_collection_scan(&self) -> bool {
        self.index_used.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindResult {
    pub documents: Vec<Value>,
    pub stats: ScanStats,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOptions {
    pub multi: bool,
    /// Filters for `$[identifier]` path segments
    pub array_filters: Vec<Value>,
}

impl UpdateOptions {
    pub fn one() -> Self {
        Self::default()
    }

    pub fn many() -> Self {
        UpdateOptions {
            multi: true,
            ..Self::default()
        }
    }

    pub fn with_array_filters(mut self, filters: Vec<Value>) -> Self {
        self.array_filters = filters;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeleteResult {
    pub deleted: u64,
}

/// `db.collection.stats()`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionStats {
    pub ns: String,
    pub count: u64,
    pub size: u64,
    pub avg_obj_size: u64,
    pub nindexes: usize,
    pub index_names: Vec<String>,
    pub has_validator: bool,
}

/// `db.stats()`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseStats {
    pub db: String,
    pub collections: usize,
    pub objects: u64,
    pub data_size: u64,
    pub indexes: usize,
}
