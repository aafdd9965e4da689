// src/storage/traits.rs
//! Store abstraction used by the pipeline evaluator, the workflows and the
//! report runner. Every call names its database through a [`Session`].

use crate::document::DocumentId;
use crate::error::{Progress, Result, StoreLensError};
use crate::index::{IndexDefinition, IndexUsage};
use crate::storage::{
    CollectionStats, DatabaseStats, DeleteResult, FindRequest, FindResult, Session, UpdateOptions,
    UpdateResult,
};
use serde_json::Value;

/// Document CRUD and query submission
pub trait DocumentStore: Send + Sync {
    // ========================================================================
    // READS
    // ========================================================================

    /// Run a filter with options; the store picks an index when one applies
    fn find(&self, session: &Session, request: &FindRequest) -> Result<FindResult>;

    /// Matching documents in storage order
    fn get(&self, session: &Session, collection: &str, filter: &Value) -> Result<Vec<Value>> {
        let request = FindRequest::new(collection, filter.clone());
        Ok(self.find(session, &request)?.documents)
    }

    fn count(&self, session: &Session, collection: &str, filter: &Value) -> Result<u64> {
        Ok(self.get(session, collection, filter)?.len() as u64)
    }

    /// Winning plan and execution statistics of a find
    fn explain(&self, session: &Session, request: &FindRequest) -> Result<Value>;

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Insert one document, generating `_id` when missing
    ///
    /// Fails with `ConstraintViolation` on a duplicate `_id`, a unique index
    /// conflict or a validator breach; nothing is written in that case.
    fn put(&self, session: &Session, collection: &str, document: Value) -> Result<DocumentId>;

    /// Ordered insert that stops at the first failure
    fn put_many(
        &self,
        session: &Session,
        collection: &str,
        documents: Vec<Value>,
    ) -> Result<Vec<DocumentId>> {
        let mut inserted = Vec::with_capacity(documents.len());
        for document in documents {
            match self.put(session, collection, document) {
                Ok(id) => inserted.push(id),
                Err(e) => {
                    let progress = Progress::new().with("inserted", inserted.len() as u64);
                    return Err(StoreLensError::partial("insert_many", progress, e));
                }
            }
        }
        Ok(inserted)
    }

    /// Apply update operators to the first (or, with `multi`, every)
    /// matching document. `NotFound` when nothing matched.
    fn update(
        &self,
        session: &Session,
        collection: &str,
        filter: &Value,
        update: &Value,
        options: &UpdateOptions,
    ) -> Result<UpdateResult>;

    /// Replace the document with the given `_id`, inserting it when absent.
    /// Returns whether an existing document was replaced.
    fn replace(&self, session: &Session, collection: &str, id: &Value, document: Value)
        -> Result<bool>;

    /// Delete the first (or, with `multi`, every) matching document.
    /// `NotFound` when nothing matched.
    fn delete(
        &self,
        session: &Session,
        collection: &str,
        filter: &Value,
        multi: bool,
    ) -> Result<DeleteResult>;

    // ========================================================================
    // COLLECTIONS
    // ========================================================================

    fn list_collections(&self, session: &Session) -> Vec<String>;

    /// Returns `false` when the collection did not exist
    fn drop_collection(&self, session: &Session, collection: &str) -> Result<bool>;
}

/// Index, validator and statistics administration
pub trait StoreAdmin: Send + Sync {
    /// Build an index; `false` when an identical index already exists
    fn create_index(
        &self,
        session: &Session,
        collection: &str,
        definition: IndexDefinition,
    ) -> Result<bool>;

    fn drop_index(&self, session: &Session, collection: &str, name: &str) -> Result<()>;

    fn list_indexes(&self, session: &Session, collection: &str) -> Result<Vec<IndexDefinition>>;

    /// Per-index access counters (`$indexStats`)
    fn index_stats(&self, session: &Session, collection: &str) -> Result<Vec<IndexUsage>>;

    /// Install (or with `None`, remove) a `$jsonSchema` validator. Existing
    /// documents are not re-checked.
    fn set_validator(&self, session: &Session, collection: &str, validator: Option<Value>)
        -> Result<()>;

    fn collection_stats(&self, session: &Session, collection: &str) -> Result<CollectionStats>;

    fn database_stats(&self, session: &Session) -> DatabaseStats;
}

/// Full store interface
pub trait Store: DocumentStore + StoreAdmin {}

impl<T: DocumentStore + StoreAdmin> Store for T {}
