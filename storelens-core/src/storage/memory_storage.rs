// storage/memory_storage.rs
//! In-memory store
//!
//! ```text
//! MemoryStore
//!   DashMap<(database, collection), Arc<RwLock<CollectionData>>>
//!                                        ├── BTreeMap<record, Document>   (insertion order)
//!                                        ├── IndexManager                 (_id_ + secondary + text)
//!                                        └── validator
//! ```
//!
//! Each write call holds its collection's write lock from matching to the
//! last index update, so the matched/modified/deleted counts it returns are
//! exactly the documents it changed even with concurrent writers.

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::document::{Document, DocumentId};
use crate::error::{Result, StoreLensError};
use crate::find_options::{apply_limit_skip, apply_projection, apply_sort, validate_projection, FindOptions};
use crate::index::{CollectionIndex, IndexDefinition, IndexManager, IndexUsage};
use crate::query::Query;
use crate::query_planner::{QueryPlan, QueryPlanner, QueryShape};
use crate::schema::CompiledSchema;
use crate::storage::traits::{DocumentStore, StoreAdmin};
use crate::storage::update_ops::{apply_update, validate_update};
use crate::storage::{
    CollectionStats, DatabaseStats, DeleteResult, FindRequest, FindResult, ScanStats, Session,
    UpdateOptions, UpdateResult,
};

type Namespace = (String, String);

#[derive(Debug, Default)]
struct CollectionData {
    docs: BTreeMap<u64, Document>,
    ids: AHashMap<DocumentId, u64>,
    next_record: u64,
    indexes: IndexManager,
    validator: Option<(Value, CompiledSchema)>,
}

/// Matching records of one scan
struct Scan {
    records: Vec<u64>,
    stats: ScanStats,
}

impl CollectionData {
    fn validate(&self, doc: &Value) -> Result<()> {
        match &self.validator {
            Some((_, schema)) => schema.validate(doc),
            None => Ok(()),
        }
    }

    fn insert(&mut self, doc: Document) -> Result<DocumentId> {
        self.validate(doc.as_value())?;
        let record = self.next_record;
        self.indexes.insert_document(record, doc.as_value())?;
        let id = doc.id.clone();
        self.ids.insert(id.clone(), record);
        self.docs.insert(record, doc);
        self.next_record += 1;
        Ok(id)
    }

    fn remove(&mut self, record: u64) -> Option<Document> {
        let doc = self.docs.remove(&record)?;
        self.indexes.remove_document(record, doc.as_value());
        self.ids.remove(&doc.id);
        Some(doc)
    }

    fn plan(&self, collection: &str, query: &Query, options: &FindOptions) -> Result<(QueryShape, QueryPlan)> {
        let mut shape = QueryShape::from_filter(
            collection,
            query.filter(),
            options.sort.as_deref().unwrap_or(&[]),
        );
        shape.text = query.text().is_some();
        let definitions = self.indexes.definitions();
        let plan = QueryPlanner::plan(
            &shape,
            &definitions,
            query.text().map(|t| t.terms.as_slice()),
            options.hint.as_deref(),
        )?;
        Ok((shape, plan))
    }

    /// Records matching the query, in storage order, stopping after `limit`
    fn scan(&self, plan: &QueryPlan, query: &Query, limit: Option<usize>) -> Result<Scan> {
        let mut stats = ScanStats {
            index_used: plan.index_name().map(str::to_string),
            plan: plan.summary(),
            ..ScanStats::default()
        };

        let candidates: Box<dyn Iterator<Item = u64> + '_> = match plan {
            QueryPlan::IndexScan {
                index_name,
                predicates,
                ..
            } => match self.indexes.get(index_name) {
                Some(CollectionIndex::Secondary(index)) => {
                    let outcome = index.scan(predicates);
                    stats.keys_examined = outcome.keys_examined;
                    Box::new(outcome.record_ids.into_iter())
                }
                _ => {
                    return Err(StoreLensError::IndexUnavailable(format!(
                        "index '{}' is not an ordered index",
                        index_name
                    )))
                }
            },
            QueryPlan::TextScan { index_name, terms } => {
                let index = self.indexes.text_index().ok_or_else(|| {
                    StoreLensError::IndexUnavailable(format!("text index '{}' not found", index_name))
                })?;
                let outcome = index.search(terms);
                stats.keys_examined = outcome.keys_examined;
                Box::new(outcome.record_ids.into_iter())
            }
            QueryPlan::CollectionScan => Box::new(self.docs.keys().copied()),
        };

        let mut records = Vec::new();
        for record in candidates {
            if limit.is_some_and(|limit| records.len() >= limit) {
                break;
            }
            let Some(doc) = self.docs.get(&record) else {
                continue;
            };
            stats.docs_examined += 1;
            if query.matches(doc.as_value())? {
                records.push(record);
            }
        }
        Ok(Scan { records, stats })
    }

    fn matching(&self, collection: &str, query: &Query, options: &FindOptions, limit: Option<usize>) -> Result<Scan> {
        let (_, plan) = self.plan(collection, query, options)?;
        self.scan(&plan, query, limit)
    }

    fn stats(&self, ns: String) -> CollectionStats {
        let count = self.docs.len() as u64;
        let size: u64 = self.docs.values().map(|d| d.size_bytes() as u64).sum();
        let definitions = self.indexes.definitions();
        CollectionStats {
            ns,
            count,
            size,
            avg_obj_size: if count == 0 { 0 } else { size / count },
            nindexes: definitions.len(),
            index_names: definitions.into_iter().map(|d| d.name).collect(),
            has_validator: self.validator.is_some(),
        }
    }
}

/// In-memory [`DocumentStore`] / [`StoreAdmin`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: DashMap<Namespace, Arc<RwLock<CollectionData>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn namespace(session: &Session, collection: &str) -> Result<Namespace> {
        if collection.is_empty() || collection.contains('$') {
            return Err(StoreLensError::InvalidQuery(format!(
                "Invalid collection name: '{}'",
                collection
            )));
        }
        Ok((session.database().to_string(), collection.to_string()))
    }

    fn existing(&self, session: &Session, collection: &str) -> Result<Option<Arc<RwLock<CollectionData>>>> {
        let ns = Self::namespace(session, collection)?;
        Ok(self.collections.get(&ns).map(|entry| Arc::clone(entry.value())))
    }

    fn required(&self, session: &Session, collection: &str) -> Result<Arc<RwLock<CollectionData>>> {
        self.existing(session, collection)?
            .ok_or_else(|| StoreLensError::CollectionNotFound(session.namespace(collection)))
    }

    /// Collections are created implicitly by their first write
    fn create_if_missing(&self, session: &Session, collection: &str) -> Result<Arc<RwLock<CollectionData>>> {
        let ns = Self::namespace(session, collection)?;
        let entry = self.collections.entry(ns).or_insert_with(|| {
            debug!(ns = %session.namespace(collection), "collection created");
            Arc::new(RwLock::new(CollectionData::default()))
        });
        Ok(Arc::clone(entry.value()))
    }
}

impl DocumentStore for MemoryStore {
    fn find(&self, session: &Session, request: &FindRequest) -> Result<FindResult> {
        let query = Query::from_json(&request.filter)?;
        let options = &request.options;
        if let Some(projection) = &options.projection {
            validate_projection(projection)?;
        }

        let Some(collection) = self.existing(session, &request.collection)? else {
            // A hint or $text still needs its index on a missing collection
            if options.hint.is_some() || query.text().is_some() {
                return Err(StoreLensError::IndexUnavailable(format!(
                    "no indexes on missing collection {}",
                    session.namespace(&request.collection)
                )));
            }
            return Ok(FindResult {
                documents: Vec::new(),
                stats: ScanStats {
                    plan: "EOF".to_string(),
                    ..ScanStats::default()
                },
            });
        };

        let data = collection.read();
        // Without a sort, limit and skip can stop the scan early
        let scan_limit = match (&options.sort, options.limit) {
            (None, Some(limit)) => Some(limit + options.skip.unwrap_or(0)),
            _ => None,
        };
        let Scan { records, mut stats } =
            data.matching(&request.collection, &query, options, scan_limit)?;

        let mut documents: Vec<Value> = records
            .iter()
            .filter_map(|record| data.docs.get(record))
            .map(|doc| doc.as_value().clone())
            .collect();
        drop(data);

        if let Some(sort) = &options.sort {
            apply_sort(&mut documents, sort);
        }
        let mut documents = apply_limit_skip(documents, options.skip, options.limit);
        if let Some(projection) = &options.projection {
            documents = documents.iter().map(|d| apply_projection(d, projection)).collect();
        }
        stats.n_returned = documents.len() as u64;

        debug!(
            ns = %session.namespace(&request.collection),
            plan = %stats.plan,
            docs_examined = stats.docs_examined,
            n_returned = stats.n_returned,
            "find"
        );
        Ok(FindResult { documents, stats })
    }

    fn count(&self, session: &Session, collection: &str, filter: &Value) -> Result<u64> {
        let query = Query::from_json(filter)?;
        let Some(data) = self.existing(session, collection)? else {
            return Ok(0);
        };
        let data = data.read();
        if query.is_empty() {
            return Ok(data.docs.len() as u64);
        }
        let scan = data.matching(collection, &query, &FindOptions::default(), None)?;
        Ok(scan.records.len() as u64)
    }

    fn explain(&self, session: &Session, request: &FindRequest) -> Result<Value> {
        let query = Query::from_json(&request.filter)?;
        let ((shape, plan), definitions) = match self.existing(session, &request.collection)? {
            Some(collection) => {
                let data = collection.read();
                (
                    data.plan(&request.collection, &query, &request.options)?,
                    data.indexes.definitions(),
                )
            }
            None => {
                let data = CollectionData::default();
                (
                    data.plan(&request.collection, &query, &request.options)?,
                    data.indexes.definitions(),
                )
            }
        };
        let mut explained = QueryPlanner::explain(&shape, &plan, &definitions);
        explained["queryPlanner"]["namespace"] = json!(session.namespace(&request.collection));

        let result = self.find(session, request)?;
        explained["executionStats"] = json!({
            "nReturned": result.stats.n_returned,
            "totalKeysExamined": result.stats.keys_examined,
            "totalDocsExamined": result.stats.docs_examined,
        });
        Ok(explained)
    }

    fn put(&self, session: &Session, collection: &str, document: Value) -> Result<DocumentId> {
        let document = Document::from_value(document)?;
        let target = self.create_if_missing(session, collection)?;
        let mut data = target.write();
        data.insert(document)
    }

    fn update(
        &self,
        session: &Session,
        collection: &str,
        filter: &Value,
        update: &Value,
        options: &UpdateOptions,
    ) -> Result<UpdateResult> {
        validate_update(update)?;
        let query = Query::from_json(filter)?;
        let not_found = || {
            StoreLensError::NotFound(format!(
                "no document in {} matches {}",
                session.namespace(collection),
                filter
            ))
        };
        let target = self.existing(session, collection)?.ok_or_else(not_found)?;
        let mut guard = target.write();
        let data = &mut *guard;

        let limit = if options.multi { None } else { Some(1) };
        let scan = data.matching(collection, &query, &FindOptions::default(), limit)?;
        if scan.records.is_empty() {
            return Err(not_found());
        }

        // Every new version is computed and validated before the first write
        let mut changes = Vec::new();
        for record in &scan.records {
            let Some(current) = data.docs.get(record) else {
                continue;
            };
            let mut body = current.as_value().clone();
            if apply_update(&mut body, update, &options.array_filters)? {
                data.validate(&body)?;
                changes.push((*record, Document::from_value(body)?));
            }
        }

        let mut applied: Vec<(u64, Document)> = Vec::with_capacity(changes.len());
        for (record, next) in changes {
            let Some(previous) = data.docs.get(&record).cloned() else {
                continue;
            };
            if let Err(e) = data
                .indexes
                .update_document(record, previous.as_value(), next.as_value())
            {
                // Undo the documents already swapped by this call
                for (record, old) in applied.into_iter().rev() {
                    if let Some(current) = data.docs.get(&record) {
                        let _ = data
                            .indexes
                            .update_document(record, current.as_value(), old.as_value());
                    }
                    data.docs.insert(record, old);
                }
                return Err(e);
            }
            data.docs.insert(record, next);
            applied.push((record, previous));
        }

        let result = UpdateResult {
            matched: scan.records.len() as u64,
            modified: applied.len() as u64,
        };
        debug!(
            ns = %session.namespace(collection),
            matched = result.matched,
            modified = result.modified,
            "update"
        );
        Ok(result)
    }

    fn replace(&self, session: &Session, collection: &str, id: &Value, document: Value) -> Result<bool> {
        let Value::Object(mut fields) = document else {
            return Err(StoreLensError::InvalidQuery(
                "Replacement must be a JSON object".to_string(),
            ));
        };
        fields.insert("_id".to_string(), id.clone());
        let next = Document::from_value(Value::Object(fields))?;

        let target = self.create_if_missing(session, collection)?;
        let mut guard = target.write();
        let data = &mut *guard;
        match data.ids.get(&next.id).copied() {
            Some(record) => {
                data.validate(next.as_value())?;
                let previous = data.docs.get(&record).cloned().ok_or_else(|| {
                    StoreLensError::NotFound(format!("record {} vanished", record))
                })?;
                data.indexes
                    .update_document(record, previous.as_value(), next.as_value())?;
                data.docs.insert(record, next);
                Ok(true)
            }
            None => {
                data.insert(next)?;
                Ok(false)
            }
        }
    }

    fn delete(&self, session: &Session, collection: &str, filter: &Value, multi: bool) -> Result<DeleteResult> {
        let query = Query::from_json(filter)?;
        let not_found = || {
            StoreLensError::NotFound(format!(
                "no document in {} matches {}",
                session.namespace(collection),
                filter
            ))
        };
        let target = self.existing(session, collection)?.ok_or_else(not_found)?;
        let mut data = target.write();

        let limit = if multi { None } else { Some(1) };
        let scan = data.matching(collection, &query, &FindOptions::default(), limit)?;
        if scan.records.is_empty() {
            return Err(not_found());
        }
        let deleted = scan
            .records
            .iter()
            .filter(|record| data.remove(**record).is_some())
            .count() as u64;

        debug!(ns = %session.namespace(collection), deleted, "delete");
        Ok(DeleteResult { deleted })
    }

    fn list_collections(&self, session: &Session) -> Vec<String> {
        let mut names: Vec<String> = self
            .collections
            .iter()
            .filter(|entry| entry.key().0 == session.database())
            .map(|entry| entry.key().1.clone())
            .collect();
        names.sort();
        names
    }

    fn drop_collection(&self, session: &Session, collection: &str) -> Result<bool> {
        let ns = Self::namespace(session, collection)?;
        let dropped = self.collections.remove(&ns).is_some();
        if dropped {
            info!(ns = %session.namespace(collection), "collection dropped");
        }
        Ok(dropped)
    }
}

impl StoreAdmin for MemoryStore {
    fn create_index(&self, session: &Session, collection: &str, definition: IndexDefinition) -> Result<bool> {
        let target = self.create_if_missing(session, collection)?;
        let mut guard = target.write();
        let data = &mut *guard;
        let name = definition.name.clone();
        let created = data.indexes.create(
            definition,
            data.docs.iter().map(|(record, doc)| (*record, doc.as_value())),
        )?;
        if created {
            info!(ns = %session.namespace(collection), index = %name, "index created");
        }
        Ok(created)
    }

    fn drop_index(&self, session: &Session, collection: &str, name: &str) -> Result<()> {
        let target = self.required(session, collection)?;
        let dropped = target.write().indexes.drop(name)?;
        info!(ns = %session.namespace(collection), index = %dropped.name, "index dropped");
        Ok(())
    }

    fn list_indexes(&self, session: &Session, collection: &str) -> Result<Vec<IndexDefinition>> {
        let target = self.required(session, collection)?;
        let definitions = target.read().indexes.definitions();
        Ok(definitions)
    }

    fn index_stats(&self, session: &Session, collection: &str) -> Result<Vec<IndexUsage>> {
        let target = self.required(session, collection)?;
        let usage = target.read().indexes.usage();
        Ok(usage)
    }

    fn set_validator(&self, session: &Session, collection: &str, validator: Option<Value>) -> Result<()> {
        let compiled = validator
            .map(|spec| CompiledSchema::from_value(&spec).map(|schema| (spec, schema)))
            .transpose()?;
        let target = self.create_if_missing(session, collection)?;
        target.write().validator = compiled;
        info!(ns = %session.namespace(collection), "validator updated");
        Ok(())
    }

    fn collection_stats(&self, session: &Session, collection: &str) -> Result<CollectionStats> {
        let target = self.required(session, collection)?;
        let stats = target.read().stats(session.namespace(collection));
        Ok(stats)
    }

    fn database_stats(&self, session: &Session) -> DatabaseStats {
        let mut stats = DatabaseStats {
            db: session.database().to_string(),
            collections: 0,
            objects: 0,
            data_size: 0,
            indexes: 0,
        };
        for entry in self.collections.iter() {
            if entry.key().0 != session.database() {
                continue;
            }
            let collection = entry.value().read().stats(String::new());
            stats.collections += 1;
            stats.objects += collection.count;
            stats.data_size += collection.size;
            stats.indexes += collection.nindexes;
        }
        stats
    }
}
