// storelens-core/src/database.rs
// Database facade: session, collection handles, aggregation, admin API

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::aggregation::{Pipeline, PipelineContext, PipelineSummary};
use crate::config::EngineConfig;
use crate::dates;
use crate::document::DocumentId;
use crate::error::Result;
use crate::find_options::FindOptions;
use crate::index::{IndexDefinition, IndexUsage};
use crate::profiler::{ProfileEntry, Profiler, ProfilingLevel, ProfilingStatus};
use crate::sharding::{Route, ShardDistribution, ShardKey, ShardingCatalog};
use crate::storage::{
    CollectionStats, DatabaseStats, DeleteResult, FindRequest, FindResult, MemoryStore, ScanStats,
    Session, Store, UpdateOptions, UpdateResult,
};

/// Per-call options of [`Database::aggregate`]
#[derive(Debug, Clone, Default)]
pub struct AggregateOptions {
    /// Index the source scan must use
    pub hint: Option<String>,
    /// Set from another thread to abort between stages
    pub cancel: Option<Arc<AtomicBool>>,
    /// Variables visible to every expression as `$$name`
    pub vars: Vec<(String, Value)>,
}

impl AggregateOptions {
    pub fn with_hint(mut self, index_name: &str) -> Self {
        self.hint = Some(index_name.to_string());
        self
    }

    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn with_var(mut self, name: &str, value: Value) -> Self {
        self.vars.push((name.to_string(), value));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateOutput {
    pub documents: Vec<Value>,
    pub summary: PipelineSummary,
    pub duration: Duration,
}

/// One database of a store plus its engine settings
///
/// The store may be shared with other `Database` values naming other
/// databases; profiler and sharding catalog belong to this handle.
pub struct Database {
    store: Arc<dyn Store>,
    session: Session,
    config: EngineConfig,
    profiler: Profiler,
    sharding: ShardingCatalog,
}

impl Database {
    /// Fresh in-memory store configured by `config`
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_store(Arc::new(MemoryStore::new()), config)
    }

    /// In-memory store with default settings
    pub fn in_memory() -> Self {
        let config = EngineConfig::default();
        Database {
            store: Arc::new(MemoryStore::new()),
            session: Session::new(&config.database),
            profiler: Profiler::new(config.profiling_level, config.slow_ms),
            sharding: ShardingCatalog::new(config.shard_count as usize),
            config,
        }
    }

    pub fn with_store(store: Arc<dyn Store>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        info!(database = %config.database, "database opened");
        Ok(Database {
            session: Session::new(&config.database),
            profiler: Profiler::new(config.profiling_level, config.slow_ms),
            sharding: ShardingCatalog::new(config.shard_count as usize),
            store,
            config,
        })
    }

    pub fn name(&self) -> &str {
        self.session.database()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Collection handle; the collection itself is created on first write
    pub fn collection(&self, name: &str) -> Collection<'_> {
        Collection {
            db: self,
            name: name.to_string(),
        }
    }

    pub fn list_collections(&self) -> Vec<String> {
        self.store.list_collections(&self.session)
    }

    pub fn drop_collection(&self, name: &str) -> Result<bool> {
        self.store.drop_collection(&self.session, name)
    }

    // ========================================================================
    // AGGREGATION
    // ========================================================================

    /// Parse and run a JSON pipeline against `collection`
    pub fn aggregate(
        &self,
        collection: &str,
        pipeline: &Value,
        options: &AggregateOptions,
    ) -> Result<AggregateOutput> {
        let pipeline = Pipeline::from_json(pipeline)?;
        self.run_pipeline(collection, &pipeline, options)
    }

    /// Run an already parsed pipeline. Partial output of a failed or
    /// cancelled run is discarded.
    pub fn run_pipeline(
        &self,
        collection: &str,
        pipeline: &Pipeline,
        options: &AggregateOptions,
    ) -> Result<AggregateOutput> {
        let started = Instant::now();
        let mut ctx = PipelineContext::new(&self.session, self.store.as_ref())
            .strict(self.config.strict_division)
            .parallel_lookup_threshold(self.config.parallel_lookup_threshold)
            .with_hint(options.hint.clone())
            .with_vars(options.vars.clone());
        if let Some(flag) = &options.cancel {
            ctx = ctx.with_cancel_flag(Arc::clone(flag));
        }

        let documents = pipeline.run(&ctx, collection)?;
        let summary = ctx.stats().summary();
        let duration = started.elapsed();

        let plan = if summary.indexes_used.is_empty() {
            "COLLSCAN".to_string()
        } else {
            format!("IXSCAN {}", summary.indexes_used.join(", "))
        };
        self.profile(
            "aggregate",
            collection,
            &ScanStats {
                docs_examined: summary.docs_examined,
                keys_examined: summary.keys_examined,
                n_returned: documents.len() as u64,
                index_used: None,
                plan,
            },
            duration,
        );
        debug!(
            collection,
            stages = pipeline.stages().len(),
            returned = documents.len(),
            "aggregate finished"
        );

        Ok(AggregateOutput {
            documents,
            summary,
            duration,
        })
    }

    /// Winning plan and execution statistics of a filter
    pub fn explain(&self, collection: &str, filter: &Value, options: FindOptions) -> Result<Value> {
        let request = FindRequest::new(collection, filter.clone()).with_options(options);
        self.store.explain(&self.session, &request)
    }

    // ========================================================================
    // ADMINISTRATION
    // ========================================================================

    /// Returns `false` when an identical index already existed
    pub fn create_index(&self, collection: &str, definition: IndexDefinition) -> Result<bool> {
        let started = Instant::now();
        let created = self.store.create_index(&self.session, collection, definition)?;
        self.profile("createIndexes", collection, &ScanStats::default(), started.elapsed());
        Ok(created)
    }

    pub fn drop_index(&self, collection: &str, name: &str) -> Result<()> {
        self.store.drop_index(&self.session, collection, name)
    }

    pub fn list_indexes(&self, collection: &str) -> Result<Vec<IndexDefinition>> {
        self.store.list_indexes(&self.session, collection)
    }

    pub fn index_stats(&self, collection: &str) -> Result<Vec<IndexUsage>> {
        self.store.index_stats(&self.session, collection)
    }

    pub fn set_validator(&self, collection: &str, validator: Option<Value>) -> Result<()> {
        self.store.set_validator(&self.session, collection, validator)
    }

    pub fn collection_stats(&self, collection: &str) -> Result<CollectionStats> {
        self.store.collection_stats(&self.session, collection)
    }

    pub fn database_stats(&self) -> DatabaseStats {
        self.store.database_stats(&self.session)
    }

    // ========================================================================
    // PROFILING
    // ========================================================================

    pub fn profiling_status(&self) -> ProfilingStatus {
        self.profiler.status()
    }

    /// Change level and (optionally) the slow-operation threshold; returns the
    /// previous settings
    pub fn set_profiling_level(&self, level: ProfilingLevel, slow_ms: Option<u64>) -> ProfilingStatus {
        let previous = self.profiler.set(level, slow_ms);
        info!(
            level = level.as_str(),
            slow_ms = self.profiler.status().slow_ms,
            "profiling level changed"
        );
        previous
    }

    pub fn profile_entries(&self) -> Vec<ProfileEntry> {
        self.profiler.entries()
    }

    pub fn clear_profile(&self) {
        self.profiler.clear();
    }

    fn profile(&self, op: &str, collection: &str, stats: &ScanStats, elapsed: Duration) {
        let entry = ProfileEntry {
            op: op.to_string(),
            ns: self.session.namespace(collection),
            millis: 0,
            docs_examined: stats.docs_examined,
            keys_examined: stats.keys_examined,
            n_returned: stats.n_returned,
            plan_summary: stats.plan.clone(),
            ts: dates::now_string(),
        };
        self.profiler.record(entry, elapsed);
    }

    // ========================================================================
    // SHARDING
    // ========================================================================

    /// `sh.enableSharding(db)`; `false` when already enabled
    pub fn enable_sharding(&self) -> bool {
        self.sharding.enable_sharding(self.name())
    }

    /// Turn sharding off again; fails while a collection is still sharded
    pub fn disable_sharding(&self) -> Result<bool> {
        self.sharding.disable_sharding(self.name())
    }

    pub fn is_sharding_enabled(&self) -> bool {
        self.sharding.is_enabled(self.name())
    }

    /// `sh.shardCollection(ns, key)`: requires sharding on the database and
    /// builds the index supporting the key first
    pub fn shard_collection(&self, collection: &str, key: ShardKey) -> Result<()> {
        if !self.is_sharding_enabled() {
            // Let the catalog produce the error without touching indexes
            return self
                .sharding
                .shard_collection(self.name(), collection, key, std::iter::empty());
        }
        self.store
            .create_index(&self.session, collection, key.supporting_index())?;
        let existing = self.store.get(&self.session, collection, &json!({}))?;
        self.sharding
            .shard_collection(self.name(), collection, key, existing.iter())
    }

    pub fn shard_key(&self, collection: &str) -> Option<ShardKey> {
        self.sharding.shard_key(self.name(), collection)
    }

    /// Shards a filter would be sent to
    pub fn route(&self, collection: &str, filter: &Value) -> Route {
        self.sharding.route(self.name(), collection, filter)
    }

    /// `getShardDistribution()`
    pub fn shard_distribution(&self, collection: &str) -> Result<Vec<ShardDistribution>> {
        let docs = self.store.get(&self.session, collection, &json!({}))?;
        Ok(self.sharding.distribution(self.name(), collection, docs.iter()))
    }
}

// ============================================================================
// COLLECTION HANDLE
// ============================================================================

/// Named collection of a [`Database`]; every call is profiled
pub struct Collection<'a> {
    db: &'a Database,
    name: String,
}

impl<'a> Collection<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn store(&self) -> &dyn Store {
        self.db.store.as_ref()
    }

    fn session(&self) -> &Session {
        &self.db.session
    }

    fn profile_write(&self, op: &str, n: u64, started: Instant) {
        let stats = ScanStats {
            n_returned: n,
            ..ScanStats::default()
        };
        self.db.profile(op, &self.name, &stats, started.elapsed());
    }

    pub fn insert_one(&self, document: Value) -> Result<DocumentId> {
        let started = Instant::now();
        let id = self.store().put(self.session(), &self.name, document)?;
        self.profile_write("insert", 1, started);
        Ok(id)
    }

    /// Ordered insert; a failure reports how many documents went in
    pub fn insert_many(&self, documents: Vec<Value>) -> Result<Vec<DocumentId>> {
        let started = Instant::now();
        let ids = self.store().put_many(self.session(), &self.name, documents)?;
        self.profile_write("insert", ids.len() as u64, started);
        Ok(ids)
    }

    pub fn find(&self, filter: &Value) -> Result<Vec<Value>> {
        Ok(self.find_with_options(filter, FindOptions::default())?.documents)
    }

    pub fn find_with_options(&self, filter: &Value, options: FindOptions) -> Result<FindResult> {
        let started = Instant::now();
        let request = FindRequest::new(&self.name, filter.clone()).with_options(options);
        let result = self.store().find(self.session(), &request)?;
        self.db.profile("query", &self.name, &result.stats, started.elapsed());
        Ok(result)
    }

    pub fn find_one(&self, filter: &Value) -> Result<Option<Value>> {
        let result = self.find_with_options(filter, FindOptions::new().with_limit(1))?;
        Ok(result.documents.into_iter().next())
    }

    pub fn count_documents(&self, filter: &Value) -> Result<u64> {
        self.store().count(self.session(), &self.name, filter)
    }

    pub fn update_one(&self, filter: &Value, update: &Value) -> Result<UpdateResult> {
        self.update_with_options(filter, update, &UpdateOptions::one())
    }

    pub fn update_many(&self, filter: &Value, update: &Value) -> Result<UpdateResult> {
        self.update_with_options(filter, update, &UpdateOptions::many())
    }

    pub fn update_with_options(
        &self,
        filter: &Value,
        update: &Value,
        options: &UpdateOptions,
    ) -> Result<UpdateResult> {
        let started = Instant::now();
        let result = self
            .store()
            .update(self.session(), &self.name, filter, update, options)?;
        self.profile_write("update", result.modified, started);
        Ok(result)
    }

    /// Replace by `_id`, inserting when absent
    pub fn replace(&self, id: &Value, document: Value) -> Result<bool> {
        self.store().replace(self.session(), &self.name, id, document)
    }

    pub fn delete_one(&self, filter: &Value) -> Result<DeleteResult> {
        self.delete(filter, false)
    }

    pub fn delete_many(&self, filter: &Value) -> Result<DeleteResult> {
        self.delete(filter, true)
    }

    fn delete(&self, filter: &Value, multi: bool) -> Result<DeleteResult> {
        let started = Instant::now();
        let result = self.store().delete(self.session(), &self.name, filter, multi)?;
        self.profile_write("remove", result.deleted, started);
        Ok(result)
    }

    pub fn aggregate(&self, pipeline: &Value) -> Result<Vec<Value>> {
        Ok(self
            .db
            .aggregate(&self.name, pipeline, &AggregateOptions::default())?
            .documents)
    }

    pub fn explain(&self, filter: &Value, options: FindOptions) -> Result<Value> {
        self.db.explain(&self.name, filter, options)
    }

    pub fn create_index(&self, definition: IndexDefinition) -> Result<bool> {
        self.db.create_index(&self.name, definition)
    }

    pub fn stats(&self) -> Result<CollectionStats> {
        self.db.collection_stats(&self.name)
    }
}
