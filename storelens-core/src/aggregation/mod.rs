// src/aggregation/mod.rs
//! Aggregation pipeline evaluator
//!
//! A [`Pipeline`] is a list of closed [`Stage`] variants parsed once from
//! JSON. Running it against a collection pulls the source documents from the
//! store (pushing a leading `$match` down so indexes apply) and then feeds
//! each stage the full output of the previous one.
//!
//! ```text
//! store.find(leading $match) ─▶ stage 1 ─▶ stage 2 ─▶ … ─▶ output
//!                                   ▲ cancel flag checked between stages
//! ```

pub mod accumulators;
pub mod stages;

pub use accumulators::{Accumulator, AccumulatorSet};
pub use stages::{
    AddFieldsStage, BucketAutoStage, GroupStage, LookupStage, MatchStage, MergeStage,
    ProjectStage, SortStage, UnwindStage, WhenMatched, WhenNotMatched,
};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::error::{Result, StoreLensError};
use crate::expression::{EvalOptions, EvalStats};
use crate::find_options::FindOptions;
use crate::storage::{FindRequest, ScanStats, Session, Store};

// ============================================================================
// EXECUTION STATISTICS
// ============================================================================

/// `$merge` outcome counters
#[derive(Debug, Default)]
pub struct MergeStats {
    inserted: AtomicU64,
    matched: AtomicU64,
    modified: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeCounts {
    pub inserted: u64,
    pub matched: u64,
    pub modified: u64,
    pub discarded: u64,
}

impl MergeStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inserted(&self) {
        Self::bump(&self.inserted);
    }

    pub fn record_matched(&self) {
        Self::bump(&self.matched);
    }

    pub fn record_modified(&self) {
        Self::bump(&self.modified);
    }

    pub fn record_discarded(&self) {
        Self::bump(&self.discarded);
    }

    pub fn counts(&self) -> MergeCounts {
        MergeCounts {
            inserted: self.inserted.load(Ordering::Relaxed),
            matched: self.matched.load(Ordering::Relaxed),
            modified: self.modified.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Counters shared by a pipeline run and every `$lookup` sub-pipeline it
/// spawns, including those on worker threads
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub eval: EvalStats,
    pub merge: MergeStats,
    docs_examined: AtomicU64,
    keys_examined: AtomicU64,
    store_calls: AtomicU64,
    indexes_used: Mutex<Vec<String>>,
}

impl PipelineStats {
    pub fn record_scan(&self, scan: &ScanStats) {
        self.docs_examined.fetch_add(scan.docs_examined, Ordering::Relaxed);
        self.keys_examined.fetch_add(scan.keys_examined, Ordering::Relaxed);
        self.store_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(index) = &scan.index_used {
            let mut used = self.indexes_used.lock();
            if !used.contains(index) {
                used.push(index.clone());
            }
        }
    }

    pub fn summary(&self) -> PipelineSummary {
        PipelineSummary {
            docs_examined: self.docs_examined.load(Ordering::Relaxed),
            keys_examined: self.keys_examined.load(Ordering::Relaxed),
            store_calls: self.store_calls.load(Ordering::Relaxed),
            indexes_used: self.indexes_used.lock().clone(),
            undefined_ratios: self.eval.undefined_ratios(),
            merge: self.merge.counts(),
        }
    }
}

/// Snapshot of [`PipelineStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineSummary {
    pub docs_examined: u64,
    pub keys_examined: u64,
    pub store_calls: u64,
    /// Indexes used by any store call, in first-use order
    pub indexes_used: Vec<String>,
    pub undefined_ratios: u64,
    pub merge: MergeCounts,
}

// ============================================================================
// CONTEXT
// ============================================================================

/// Everything a stage needs besides its input documents
pub struct PipelineContext<'a> {
    pub session: &'a Session,
    pub store: &'a dyn Store,
    /// Fail with `DivisionUndefined` instead of yielding null
    pub strict: bool,
    /// Input size from which `$lookup` fans out to worker threads; 0 disables
    pub parallel_lookup_threshold: usize,
    /// Index hint for the source scan
    pub hint: Option<String>,
    cancel: Option<Arc<AtomicBool>>,
    stats: Arc<PipelineStats>,
    vars: Vec<(String, Value)>,
}

impl<'a> PipelineContext<'a> {
    pub fn new(session: &'a Session, store: &'a dyn Store) -> Self {
        PipelineContext {
            session,
            store,
            strict: false,
            parallel_lookup_threshold: 0,
            hint: None,
            cancel: None,
            stats: Arc::new(PipelineStats::default()),
            vars: Vec::new(),
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn parallel_lookup_threshold(mut self, threshold: usize) -> Self {
        self.parallel_lookup_threshold = threshold;
        self
    }

    pub fn with_hint(mut self, hint: Option<String>) -> Self {
        self.hint = hint;
        self
    }

    /// Abort between stages once `flag` is set
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn with_vars(mut self, vars: Vec<(String, Value)>) -> Self {
        self.vars = vars;
        self
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn vars(&self) -> &[(String, Value)] {
        &self.vars
    }

    pub fn eval_options(&self) -> EvalOptions<'_> {
        EvalOptions {
            strict: self.strict,
            stats: &self.stats.eval,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Context of a `$lookup` sub-pipeline: same store, flags and counters,
    /// its own variables and no hint
    pub fn child(&self, vars: Vec<(String, Value)>) -> PipelineContext<'a> {
        PipelineContext {
            session: self.session,
            store: self.store,
            strict: self.strict,
            parallel_lookup_threshold: self.parallel_lookup_threshold,
            hint: None,
            cancel: self.cancel.clone(),
            stats: Arc::clone(&self.stats),
            vars,
        }
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Pipeline stage
#[derive(Debug, Clone)]
pub enum Stage {
    Match(MatchStage),
    Project(ProjectStage),
    AddFields(AddFieldsStage),
    Group(GroupStage),
    Sort(SortStage),
    Limit(usize),
    Skip(usize),
    Unwind(UnwindStage),
    Lookup(LookupStage),
    BucketAuto(BucketAutoStage),
    Merge(MergeStage),
    Count(String),
    IndexStats,
}

impl Stage {
    /// Parse stage from JSON
    pub fn from_json(stage_json: &Value) -> Result<Self> {
        let obj = stage_json
            .as_object()
            .ok_or_else(|| StoreLensError::AggregationError("Stage must be an object".to_string()))?;
        let mut entries = obj.iter();
        let (name, spec) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => {
                return Err(StoreLensError::AggregationError(
                    "Each stage must have exactly one operator".to_string(),
                ))
            }
        };

        let stage = match name.as_str() {
            "$match" => Stage::Match(MatchStage::from_json(spec)?),
            "$project" => Stage::Project(ProjectStage::from_json(spec)?),
            "$addFields" | "$set" => Stage::AddFields(AddFieldsStage::from_json(spec, name)?),
            "$group" => Stage::Group(GroupStage::from_json(spec)?),
            "$sort" => Stage::Sort(SortStage::from_json(spec)?),
            "$limit" => Stage::Limit(stages::parse_limit(spec)?),
            "$skip" => Stage::Skip(stages::parse_skip(spec)?),
            "$unwind" => Stage::Unwind(UnwindStage::from_json(spec)?),
            "$lookup" => Stage::Lookup(LookupStage::from_json(spec)?),
            "$bucketAuto" => Stage::BucketAuto(BucketAutoStage::from_json(spec)?),
            "$merge" => Stage::Merge(MergeStage::from_json(spec)?),
            "$count" => Stage::Count(stages::parse_count(spec)?),
            "$indexStats" => {
                if !spec.as_object().is_some_and(|o| o.is_empty()) {
                    return Err(StoreLensError::AggregationError(
                        "$indexStats takes an empty object".to_string(),
                    ));
                }
                Stage::IndexStats
            }
            _ => {
                return Err(StoreLensError::AggregationError(format!(
                    "Unknown pipeline stage: {}",
                    name
                )))
            }
        };
        Ok(stage)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Project(_) => "$project",
            Stage::AddFields(_) => "$addFields",
            Stage::Group(_) => "$group",
            Stage::Sort(_) => "$sort",
            Stage::Limit(_) => "$limit",
            Stage::Skip(_) => "$skip",
            Stage::Unwind(_) => "$unwind",
            Stage::Lookup(_) => "$lookup",
            Stage::BucketAuto(_) => "$bucketAuto",
            Stage::Merge(_) => "$merge",
            Stage::Count(_) => "$count",
            Stage::IndexStats => "$indexStats",
        }
    }

    /// Execute this stage
    fn execute(&self, ctx: &PipelineContext<'_>, docs: Vec<Value>) -> Result<Vec<Value>> {
        match self {
            Stage::Match(stage) => stage.execute(ctx, docs),
            Stage::Project(stage) => stage.execute(ctx, docs),
            Stage::AddFields(stage) => stage.execute(ctx, docs),
            Stage::Group(stage) => stage.execute(ctx, docs),
            Stage::Sort(stage) => Ok(stage.execute(docs)),
            Stage::Limit(limit) => Ok(docs.into_iter().take(*limit).collect()),
            Stage::Skip(skip) => Ok(docs.into_iter().skip(*skip).collect()),
            Stage::Unwind(stage) => Ok(stage.execute(docs)),
            Stage::Lookup(stage) => stage.execute(ctx, docs),
            Stage::BucketAuto(stage) => stage.execute(ctx, docs),
            Stage::Merge(stage) => stage.execute(ctx, docs),
            Stage::Count(field) => Ok(stages::count_documents(field, docs)),
            Stage::IndexStats => Err(StoreLensError::AggregationError(
                "$indexStats is only valid as the first stage in a pipeline".to_string(),
            )),
        }
    }
}

/// Aggregation pipeline
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Create pipeline from JSON array
    pub fn from_json(pipeline_json: &Value) -> Result<Self> {
        let stages = pipeline_json.as_array().ok_or_else(|| {
            StoreLensError::AggregationError("Pipeline must be an array".to_string())
        })?;
        if stages.is_empty() {
            return Err(StoreLensError::AggregationError(
                "Pipeline cannot be empty".to_string(),
            ));
        }
        Self::from_stages(stages)
    }

    /// Like [`Pipeline::from_json`] but an empty list is allowed
    /// (`$lookup` sub-pipelines)
    pub fn from_stages(stages_json: &[Value]) -> Result<Self> {
        let stages = stages_json
            .iter()
            .map(Stage::from_json)
            .collect::<Result<Vec<_>>>()?;

        let last = stages.len().saturating_sub(1);
        for (i, stage) in stages.iter().enumerate() {
            match stage {
                Stage::Merge(_) if i != last => {
                    return Err(StoreLensError::AggregationError(
                        "$merge can only be the final stage in the pipeline".to_string(),
                    ))
                }
                Stage::IndexStats if i != 0 => {
                    return Err(StoreLensError::AggregationError(
                        "$indexStats is only valid as the first stage in a pipeline".to_string(),
                    ))
                }
                _ => {}
            }
        }
        Ok(Pipeline { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Collections the pipeline reads through `$lookup` or writes via `$merge`
    pub fn referenced_collections(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter_map(|stage| match stage {
                Stage::Lookup(lookup) => Some(lookup.from_collection()),
                Stage::Merge(merge) => Some(merge.target()),
                _ => None,
            })
            .collect()
    }

    /// Run against a collection of the context's store
    pub fn run(&self, ctx: &PipelineContext<'_>, collection: &str) -> Result<Vec<Value>> {
        if ctx.is_cancelled() {
            return Err(StoreLensError::Cancelled(0));
        }

        let options = FindOptions {
            hint: ctx.hint.clone(),
            ..FindOptions::default()
        };
        let (docs, start) = match self.stages.first() {
            Some(Stage::IndexStats) => {
                let usage = ctx.store.index_stats(ctx.session, collection)?;
                (usage.iter().map(|u| u.to_json()).collect(), 1)
            }
            Some(Stage::Match(stage)) => {
                let request = FindRequest::new(collection, stage.pushdown_filter(ctx.vars()))
                    .with_options(options);
                let result = ctx.store.find(ctx.session, &request)?;
                ctx.stats().record_scan(&result.stats);
                let docs = if stage.needs_expr_recheck(ctx.vars()) {
                    stage.retain_expr(ctx, result.documents)?
                } else {
                    result.documents
                };
                (docs, 1)
            }
            _ => {
                let request = FindRequest::all(collection).with_options(options);
                let result = ctx.store.find(ctx.session, &request)?;
                ctx.stats().record_scan(&result.stats);
                (result.documents, 0)
            }
        };

        self.execute_from(ctx, docs, start)
    }

    /// Run over already materialized documents
    pub fn execute(&self, ctx: &PipelineContext<'_>, docs: Vec<Value>) -> Result<Vec<Value>> {
        self.execute_from(ctx, docs, 0)
    }

    fn execute_from(&self, ctx: &PipelineContext<'_>, mut docs: Vec<Value>, start: usize) -> Result<Vec<Value>> {
        for (i, stage) in self.stages.iter().enumerate().skip(start) {
            if ctx.is_cancelled() {
                return Err(StoreLensError::Cancelled(i));
            }
            let input = docs.len();
            docs = stage.execute(ctx, docs)?;
            trace!(stage = stage.name(), input, output = docs.len(), "stage done");
        }
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexDefinition;
    use crate::storage::{DocumentStore, MemoryStore, StoreAdmin};
    use serde_json::json;

    fn store_with(collection: &str, docs: Vec<Value>) -> (MemoryStore, Session) {
        let store = MemoryStore::new();
        let session = Session::new("test");
        for doc in docs {
            store.put(&session, collection, doc).unwrap();
        }
        (store, session)
    }

    fn run(store: &MemoryStore, session: &Session, collection: &str, pipeline: Value) -> Result<Vec<Value>> {
        let ctx = PipelineContext::new(session, store);
        Pipeline::from_json(&pipeline)?.run(&ctx, collection)
    }

    // ========== PARSING TESTS ==========

    #[test]
    fn test_pipeline_not_array() {
        let err = Pipeline::from_json(&json!({"$match": {}})).unwrap_err();
        assert!(err.to_string().contains("Pipeline must be an array"));
    }

    #[test]
    fn test_pipeline_empty() {
        let err = Pipeline::from_json(&json!([])).unwrap_err();
        assert!(err.to_string().contains("Pipeline cannot be empty"));
    }

    #[test]
    fn test_stage_not_object() {
        let err = Pipeline::from_json(&json!(["$match"])).unwrap_err();
        assert!(err.to_string().contains("Stage must be an object"));
    }

    #[test]
    fn test_stage_multiple_operators() {
        let err = Pipeline::from_json(&json!([{"$match": {}, "$limit": 1}])).unwrap_err();
        assert!(err.to_string().contains("exactly one operator"));
    }

    #[test]
    fn test_stage_unknown_operator() {
        let err = Pipeline::from_json(&json!([{"$facet": {}}])).unwrap_err();
        assert!(err.to_string().contains("Unknown pipeline stage: $facet"));
    }

    #[test]
    fn test_merge_must_be_last() {
        let err = Pipeline::from_json(&json!([{"$merge": "out"}, {"$limit": 1}])).unwrap_err();
        assert!(err.to_string().contains("final stage"));
        let err = Pipeline::from_json(&json!([{"$limit": 1}, {"$indexStats": {}}])).unwrap_err();
        assert!(err.to_string().contains("first stage"));
    }

    // ========== EXECUTION TESTS ==========

    #[test]
    fn test_group_first_seen_order_and_zero_input() {
        let (store, session) = store_with(
            "orders",
            vec![
                json!({"_id": 1, "state": "SP", "total": 10}),
                json!({"_id": 2, "state": "RJ", "total": 5}),
                json!({"_id": 3, "state": "SP", "total": 1}),
            ],
        );
        let out = run(&store, &session, "orders", json!([
            {"$group": {"_id": "$state", "revenue": {"$sum": "$total"}, "n": {"$count": {}}}}
        ]))
        .unwrap();
        assert_eq!(out, vec![
            json!({"_id": "SP", "revenue": 11, "n": 2}),
            json!({"_id": "RJ", "revenue": 5, "n": 1}),
        ]);

        let out = run(&store, &session, "orders", json!([
            {"$match": {"state": "MG"}},
            {"$group": {"_id": null, "revenue": {"$sum": "$total"}}}
        ]))
        .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_unwind_preserve_and_index() {
        let (store, session) = store_with(
            "orders",
            vec![
                json!({"_id": 1, "items": [{"p": "a"}, {"p": "b"}]}),
                json!({"_id": 2, "items": []}),
                json!({"_id": 3}),
            ],
        );
        let out = run(&store, &session, "orders", json!([{"$unwind": "$items"}])).unwrap();
        assert_eq!(out.len(), 2);

        let out = run(&store, &session, "orders", json!([
            {"$unwind": {"path": "$items", "preserveNullAndEmptyArrays": true, "includeArrayIndex": "idx"}}
        ]))
        .unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[1], json!({"_id": 1, "items": {"p": "b"}, "idx": 1}));
        assert_eq!(out[2], json!({"_id": 2, "items": null, "idx": null}));
        assert_eq!(out[3], json!({"_id": 3, "items": null, "idx": null}));
    }

    #[test]
    fn test_lookup_equality_and_empty_match() {
        let (store, session) = store_with("orders", vec![json!({"_id": "o1"}), json!({"_id": "o2"})]);
        store.put(&session, "items", json!({"_id": 1, "order_id": "o1", "price": 3})).unwrap();
        store.put(&session, "items", json!({"_id": 2, "order_id": "o1", "price": 4})).unwrap();

        let out = run(&store, &session, "orders", json!([
            {"$lookup": {"from": "items", "localField": "_id", "foreignField": "order_id", "as": "items"}},
            {"$project": {"n": {"$size": "$items"}}}
        ]))
        .unwrap();
        assert_eq!(out, vec![json!({"_id": "o1", "n": 2}), json!({"_id": "o2", "n": 0})]);
    }

    #[test]
    fn test_lookup_correlated_pipeline_uses_index() {
        let (store, session) = store_with("orders", vec![json!({"_id": "o1", "min": 3})]);
        store.put(&session, "items", json!({"_id": 1, "order_id": "o1", "price": 3})).unwrap();
        store.put(&session, "items", json!({"_id": 2, "order_id": "o1", "price": 2})).unwrap();
        store.put(&session, "items", json!({"_id": 3, "order_id": "o2", "price": 9})).unwrap();
        store
            .create_index(&session, "items", IndexDefinition::new(&[("order_id", 1)]))
            .unwrap();

        let ctx = PipelineContext::new(&session, &store);
        let pipeline = Pipeline::from_json(&json!([
            {"$lookup": {
                "from": "items",
                "let": {"oid": "$_id", "floor": "$min"},
                "pipeline": [
                    {"$match": {"$expr": {"$and": [
                        {"$eq": ["$order_id", "$$oid"]},
                        {"$gte": ["$price", "$$floor"]}
                    ]}}}
                ],
                "as": "items"
            }}
        ]))
        .unwrap();
        let out = pipeline.run(&ctx, "orders").unwrap();
        assert_eq!(out[0]["items"], json!([{"_id": 1, "order_id": "o1", "price": 3}]));
        assert!(ctx.stats().summary().indexes_used.contains(&"order_id_1".to_string()));
    }

    #[test]
    fn test_parallel_lookup_keeps_order() {
        let orders: Vec<Value> = (0..40).map(|i| json!({"_id": i})).collect();
        let (store, session) = store_with("orders", orders);
        for i in 0..40 {
            store.put(&session, "items", json!({"order_id": i, "n": i * 2})).unwrap();
        }
        let pipeline = Pipeline::from_json(&json!([
            {"$lookup": {"from": "items", "localField": "_id", "foreignField": "order_id", "as": "items"}},
            {"$project": {"_id": 1, "n": {"$arrayElemAt": ["$items.n", 0]}}}
        ]))
        .unwrap();

        let sequential = pipeline.run(&PipelineContext::new(&session, &store), "orders").unwrap();
        let parallel = pipeline
            .run(&PipelineContext::new(&session, &store).parallel_lookup_threshold(4), "orders")
            .unwrap();
        assert_eq!(sequential, parallel);
        assert_eq!(parallel[39], json!({"_id": 39, "n": 78}));
    }

    #[test]
    fn test_bucket_auto_boundaries() {
        let docs: Vec<Value> = [10, 20, 20, 30, 40, 50, 60]
            .iter()
            .enumerate()
            .map(|(i, p)| json!({"_id": i, "price": p}))
            .collect();
        let (store, session) = store_with("items", docs);
        let out = run(&store, &session, "items", json!([
            {"$bucketAuto": {"groupBy": "$price", "buckets": 3}}
        ]))
        .unwrap();
        assert_eq!(out, vec![
            json!({"_id": {"min": 10, "max": 30}, "count": 3}),
            json!({"_id": {"min": 30, "max": 60}, "count": 3}),
            json!({"_id": {"min": 60, "max": 60}, "count": 1}),
        ]);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let (store, session) = store_with(
            "sales",
            vec![json!({"_id": 1, "day": "d1", "v": 2}), json!({"_id": 2, "day": "d1", "v": 3})],
        );
        let pipeline = json!([
            {"$group": {"_id": "$day", "total": {"$sum": "$v"}}},
            {"$merge": {"into": "summary", "on": "_id", "whenMatched": "replace", "whenNotMatched": "insert"}}
        ]);

        let ctx = PipelineContext::new(&session, &store);
        assert!(Pipeline::from_json(&pipeline).unwrap().run(&ctx, "sales").unwrap().is_empty());
        assert_eq!(ctx.stats().summary().merge.inserted, 1);
        let first = store.get(&session, "summary", &json!({})).unwrap();

        let ctx = PipelineContext::new(&session, &store);
        Pipeline::from_json(&pipeline).unwrap().run(&ctx, "sales").unwrap();
        let merge = ctx.stats().summary().merge;
        assert_eq!((merge.inserted, merge.matched, merge.modified), (0, 1, 0));
        assert_eq!(store.get(&session, "summary", &json!({})).unwrap(), first);
    }

    #[test]
    fn test_merge_on_requires_unique_index() {
        let (store, session) = store_with("sales", vec![json!({"_id": 1, "day": "d1"})]);
        let err = run(&store, &session, "sales", json!([
            {"$project": {"_id": 0, "day": 1}},
            {"$merge": {"into": "summary", "on": ["day"]}}
        ]))
        .unwrap_err();
        assert!(matches!(err, StoreLensError::IndexUnavailable(_)));
    }

    #[test]
    fn test_cancelled_pipeline_discards_results() {
        let (store, session) = store_with("orders", vec![json!({"_id": 1})]);
        let flag = Arc::new(AtomicBool::new(true));
        let ctx = PipelineContext::new(&session, &store).with_cancel_flag(flag);
        let err = Pipeline::from_json(&json!([{"$limit": 1}])).unwrap().run(&ctx, "orders").unwrap_err();
        assert!(matches!(err, StoreLensError::Cancelled(0)));
    }

    #[test]
    fn test_strict_division() {
        let (store, session) = store_with("items", vec![json!({"_id": 1, "a": 1, "b": 0})]);
        let pipeline = Pipeline::from_json(&json!([{"$project": {"r": {"$divide": ["$a", "$b"]}}}])).unwrap();

        let ctx = PipelineContext::new(&session, &store);
        let out = pipeline.run(&ctx, "items").unwrap();
        assert_eq!(out[0]["r"], Value::Null);
        assert_eq!(ctx.stats().summary().undefined_ratios, 1);

        let ctx = PipelineContext::new(&session, &store).strict(true);
        let err = pipeline.run(&ctx, "items").unwrap_err();
        assert!(matches!(err, StoreLensError::DivisionUndefined(_)));
    }

    #[test]
    fn test_index_stats_stage() {
        let (store, session) = store_with("orders", vec![json!({"_id": 1})]);
        let out = run(&store, &session, "orders", json!([
            {"$indexStats": {}},
            {"$project": {"_id": 0, "name": 1}}
        ]))
        .unwrap();
        assert_eq!(out, vec![json!({"name": "_id_"})]);
    }
}
