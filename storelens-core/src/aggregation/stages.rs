// src/aggregation/stages.rs
// Pipeline stage implementations

use ahash::AHashMap;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use tracing::debug;

use super::accumulators::{Accumulator, AccumulatorSet};
use super::{Pipeline, PipelineContext};
use crate::error::{Progress, Result, StoreLensError};
use crate::expression::Expr;
use crate::find_options::compare_by_keys;
use crate::query::Query;
use crate::storage::FindRequest;
use crate::value_utils::{
    canonical_json_string, get_nested_value, is_truthy, remove_nested_value, resolve_path,
    set_nested_value, total_cmp, values_equal,
};

fn stage_error(msg: impl Into<String>) -> StoreLensError {
    StoreLensError::AggregationError(msg.into())
}

fn stage_object<'a>(spec: &'a Value, stage: &str) -> Result<&'a Map<String, Value>> {
    spec.as_object()
        .ok_or_else(|| stage_error(format!("{} must be an object", stage)))
}

/// Field path of a `"$field"` argument
fn field_reference(value: &Value, what: &str) -> Result<String> {
    match value.as_str() {
        Some(s) if s.len() > 1 && s.starts_with('$') && !s.starts_with("$$") => Ok(s[1..].to_string()),
        _ => Err(stage_error(format!(
            "{} must be a field path starting with '$', got {}",
            what, value
        ))),
    }
}

fn positive_integer(value: &Value, what: &str) -> Result<usize> {
    match value.as_f64() {
        Some(n) if n >= 1.0 && n.fract() == 0.0 => Ok(n as usize),
        _ => Err(stage_error(format!("{} must be a positive integer, got {}", what, value))),
    }
}

// ============================================================================
// $match
// ============================================================================

/// `$match` - filter documents
///
/// A top-level `$expr` is kept apart from the rest of the filter so it can see
/// `$lookup` variables.
#[derive(Debug, Clone)]
pub struct MatchStage {
    filter: Value,
    rest: Value,
    query: Query,
    expr: Option<Expr>,
}

impl MatchStage {
    pub fn from_json(spec: &Value) -> Result<Self> {
        let obj = stage_object(spec, "$match")?;
        let mut rest = obj.clone();
        let expr = rest.shift_remove("$expr").map(|e| Expr::parse(&e)).transpose()?;
        let rest = Value::Object(rest);
        let query = Query::from_json(&rest)?;
        Ok(MatchStage {
            filter: spec.clone(),
            rest,
            query,
            expr,
        })
    }

    pub fn filter(&self) -> &Value {
        &self.filter
    }

    /// Whether the pushed-down filter leaves the `$expr` part to be checked
    pub(crate) fn needs_expr_recheck(&self, vars: &[(String, Value)]) -> bool {
        !vars.is_empty() && self.expr.is_some()
    }

    /// Filter handed to the store when this stage leads a pipeline
    ///
    /// Without variables the whole filter goes to the store. Inside a
    /// correlated `$lookup` the `$expr` equalities on bound variables become
    /// plain equality predicates, so the foreign collection's indexes apply.
    pub(crate) fn pushdown_filter(&self, vars: &[(String, Value)]) -> Value {
        let Some(expr) = self.expr.as_ref().filter(|_| !vars.is_empty()) else {
            return self.filter.clone();
        };
        let mut clauses = vec![self.rest.clone()];
        for (field, var) in expr.var_equalities() {
            if let Some((_, value)) = vars.iter().find(|(name, _)| *name == var) {
                clauses.push(json!({ field: { "$eq": value } }));
            }
        }
        if clauses.len() == 1 {
            return self.rest.clone();
        }
        json!({ "$and": clauses })
    }

    fn expr_matches(&self, ctx: &PipelineContext<'_>, doc: &Value) -> Result<bool> {
        match &self.expr {
            Some(expr) => Ok(is_truthy(
                &expr.evaluate_with(doc, ctx.vars(), ctx.eval_options())?,
            )),
            None => Ok(true),
        }
    }

    /// Apply only the `$expr` part, after the store evaluated the rest
    pub(crate) fn retain_expr(&self, ctx: &PipelineContext<'_>, docs: Vec<Value>) -> Result<Vec<Value>> {
        let mut kept = Vec::with_capacity(docs.len());
        for doc in docs {
            if self.expr_matches(ctx, &doc)? {
                kept.push(doc);
            }
        }
        Ok(kept)
    }

    pub fn execute(&self, ctx: &PipelineContext<'_>, docs: Vec<Value>) -> Result<Vec<Value>> {
        if self.query.text().is_some() {
            return Err(stage_error(
                "$text is only allowed in the first $match stage of a pipeline",
            ));
        }
        let mut results = Vec::new();
        for doc in docs {
            if self.query.matches(&doc)? && self.expr_matches(ctx, &doc)? {
                results.push(doc);
            }
        }
        Ok(results)
    }
}

// ============================================================================
// $project / $addFields
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectField {
    Include,
    Exclude,
    Computed(Expr),
}

/// `$project` - reshape documents
#[derive(Debug, Clone)]
pub struct ProjectStage {
    fields: Vec<(String, ProjectField)>,
    exclusion: bool,
}

impl ProjectStage {
    pub fn from_json(spec: &Value) -> Result<Self> {
        let obj = stage_object(spec, "$project")?;
        if obj.is_empty() {
            return Err(stage_error("$project requires at least one output field"));
        }

        let mut fields = Vec::with_capacity(obj.len());
        for (name, value) in obj {
            if name.starts_with('$') {
                return Err(stage_error(format!(
                    "FieldPath field names may not start with '$', got {}",
                    name
                )));
            }
            let field = match value {
                Value::Bool(flag) => flag_field(*flag),
                Value::Number(n) => flag_field(n.as_f64().is_some_and(|n| n != 0.0)),
                other => ProjectField::Computed(Expr::parse(other)?),
            };
            fields.push((name.clone(), field));
        }

        let has_exclusion = fields
            .iter()
            .any(|(name, f)| name != "_id" && *f == ProjectField::Exclude);
        let has_inclusion = fields
            .iter()
            .any(|(name, f)| name != "_id" && *f != ProjectField::Exclude);
        if has_exclusion && has_inclusion {
            let (name, _) = fields
                .iter()
                .find(|(name, f)| name != "_id" && *f == ProjectField::Exclude)
                .ok_or_else(|| stage_error("invalid projection"))?;
            return Err(stage_error(format!(
                "Cannot do exclusion on field {} in inclusion projection",
                name
            )));
        }
        let exclusion = !has_inclusion
            && fields
                .iter()
                .all(|(_, f)| *f == ProjectField::Exclude);

        Ok(ProjectStage { fields, exclusion })
    }

    fn project(&self, ctx: &PipelineContext<'_>, doc: &Value) -> Result<Value> {
        if self.exclusion {
            let mut out = doc.clone();
            for (path, _) in &self.fields {
                remove_nested_value(&mut out, path);
            }
            return Ok(out);
        }

        let mut out = Value::Object(Map::new());
        let id_excluded = self
            .fields
            .iter()
            .any(|(name, f)| name == "_id" && *f == ProjectField::Exclude);
        let id_listed = self.fields.iter().any(|(name, _)| name == "_id");
        if !id_excluded && !id_listed {
            if let Some(id) = doc.get("_id") {
                set_nested_value(&mut out, "_id", id.clone());
            }
        }

        for (path, field) in &self.fields {
            match field {
                ProjectField::Exclude => {}
                ProjectField::Include => {
                    if let Some(value) = resolve_path(doc, path) {
                        set_nested_value(&mut out, path, value);
                    }
                }
                ProjectField::Computed(expr) => {
                    let value = expr.evaluate_with(doc, ctx.vars(), ctx.eval_options())?;
                    set_nested_value(&mut out, path, value);
                }
            }
        }
        Ok(out)
    }

    pub fn execute(&self, ctx: &PipelineContext<'_>, docs: Vec<Value>) -> Result<Vec<Value>> {
        docs.iter().map(|doc| self.project(ctx, doc)).collect()
    }
}

fn flag_field(include: bool) -> ProjectField {
    if include {
        ProjectField::Include
    } else {
        ProjectField::Exclude
    }
}

/// `$addFields` / `$set` - add or overwrite computed fields
#[derive(Debug, Clone)]
pub struct AddFieldsStage {
    fields: Vec<(String, Expr)>,
}

impl AddFieldsStage {
    pub fn from_json(spec: &Value, stage: &str) -> Result<Self> {
        let obj = stage_object(spec, stage)?;
        if obj.is_empty() {
            return Err(stage_error(format!("{} requires at least one field", stage)));
        }
        let fields = obj
            .iter()
            .map(|(name, value)| Ok((name.clone(), Expr::parse(value)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(AddFieldsStage { fields })
    }

    pub fn execute(&self, ctx: &PipelineContext<'_>, docs: Vec<Value>) -> Result<Vec<Value>> {
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            let mut out = doc.clone();
            // Every expression sees the incoming document
            for (path, expr) in &self.fields {
                let value = expr.evaluate_with(&doc, ctx.vars(), ctx.eval_options())?;
                set_nested_value(&mut out, path, value);
            }
            results.push(out);
        }
        Ok(results)
    }
}

// ============================================================================
// $group
// ============================================================================

/// `$group` - one output document per distinct `_id`, in first-seen order
#[derive(Debug, Clone)]
pub struct GroupStage {
    id: Expr,
    accumulators: AccumulatorSet,
}

impl GroupStage {
    pub fn from_json(spec: &Value) -> Result<Self> {
        let obj = stage_object(spec, "$group")?;
        let id = obj
            .get("_id")
            .ok_or_else(|| stage_error("a group specification must include an _id"))?;
        Ok(GroupStage {
            id: Expr::parse(id)?,
            accumulators: AccumulatorSet::from_json(obj, &["_id"])?,
        })
    }

    pub fn execute(&self, ctx: &PipelineContext<'_>, docs: Vec<Value>) -> Result<Vec<Value>> {
        let opts = ctx.eval_options();
        let mut slots: AHashMap<String, usize> = AHashMap::new();
        let mut groups = Vec::new();

        for doc in &docs {
            let key = self.id.evaluate_with(doc, ctx.vars(), opts)?;
            let canonical = canonical_json_string(&key);
            let slot = match slots.get(&canonical) {
                Some(slot) => *slot,
                None => {
                    groups.push((key, self.accumulators.start()));
                    slots.insert(canonical, groups.len() - 1);
                    groups.len() - 1
                }
            };
            self.accumulators
                .accumulate(&mut groups[slot].1, doc, ctx.vars(), opts)?;
        }

        let mut results = Vec::with_capacity(groups.len());
        for (key, states) in groups {
            let mut out = Map::new();
            out.insert("_id".to_string(), key);
            self.accumulators.finish_into(states, &mut out)?;
            results.push(Value::Object(out));
        }
        Ok(results)
    }
}

// ============================================================================
// $sort / $limit / $skip / $count
// ============================================================================

/// `$sort` - stable multi-key sort
#[derive(Debug, Clone)]
pub struct SortStage {
    keys: Vec<(String, i32)>,
}

impl SortStage {
    pub fn from_json(spec: &Value) -> Result<Self> {
        let obj = stage_object(spec, "$sort")?;
        if obj.is_empty() {
            return Err(stage_error("$sort stage must have at least one sort key"));
        }
        let keys = obj
            .iter()
            .map(|(field, direction)| match direction.as_i64() {
                Some(1) => Ok((field.clone(), 1)),
                Some(-1) => Ok((field.clone(), -1)),
                _ => Err(stage_error(
                    "$sort key ordering must be 1 (for ascending) or -1 (for descending)",
                )),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(SortStage { keys })
    }

    pub fn keys(&self) -> &[(String, i32)] {
        &self.keys
    }

    pub fn execute(&self, mut docs: Vec<Value>) -> Vec<Value> {
        docs.sort_by(|a, b| compare_by_keys(a, b, &self.keys));
        docs
    }
}

pub fn parse_limit(spec: &Value) -> Result<usize> {
    positive_integer(spec, "$limit")
}

pub fn parse_skip(spec: &Value) -> Result<usize> {
    match spec.as_f64() {
        Some(n) if n >= 0.0 && n.fract() == 0.0 => Ok(n as usize),
        _ => Err(stage_error(format!("$skip must be a non-negative integer, got {}", spec))),
    }
}

pub fn parse_count(spec: &Value) -> Result<String> {
    match spec.as_str() {
        Some(name) if !name.is_empty() && !name.starts_with('$') && !name.contains('.') => {
            Ok(name.to_string())
        }
        _ => Err(stage_error(
            "$count field name must be a non-empty string without '$' or '.'",
        )),
    }
}

/// `$count` emits nothing for an empty input
pub fn count_documents(field: &str, docs: Vec<Value>) -> Vec<Value> {
    if docs.is_empty() {
        return Vec::new();
    }
    vec![json!({ field: docs.len() })]
}

// ============================================================================
// $unwind
// ============================================================================

/// `$unwind` - one output document per array element
#[derive(Debug, Clone, PartialEq)]
pub struct UnwindStage {
    path: String,
    include_array_index: Option<String>,
    preserve_null_and_empty_arrays: bool,
}

impl UnwindStage {
    pub fn from_json(spec: &Value) -> Result<Self> {
        match spec {
            Value::String(_) => Ok(UnwindStage {
                path: field_reference(spec, "$unwind path")?,
                include_array_index: None,
                preserve_null_and_empty_arrays: false,
            }),
            Value::Object(obj) => {
                let path = obj
                    .get("path")
                    .ok_or_else(|| stage_error("$unwind requires a 'path'"))?;
                let include_array_index = match obj.get("includeArrayIndex") {
                    None => None,
                    Some(Value::String(name)) if !name.is_empty() && !name.starts_with('$') => {
                        Some(name.clone())
                    }
                    Some(other) => {
                        return Err(stage_error(format!(
                            "$unwind includeArrayIndex must be a field name, got {}",
                            other
                        )))
                    }
                };
                let preserve = match obj.get("preserveNullAndEmptyArrays") {
                    None => false,
                    Some(Value::Bool(flag)) => *flag,
                    Some(other) => {
                        return Err(stage_error(format!(
                            "$unwind preserveNullAndEmptyArrays must be a boolean, got {}",
                            other
                        )))
                    }
                };
                Ok(UnwindStage {
                    path: field_reference(path, "$unwind path")?,
                    include_array_index,
                    preserve_null_and_empty_arrays: preserve,
                })
            }
            _ => Err(stage_error(
                "$unwind requires a field path or an object with a 'path'",
            )),
        }
    }

    pub fn execute(&self, docs: Vec<Value>) -> Vec<Value> {
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            match get_nested_value(&doc, &self.path).cloned() {
                Some(Value::Array(items)) if !items.is_empty() => {
                    for (index, item) in items.into_iter().enumerate() {
                        let mut out = doc.clone();
                        set_nested_value(&mut out, &self.path, item);
                        if let Some(field) = &self.include_array_index {
                            set_nested_value(&mut out, field, Value::from(index));
                        }
                        results.push(out);
                    }
                }
                // Empty and missing arrays are kept with a null field when preserved
                Some(Value::Array(_)) | None | Some(Value::Null) => {
                    if self.preserve_null_and_empty_arrays {
                        let mut out = doc;
                        set_nested_value(&mut out, &self.path, Value::Null);
                        self.push_unindexed(out, &mut results);
                    }
                }
                // A scalar behaves like a one-element array
                Some(_) => self.push_unindexed(doc, &mut results),
            }
        }
        results
    }

    fn push_unindexed(&self, mut doc: Value, results: &mut Vec<Value>) {
        if let Some(field) = &self.include_array_index {
            set_nested_value(&mut doc, field, Value::Null);
        }
        results.push(doc);
    }
}

// ============================================================================
// $lookup
// ============================================================================

/// `$lookup` - left outer join against another collection
///
/// Supports the equality form (`localField` / `foreignField`), the correlated
/// form (`let` + `pipeline`) and both combined. Documents without a match get
/// an empty array.
#[derive(Debug, Clone)]
pub struct LookupStage {
    from: String,
    as_field: String,
    equality: Option<(String, String)>,
    let_vars: Vec<(String, Expr)>,
    pipeline: Option<Pipeline>,
}

impl LookupStage {
    pub fn from_json(spec: &Value) -> Result<Self> {
        let obj = stage_object(spec, "$lookup")?;
        let text = |key: &str| -> Result<Option<String>> {
            match obj.get(key) {
                None => Ok(None),
                Some(Value::String(s)) if !s.is_empty() => Ok(Some(s.clone())),
                Some(other) => Err(stage_error(format!(
                    "$lookup '{}' must be a non-empty string, got {}",
                    key, other
                ))),
            }
        };

        let from = text("from")?.ok_or_else(|| stage_error("$lookup requires 'from'"))?;
        let as_field = text("as")?.ok_or_else(|| stage_error("$lookup requires 'as'"))?;
        let equality = match (text("localField")?, text("foreignField")?) {
            (Some(local), Some(foreign)) => Some((local, foreign)),
            (None, None) => None,
            _ => {
                return Err(stage_error(
                    "$lookup requires both 'localField' and 'foreignField'",
                ))
            }
        };

        let let_vars = match obj.get("let") {
            None => Vec::new(),
            Some(Value::Object(vars)) => vars
                .iter()
                .map(|(name, expr)| Ok((name.clone(), Expr::parse(expr)?)))
                .collect::<Result<Vec<_>>>()?,
            Some(_) => return Err(stage_error("$lookup 'let' must be an object")),
        };

        let pipeline = match obj.get("pipeline") {
            None => None,
            Some(Value::Array(stages)) => {
                let pipeline = Pipeline::from_stages(stages)?;
                if pipeline
                    .stages()
                    .iter()
                    .any(|s| matches!(s, super::Stage::Merge(_)))
                {
                    return Err(stage_error("$merge is not allowed within a $lookup pipeline"));
                }
                Some(pipeline)
            }
            Some(_) => return Err(stage_error("$lookup 'pipeline' must be an array")),
        };

        if equality.is_none() && pipeline.is_none() {
            return Err(stage_error(
                "$lookup requires either 'localField'/'foreignField' or 'pipeline'",
            ));
        }
        if !let_vars.is_empty() && pipeline.is_none() {
            return Err(stage_error("$lookup 'let' requires a 'pipeline'"));
        }

        Ok(LookupStage {
            from,
            as_field,
            equality,
            let_vars,
            pipeline,
        })
    }

    pub fn from_collection(&self) -> &str {
        &self.from
    }

    fn join_one(&self, ctx: &PipelineContext<'_>, doc: &Value) -> Result<Value> {
        let filter = self.equality.as_ref().map(|(local, foreign)| {
            match resolve_path(doc, local).unwrap_or(Value::Null) {
                Value::Array(values) => json!({ foreign: { "$in": values } }),
                value => json!({ foreign: { "$eq": value } }),
            }
        });

        let matches = match &self.pipeline {
            None => {
                let request = FindRequest::new(&self.from, filter.unwrap_or_else(|| json!({})));
                let result = ctx.store.find(ctx.session, &request)?;
                ctx.stats().record_scan(&result.stats);
                result.documents
            }
            Some(pipeline) => {
                let mut vars = ctx.vars().to_vec();
                for (name, expr) in &self.let_vars {
                    let value = expr.evaluate_with(doc, ctx.vars(), ctx.eval_options())?;
                    vars.retain(|(existing, _)| existing != name);
                    vars.push((name.clone(), value));
                }
                let child = ctx.child(vars);
                match filter {
                    Some(filter) => {
                        let request = FindRequest::new(&self.from, filter);
                        let result = ctx.store.find(ctx.session, &request)?;
                        ctx.stats().record_scan(&result.stats);
                        pipeline.execute(&child, result.documents)?
                    }
                    None => pipeline.run(&child, &self.from)?,
                }
            }
        };

        let mut out = doc.clone();
        set_nested_value(&mut out, &self.as_field, Value::Array(matches));
        Ok(out)
    }

    /// Join every document; large inputs are split across scoped worker
    /// threads and reassembled in input order
    pub fn execute(&self, ctx: &PipelineContext<'_>, docs: Vec<Value>) -> Result<Vec<Value>> {
        let threshold = ctx.parallel_lookup_threshold;
        if threshold == 0 || docs.len() < threshold {
            return docs.iter().map(|doc| self.join_one(ctx, doc)).collect();
        }

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(docs.len());
        let chunk_size = docs.len().div_ceil(workers);
        debug!(from = %self.from, docs = docs.len(), workers, "parallel lookup");

        let chunks = crossbeam::scope(|scope| {
            let handles: Vec<_> = docs
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move |_| {
                        chunk
                            .iter()
                            .map(|doc| self.join_one(ctx, doc))
                            .collect::<Result<Vec<Value>>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(stage_error("$lookup worker panicked")))
                })
                .collect::<Vec<_>>()
        })
        .map_err(|_| stage_error("$lookup worker panicked"))?;

        let mut results = Vec::with_capacity(docs.len());
        for chunk in chunks {
            results.extend(chunk?);
        }
        Ok(results)
    }
}

// ============================================================================
// $bucketAuto
// ============================================================================

/// `$bucketAuto` - split the input into roughly equal-count ranges
#[derive(Debug, Clone)]
pub struct BucketAutoStage {
    group_by: Expr,
    buckets: usize,
    output: AccumulatorSet,
}

impl BucketAutoStage {
    pub fn from_json(spec: &Value) -> Result<Self> {
        let obj = stage_object(spec, "$bucketAuto")?;
        for key in obj.keys() {
            if !matches!(key.as_str(), "groupBy" | "buckets" | "output") {
                return Err(stage_error(format!(
                    "Unrecognized option to $bucketAuto: {}",
                    key
                )));
            }
        }
        let group_by = obj
            .get("groupBy")
            .ok_or_else(|| stage_error("$bucketAuto requires 'groupBy' and 'buckets'"))?;
        if !matches!(group_by, Value::String(s) if s.starts_with('$')) && !group_by.is_object() {
            return Err(stage_error(
                "$bucketAuto 'groupBy' must be a field path or an expression object",
            ));
        }
        let buckets = obj
            .get("buckets")
            .ok_or_else(|| stage_error("$bucketAuto requires 'groupBy' and 'buckets'"))?;

        let output = match obj.get("output") {
            None => AccumulatorSet::new(vec![("count".to_string(), Accumulator::Count)]),
            Some(Value::Object(fields)) => AccumulatorSet::from_json(fields, &[])?,
            Some(_) => return Err(stage_error("$bucketAuto 'output' must be an object")),
        };

        Ok(BucketAutoStage {
            group_by: Expr::parse(group_by)?,
            buckets: positive_integer(buckets, "$bucketAuto 'buckets'")?,
            output,
        })
    }

    pub fn execute(&self, ctx: &PipelineContext<'_>, docs: Vec<Value>) -> Result<Vec<Value>> {
        let opts = ctx.eval_options();
        let mut keyed = Vec::with_capacity(docs.len());
        for doc in docs {
            let key = self.group_by.evaluate_with(&doc, ctx.vars(), opts)?;
            keyed.push((key, doc));
        }
        keyed.sort_by(|a, b| total_cmp(&a.0, &b.0));
        if keyed.is_empty() {
            return Ok(Vec::new());
        }

        // Runs of ceil(n / buckets), extended so equal values share a bucket
        let size = keyed.len().div_ceil(self.buckets);
        let mut bounds = Vec::new();
        let mut start = 0;
        while start < keyed.len() {
            let mut end = (start + size).min(keyed.len());
            while end < keyed.len() && total_cmp(&keyed[end].0, &keyed[end - 1].0) == Ordering::Equal {
                end += 1;
            }
            bounds.push((start, end));
            start = end;
        }

        let mut results = Vec::with_capacity(bounds.len());
        for (i, (start, end)) in bounds.iter().enumerate() {
            let min = keyed[*start].0.clone();
            let max = match bounds.get(i + 1) {
                Some((next, _)) => keyed[*next].0.clone(),
                None => keyed[end - 1].0.clone(),
            };
            let mut states = self.output.start();
            for (_, doc) in &keyed[*start..*end] {
                self.output.accumulate(&mut states, doc, ctx.vars(), opts)?;
            }
            let mut out = Map::new();
            out.insert("_id".to_string(), json!({ "min": min, "max": max }));
            self.output.finish_into(states, &mut out)?;
            results.push(Value::Object(out));
        }
        Ok(results)
    }
}

// ============================================================================
// $merge
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenMatched {
    Replace,
    KeepExisting,
    Merge,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenNotMatched {
    Insert,
    Discard,
    Fail,
}

/// `$merge` - upsert the pipeline output into a collection, keyed by `on`
///
/// Re-running the same pipeline over the same input leaves the target
/// unchanged: a replacement identical to the stored document is not
/// written.
#[derive(Debug, Clone)]
pub struct MergeStage {
    into: String,
    on: Vec<String>,
    when_matched: WhenMatched,
    when_not_matched: WhenNotMatched,
}

impl MergeStage {
    pub fn from_json(spec: &Value) -> Result<Self> {
        let obj = match spec {
            Value::String(into) => {
                return Ok(MergeStage {
                    into: into.clone(),
                    on: vec!["_id".to_string()],
                    when_matched: WhenMatched::Merge,
                    when_not_matched: WhenNotMatched::Insert,
                })
            }
            Value::Object(obj) => obj,
            _ => return Err(stage_error("$merge requires a collection name or an object")),
        };

        let into = match obj.get("into") {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            Some(Value::Object(target)) => target
                .get("coll")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| stage_error("$merge 'into' object requires 'coll'"))?,
            _ => return Err(stage_error("$merge requires 'into'")),
        };
        let on = match obj.get("on") {
            None => vec!["_id".to_string()],
            Some(Value::String(field)) => vec![field.clone()],
            Some(Value::Array(fields)) if !fields.is_empty() => fields
                .iter()
                .map(|f| {
                    f.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| stage_error("$merge 'on' fields must be strings"))
                })
                .collect::<Result<Vec<_>>>()?,
            Some(_) => {
                return Err(stage_error(
                    "$merge 'on' must be a field name or a non-empty array of field names",
                ))
            }
        };
        let when_matched = match obj.get("whenMatched").and_then(Value::as_str) {
            None => WhenMatched::Merge,
            Some("replace") => WhenMatched::Replace,
            Some("keepExisting") => WhenMatched::KeepExisting,
            Some("merge") => WhenMatched::Merge,
            Some("fail") => WhenMatched::Fail,
            Some(other) => {
                return Err(stage_error(format!("Unsupported $merge whenMatched mode: {}", other)))
            }
        };
        let when_not_matched = match obj.get("whenNotMatched").and_then(Value::as_str) {
            None => WhenNotMatched::Insert,
            Some("insert") => WhenNotMatched::Insert,
            Some("discard") => WhenNotMatched::Discard,
            Some("fail") => WhenNotMatched::Fail,
            Some(other) => {
                return Err(stage_error(format!(
                    "Unsupported $merge whenNotMatched mode: {}",
                    other
                )))
            }
        };

        Ok(MergeStage {
            into,
            on,
            when_matched,
            when_not_matched,
        })
    }

    pub fn target(&self) -> &str {
        &self.into
    }

    /// Non-`_id` keys need a unique index covering exactly those fields
    fn check_target_index(&self, ctx: &PipelineContext<'_>) -> Result<()> {
        if self.on == ["_id"] {
            return Ok(());
        }
        let mut wanted: Vec<&str> = self.on.iter().map(String::as_str).collect();
        wanted.sort_unstable();
        let indexes = match ctx.store.list_indexes(ctx.session, &self.into) {
            Ok(indexes) => indexes,
            Err(StoreLensError::CollectionNotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let covered = indexes.iter().any(|index| {
            let mut fields = index.field_names();
            fields.sort_unstable();
            index.unique && fields == wanted
        });
        if covered {
            Ok(())
        } else {
            Err(StoreLensError::IndexUnavailable(format!(
                "$merge 'on' fields {:?} need a unique index on {}",
                self.on, self.into
            )))
        }
    }

    fn key_filter(&self, doc: &Value) -> Result<Value> {
        let mut filter = Map::new();
        for field in &self.on {
            match get_nested_value(doc, field) {
                None | Some(Value::Null) | Some(Value::Array(_)) => {
                    return Err(stage_error(format!(
                        "$merge write error: 'on' field '{}' cannot be missing, null or an array",
                        field
                    )))
                }
                Some(value) => {
                    filter.insert(field.clone(), json!({ "$eq": value }));
                }
            }
        }
        Ok(Value::Object(filter))
    }

    fn merge_one(&self, ctx: &PipelineContext<'_>, doc: Value) -> Result<()> {
        let stats = &ctx.stats().merge;
        let filter = self.key_filter(&doc)?;
        let mut existing = ctx.store.get(ctx.session, &self.into, &filter)?;
        if existing.len() > 1 {
            return Err(StoreLensError::ConstraintViolation(format!(
                "$merge 'on' fields {:?} match {} documents in {}",
                self.on,
                existing.len(),
                self.into
            )));
        }

        let Some(current) = existing.pop() else {
            return match self.when_not_matched {
                WhenNotMatched::Insert => {
                    ctx.store.put(ctx.session, &self.into, doc)?;
                    stats.record_inserted();
                    Ok(())
                }
                WhenNotMatched::Discard => {
                    stats.record_discarded();
                    Ok(())
                }
                WhenNotMatched::Fail => Err(StoreLensError::NotFound(format!(
                    "$merge found no document in {} matching {}",
                    self.into, filter
                ))),
            };
        };

        stats.record_matched();
        let id = current.get("_id").cloned().unwrap_or(Value::Null);
        let replacement = match self.when_matched {
            WhenMatched::KeepExisting => return Ok(()),
            WhenMatched::Fail => {
                return Err(StoreLensError::ConstraintViolation(format!(
                    "$merge found an existing document in {} matching {}",
                    self.into, filter
                )))
            }
            WhenMatched::Replace => {
                let mut replacement = doc;
                if let Value::Object(fields) = &mut replacement {
                    fields.shift_remove("_id");
                }
                replacement
            }
            WhenMatched::Merge => {
                let mut merged = current.clone();
                if let (Value::Object(target), Value::Object(fields)) = (&mut merged, doc) {
                    for (key, value) in fields {
                        if key != "_id" {
                            target.insert(key, value);
                        }
                    }
                }
                merged
            }
        };

        let mut candidate = replacement.clone();
        if let Value::Object(fields) = &mut candidate {
            fields.insert("_id".to_string(), id.clone());
        }
        if values_equal(&candidate, &current) {
            return Ok(());
        }
        ctx.store.replace(ctx.session, &self.into, &id, replacement)?;
        stats.record_modified();
        Ok(())
    }

    /// Writes every document; emits nothing
    pub fn execute(&self, ctx: &PipelineContext<'_>, docs: Vec<Value>) -> Result<Vec<Value>> {
        self.check_target_index(ctx)?;
        let total = docs.len();
        for (done, doc) in docs.into_iter().enumerate() {
            if let Err(e) = self.merge_one(ctx, doc) {
                let merge = ctx.stats().merge.counts();
                let progress = Progress::new()
                    .with("processed", done as u64)
                    .with("inserted", merge.inserted)
                    .with("modified", merge.modified);
                return Err(StoreLensError::partial("$merge", progress, e));
            }
        }
        debug!(into = %self.into, documents = total, "merge finished");
        Ok(Vec::new())
    }
}
