// src/query/operators.rs
//! Query operator trait definitions and implementations
//!
//! Each filter operator is a separate type implementing [`OperatorMatcher`],
//! looked up by name in [`OPERATOR_REGISTRY`].
//!
//! ```text
//! OperatorMatcher trait
//!     ↓
//! ┌────────────────┬────────────────┬────────────────┐
//! │ Comparison     │ Logical        │ Element        │
//! │ ($eq, $gt...)  │ ($and, $or...) │ ($exists...)   │
//! └────────────────┴────────────────┴────────────────┘
//! ```
//!
//! Matching rules shared by every operator:
//! - a field path that crosses an array resolves to the array of values,
//!   and comparisons match when any element matches
//! - `{field: null}` and `{field: {$eq: null}}` match missing fields
//! - ordering comparisons only match values of the same type bracket;
//!   timestamp strings compare chronologically

use crate::error::{Result, StoreLensError};
use crate::expression::{EvalOptions, EvalStats, Expr};
use crate::value_utils::{compare_values, is_truthy, lookup_field, values_equal};
use lazy_static::lazy_static;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::num::NonZeroUsize;

// ============================================================================
// REGEX WITH OPTIONS SUPPORT
// ============================================================================

const REGEX_CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(100) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

lazy_static! {
    /// Compiled patterns keyed by "pattern:options"
    static ref REGEX_CACHE: Mutex<LruCache<String, Regex>> =
        Mutex::new(LruCache::new(REGEX_CACHE_SIZE));
}

/// Prefix a pattern with inline flags for the supported options (i, m, s, x)
fn build_regex_pattern(pattern: &str, options: &str) -> String {
    let valid_options: String = options
        .chars()
        .filter(|c| matches!(c, 'i' | 'm' | 's' | 'x'))
        .collect();

    if valid_options.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{}){}", valid_options, pattern)
    }
}

fn get_or_compile_regex(pattern: &str, options: &str) -> Result<Regex> {
    let cache_key = format!("{}:{}", pattern, options);

    if let Some(regex) = REGEX_CACHE.lock().get(&cache_key) {
        return Ok(regex.clone());
    }

    let regex = Regex::new(&build_regex_pattern(pattern, options)).map_err(|e| {
        StoreLensError::InvalidQuery(format!("Invalid regex pattern '{}': {}", pattern, e))
    })?;
    REGEX_CACHE.lock().put(cache_key, regex.clone());
    Ok(regex)
}

/// String (or any string element of an array) matches the pattern
fn regex_matches(doc_value: Option<&Value>, pattern: &str, options: &str) -> Result<bool> {
    match doc_value {
        Some(Value::String(s)) => Ok(get_or_compile_regex(pattern, options)?.is_match(s)),
        Some(Value::Array(arr)) => {
            let regex = get_or_compile_regex(pattern, options)?;
            Ok(arr
                .iter()
                .any(|elem| elem.as_str().map(|s| regex.is_match(s)).unwrap_or(false)))
        }
        _ => Ok(false),
    }
}

// ============================================================================
// TRAIT DEFINITION
// ============================================================================

/// A filter operator such as `$eq`, `$gt` or `$and`
///
/// ```rust
/// use serde_json::json;
/// use storelens_core::query::operators::{EqOperator, OperatorMatcher};
///
/// let matches = EqOperator.matches(Some(&json!("SP")), &json!("SP"), None).unwrap();
/// assert!(matches);
/// ```
pub trait OperatorMatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// `doc_value` is `None` when the field is missing. `document` is the
    /// whole document, required by operators that recurse into sub-filters.
    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        document: Option<&Value>,
    ) -> Result<bool>;
}

fn invalid(msg: &str) -> StoreLensError {
    StoreLensError::InvalidQuery(msg.to_string())
}

// ============================================================================
// COMPARISON OPERATORS
// ============================================================================

/// `{field: {$eq: value}}`, also the implicit form `{field: value}`
pub struct EqOperator;

impl OperatorMatcher for EqOperator {
    fn name(&self) -> &'static str {
        "$eq"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&Value>,
    ) -> Result<bool> {
        match doc_value {
            None => Ok(filter_value.is_null()),
            Some(v) => {
                if values_equal(v, filter_value) {
                    return Ok(true);
                }
                if let Value::Array(arr) = v {
                    Ok(arr.iter().any(|elem| values_equal(elem, filter_value)))
                } else {
                    Ok(false)
                }
            }
        }
    }
}

/// `{field: {$ne: value}}`; true for missing fields unless `value` is null
pub struct NeOperator;

impl OperatorMatcher for NeOperator {
    fn name(&self) -> &'static str {
        "$ne"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        document: Option<&Value>,
    ) -> Result<bool> {
        Ok(!EqOperator.matches(doc_value, filter_value, document)?)
    }
}

pub struct GtOperator;

impl OperatorMatcher for GtOperator {
    fn name(&self) -> &'static str {
        "$gt"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&Value>,
    ) -> Result<bool> {
        compare_with_predicate(doc_value, filter_value, |ord| ord == Ordering::Greater)
    }
}

pub struct GteOperator;

impl OperatorMatcher for GteOperator {
    fn name(&self) -> &'static str {
        "$gte"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&Value>,
    ) -> Result<bool> {
        compare_with_predicate(doc_value, filter_value, |ord| ord != Ordering::Less)
    }
}

pub struct LtOperator;

impl OperatorMatcher for LtOperator {
    fn name(&self) -> &'static str {
        "$lt"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&Value>,
    ) -> Result<bool> {
        compare_with_predicate(doc_value, filter_value, |ord| ord == Ordering::Less)
    }
}

pub struct LteOperator;

impl OperatorMatcher for LteOperator {
    fn name(&self) -> &'static str {
        "$lte"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&Value>,
    ) -> Result<bool> {
        compare_with_predicate(doc_value, filter_value, |ord| ord != Ordering::Greater)
    }
}

// ============================================================================
// ARRAY OPERATORS
// ============================================================================

/// `{field: {$in: [v1, v2]}}`; a `null` member matches missing fields
pub struct InOperator;

impl OperatorMatcher for InOperator {
    fn name(&self) -> &'static str {
        "$in"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        document: Option<&Value>,
    ) -> Result<bool> {
        let candidates = filter_value
            .as_array()
            .ok_or_else(|| invalid("$in operator requires an array"))?;
        for candidate in candidates {
            if EqOperator.matches(doc_value, candidate, document)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

pub struct NinOperator;

impl OperatorMatcher for NinOperator {
    fn name(&self) -> &'static str {
        "$nin"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        document: Option<&Value>,
    ) -> Result<bool> {
        if !filter_value.is_array() {
            return Err(invalid("$nin operator requires an array"));
        }
        Ok(!InOperator.matches(doc_value, filter_value, document)?)
    }
}

/// `{field: {$all: [v1, v2]}}`: the array contains every listed value
pub struct AllOperator;

impl OperatorMatcher for AllOperator {
    fn name(&self) -> &'static str {
        "$all"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&Value>,
    ) -> Result<bool> {
        let required = filter_value
            .as_array()
            .ok_or_else(|| invalid("$all operator requires an array"))?;
        match doc_value {
            Some(Value::Array(doc_arr)) => Ok(required
                .iter()
                .all(|req| doc_arr.iter().any(|elem| values_equal(elem, req)))),
            _ => Ok(false),
        }
    }
}

/// `{field: {$elemMatch: {...}}}`: one array element satisfies every condition
///
/// Object elements are matched as sub-documents; scalar elements against
/// operator-only conditions such as `{$gte: 4}`.
pub struct ElemMatchOperator;

impl OperatorMatcher for ElemMatchOperator {
    fn name(&self) -> &'static str {
        "$elemMatch"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        document: Option<&Value>,
    ) -> Result<bool> {
        let conditions = filter_value
            .as_object()
            .ok_or_else(|| invalid("$elemMatch requires an object"))?;
        let operator_only = conditions.keys().all(|k| k.starts_with('$'));

        let Some(Value::Array(arr)) = doc_value else {
            return Ok(false);
        };
        for elem in arr {
            let matched = if operator_only {
                matches_filter_value(Some(elem), filter_value, document)?
            } else if elem.is_object() {
                matches_filter(elem, filter_value)?
            } else {
                false
            };
            if matched {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// `{field: {$size: 3}}`
pub struct SizeOperator;

impl OperatorMatcher for SizeOperator {
    fn name(&self) -> &'static str {
        "$size"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&Value>,
    ) -> Result<bool> {
        let size = filter_value
            .as_u64()
            .ok_or_else(|| invalid("$size operator requires a non-negative integer"))?;
        match doc_value {
            Some(Value::Array(arr)) => Ok(arr.len() as u64 == size),
            _ => Ok(false),
        }
    }
}

/// `{field: {$regex: "pattern"}}`; `$options` is handled next to it in
/// [`matches_condition`]
pub struct RegexOperator;

impl OperatorMatcher for RegexOperator {
    fn name(&self) -> &'static str {
        "$regex"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&Value>,
    ) -> Result<bool> {
        let pattern = filter_value
            .as_str()
            .ok_or_else(|| invalid("$regex operator requires a string pattern"))?;
        regex_matches(doc_value, pattern, "")
    }
}

/// `{field: {$type: "string"}}` or a BSON type number
pub struct TypeOperator;

impl OperatorMatcher for TypeOperator {
    fn name(&self) -> &'static str {
        "$type"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&Value>,
    ) -> Result<bool> {
        let type_name = match filter_value {
            Value::String(s) => s.as_str(),
            Value::Number(n) => match n.as_i64() {
                Some(1) => "double",
                Some(2) => "string",
                Some(3) => "object",
                Some(4) => "array",
                Some(8) => "bool",
                Some(9) => "date",
                Some(10) => "null",
                Some(16) => "int",
                Some(18) => "long",
                _ => {
                    return Err(StoreLensError::InvalidQuery(format!(
                        "Unknown BSON type number: {}",
                        n
                    )))
                }
            },
            _ => return Err(invalid("$type operator requires a string or number")),
        };

        let Some(val) = doc_value else {
            return Ok(false);
        };
        let matches = match type_name {
            "double" | "number" => val.is_number(),
            "string" => val.is_string(),
            "object" => val.is_object(),
            "array" => val.is_array(),
            "bool" | "boolean" => val.is_boolean(),
            "null" => val.is_null(),
            "int" | "long" => val.is_i64() || val.is_u64(),
            "date" => val
                .as_str()
                .map(crate::dates::looks_like_timestamp)
                .unwrap_or(false),
            other => {
                return Err(StoreLensError::InvalidQuery(format!(
                    "Unknown type name: {}",
                    other
                )))
            }
        };
        Ok(matches)
    }
}

/// `{field: {$exists: true}}`
pub struct ExistsOperator;

impl OperatorMatcher for ExistsOperator {
    fn name(&self) -> &'static str {
        "$exists"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&Value>,
    ) -> Result<bool> {
        let should_exist = match filter_value {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            _ => return Err(invalid("$exists operator requires a boolean")),
        };
        Ok(doc_value.is_some() == should_exist)
    }
}

// ============================================================================
// LOGICAL OPERATORS
// ============================================================================

fn logical_clauses<'a>(
    name: &str,
    filter_value: &'a Value,
    document: Option<&'a Value>,
) -> Result<(&'a Vec<Value>, &'a Value)> {
    let doc = document.ok_or_else(|| {
        StoreLensError::InvalidQuery(format!("{} operator requires document context", name))
    })?;
    let clauses = filter_value.as_array().ok_or_else(|| {
        StoreLensError::InvalidQuery(format!("{} operator requires an array", name))
    })?;
    if clauses.is_empty() {
        return Err(StoreLensError::InvalidQuery(format!(
            "{} operator requires a non-empty array",
            name
        )));
    }
    Ok((clauses, doc))
}

/// `{$and: [{...}, {...}]}`
pub struct AndOperator;

impl OperatorMatcher for AndOperator {
    fn name(&self) -> &'static str {
        "$and"
    }

    fn matches(
        &self,
        _doc_value: Option<&Value>,
        filter_value: &Value,
        document: Option<&Value>,
    ) -> Result<bool> {
        let (clauses, doc) = logical_clauses(self.name(), filter_value, document)?;
        for clause in clauses {
            if !matches_filter(doc, clause)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

pub struct OrOperator;

impl OperatorMatcher for OrOperator {
    fn name(&self) -> &'static str {
        "$or"
    }

    fn matches(
        &self,
        _doc_value: Option<&Value>,
        filter_value: &Value,
        document: Option<&Value>,
    ) -> Result<bool> {
        let (clauses, doc) = logical_clauses(self.name(), filter_value, document)?;
        for clause in clauses {
            if matches_filter(doc, clause)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// True only when every clause is false
pub struct NorOperator;

impl OperatorMatcher for NorOperator {
    fn name(&self) -> &'static str {
        "$nor"
    }

    fn matches(
        &self,
        _doc_value: Option<&Value>,
        filter_value: &Value,
        document: Option<&Value>,
    ) -> Result<bool> {
        let (clauses, doc) = logical_clauses(self.name(), filter_value, document)?;
        for clause in clauses {
            if matches_filter(doc, clause)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// `{field: {$not: {$gt: 5}}}`
pub struct NotOperator;

impl OperatorMatcher for NotOperator {
    fn name(&self) -> &'static str {
        "$not"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        document: Option<&Value>,
    ) -> Result<bool> {
        if !filter_value.is_object() {
            return Err(invalid("$not operator requires an operator object"));
        }
        Ok(!matches_filter_value(doc_value, filter_value, document)?)
    }
}

// ============================================================================
// EXPRESSION OPERATOR ($expr)
// ============================================================================

/// `{$expr: <aggregation expression>}`, matched when the result is truthy
///
/// `$$` variables are not visible here; correlated lookups evaluate their
/// `$expr` through the pipeline, which binds them.
pub struct ExprOperator;

impl OperatorMatcher for ExprOperator {
    fn name(&self) -> &'static str {
        "$expr"
    }

    fn matches(
        &self,
        _doc_value: Option<&Value>,
        filter_value: &Value,
        document: Option<&Value>,
    ) -> Result<bool> {
        let doc = document.ok_or_else(|| invalid("$expr operator requires document context"))?;
        let stats = EvalStats::default();
        let result = Expr::parse(filter_value)?.evaluate(doc, EvalOptions::lenient(&stats))?;
        Ok(is_truthy(&result))
    }
}

// ============================================================================
// OPERATOR REGISTRY
// ============================================================================

lazy_static! {
    /// Every filter operator by name; built once, immutable afterwards
    pub static ref OPERATOR_REGISTRY: HashMap<&'static str, Box<dyn OperatorMatcher>> = {
        let operators: Vec<Box<dyn OperatorMatcher>> = vec![
            Box::new(EqOperator),
            Box::new(NeOperator),
            Box::new(GtOperator),
            Box::new(GteOperator),
            Box::new(LtOperator),
            Box::new(LteOperator),
            Box::new(InOperator),
            Box::new(NinOperator),
            Box::new(AllOperator),
            Box::new(ElemMatchOperator),
            Box::new(SizeOperator),
            Box::new(ExistsOperator),
            Box::new(TypeOperator),
            Box::new(RegexOperator),
            Box::new(AndOperator),
            Box::new(OrOperator),
            Box::new(NorOperator),
            Box::new(NotOperator),
            Box::new(ExprOperator),
        ];
        operators.into_iter().map(|op| (op.name(), op)).collect()
    };
}

fn lookup_operator(name: &str) -> Result<&'static dyn OperatorMatcher> {
    OPERATOR_REGISTRY
        .get(name)
        .map(|op| op.as_ref())
        .ok_or_else(|| StoreLensError::InvalidQuery(format!("Unknown operator: {}", name)))
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Shared body of `$gt`/`$gte`/`$lt`/`$lte` with array element matching
fn compare_with_predicate<F>(doc_value: Option<&Value>, filter_value: &Value, predicate: F) -> Result<bool>
where
    F: Fn(Ordering) -> bool,
{
    let Some(v) = doc_value else {
        return Ok(false);
    };
    if let Some(ordering) = compare_values(v, filter_value) {
        if predicate(ordering) {
            return Ok(true);
        }
    }
    if let Value::Array(arr) = v {
        Ok(arr.iter().any(|elem| {
            compare_values(elem, filter_value)
                .map(&predicate)
                .unwrap_or(false)
        }))
    } else {
        Ok(false)
    }
}

/// Operator object for one field, e.g. `{$gte: 1, $lt: 5}` or
/// `{$regex: "^a", $options: "i"}`
fn matches_condition(
    doc_value: Option<&Value>,
    condition: &serde_json::Map<String, Value>,
    document: Option<&Value>,
) -> Result<bool> {
    for (op_name, op_value) in condition {
        match op_name.as_str() {
            "$options" => {
                if !condition.contains_key("$regex") {
                    return Err(invalid("$options requires $regex"));
                }
            }
            "$regex" => {
                let pattern = op_value
                    .as_str()
                    .ok_or_else(|| invalid("$regex operator requires a string pattern"))?;
                let options = condition
                    .get("$options")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if !regex_matches(doc_value, pattern, options)? {
                    return Ok(false);
                }
            }
            name => {
                if !lookup_operator(name)?.matches(doc_value, op_value, document)? {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

/// Match one field value against its filter value (operator object or literal)
fn matches_filter_value(
    doc_value: Option<&Value>,
    filter_value: &Value,
    document: Option<&Value>,
) -> Result<bool> {
    match filter_value {
        Value::Object(obj) if !obj.is_empty() && obj.keys().all(|k| k.starts_with('$')) => {
            matches_condition(doc_value, obj, document)
        }
        Value::Object(obj) if obj.keys().any(|k| k.starts_with('$')) => Err(invalid(
            "Cannot mix operators and fields in one condition",
        )),
        literal => EqOperator.matches(doc_value, literal, document),
    }
}

/// Main entry point for filter matching
///
/// An empty filter matches every document. `$text` is not evaluated here:
/// the store answers it from a text index before the rest of the filter
/// is applied.
pub fn matches_filter(document: &Value, filter: &Value) -> Result<bool> {
    let filter_obj = filter
        .as_object()
        .ok_or_else(|| invalid("Filter must be an object"))?;

    for (key, value) in filter_obj {
        if key == "$text" {
            return Err(invalid(
                "$text is only allowed at the top level of a collection query",
            ));
        }
        if key == "$comment" {
            continue;
        }
        if key.starts_with('$') {
            if !lookup_operator(key)?.matches(None, value, Some(document))? {
                return Ok(false);
            }
            continue;
        }
        let doc_value = lookup_field(document, key);
        if !matches_filter_value(doc_value.as_deref(), value, Some(document))? {
            return Ok(false);
        }
    }

    Ok(true)
}
