// src/query_planner.rs
// Query shapes, index selection and recommendation

use crate::error::{Result, StoreLensError};
use crate::index::{IndexDefinition, IndexKey, KeyKind, KeyPredicate};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::ops::Bound;

// ============================================================================
// QUERY SHAPE
// ============================================================================

/// Range constraint collected from `$gt/$gte/$lt/$lte`
#[derive(Debug, Clone, PartialEq)]
pub struct RangePredicate {
    pub field: String,
    pub lower: Bound<Value>,
    pub upper: Bound<Value>,
}

/// What an index can see of a query: equality fields, range fields, sort
/// keys and whether a `$text` clause is present. Anything else (`$or`,
/// `$regex`, `$expr`, ...) stays in the residual filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryShape {
    pub collection: String,
    /// field → accepted values (one for `$eq`, several for `$in`)
    pub equality: Vec<(String, Vec<Value>)>,
    pub ranges: Vec<RangePredicate>,
    pub sort: Vec<(String, i32)>,
    pub text: bool,
}

impl QueryShape {
    pub fn from_filter(collection: &str, filter: &Value, sort: &[(String, i32)]) -> Self {
        let mut shape = QueryShape {
            collection: collection.to_string(),
            sort: sort.to_vec(),
            ..Default::default()
        };
        shape.collect(filter);
        shape
    }

    fn collect(&mut self, filter: &Value) {
        let Some(obj) = filter.as_object() else {
            return;
        };
        for (key, value) in obj {
            match key.as_str() {
                "$and" => {
                    if let Some(clauses) = value.as_array() {
                        for clause in clauses {
                            self.collect(clause);
                        }
                    }
                }
                "$text" => self.text = true,
                k if k.starts_with('$') => {}
                field => self.collect_field(field, value),
            }
        }
    }

    fn collect_field(&mut self, field: &str, condition: &Value) {
        let operators = condition
            .as_object()
            .filter(|ops| !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')));

        let Some(ops) = operators else {
            // Whole-array equality cannot be answered from element keys
            if !condition.is_array() {
                self.add_equality(field, vec![condition.clone()]);
            }
            return;
        };

        for (op, operand) in ops {
            match op.as_str() {
                "$eq" if !operand.is_array() => self.add_equality(field, vec![operand.clone()]),
                "$in" => {
                    if let Some(values) = operand.as_array() {
                        if values.iter().all(|v| !v.is_array() && !v.is_object()) {
                            self.add_equality(field, values.clone());
                        }
                    }
                }
                "$gt" => self.add_range(field, Bound::Excluded(operand.clone()), true),
                "$gte" => self.add_range(field, Bound::Included(operand.clone()), true),
                "$lt" => self.add_range(field, Bound::Excluded(operand.clone()), false),
                "$lte" => self.add_range(field, Bound::Included(operand.clone()), false),
                _ => {}
            }
        }
    }

    fn add_equality(&mut self, field: &str, values: Vec<Value>) {
        if self.equality.iter().any(|(f, _)| f == field) {
            return;
        }
        self.equality.push((field.to_string(), values));
    }

    fn add_range(&mut self, field: &str, bound: Bound<Value>, is_lower: bool) {
        let position = match self.ranges.iter().position(|r| r.field == field) {
            Some(position) => position,
            None => {
                self.ranges.push(RangePredicate {
                    field: field.to_string(),
                    lower: Bound::Unbounded,
                    upper: Bound::Unbounded,
                });
                self.ranges.len() - 1
            }
        };
        let range = &mut self.ranges[position];
        if is_lower {
            range.lower = bound;
        } else {
            range.upper = bound;
        }
    }

    pub fn equality_values(&self, field: &str) -> Option<&[Value]> {
        self.equality
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, values)| values.as_slice())
    }

    pub fn range(&self, field: &str) -> Option<&RangePredicate> {
        self.ranges.iter().find(|r| r.field == field)
    }

    pub fn is_unconstrained(&self) -> bool {
        self.equality.is_empty() && self.ranges.is_empty() && !self.text
    }
}

// ============================================================================
// QUERY PLAN
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum QueryPlan {
    /// Scan of an ordered index with predicates on its leading fields
    IndexScan {
        index_name: String,
        key_pattern: Value,
        predicates: Vec<KeyPredicate>,
    },
    TextScan {
        index_name: String,
        terms: Vec<String>,
    },
    CollectionScan,
}

impl QueryPlan {
    pub fn index_name(&self) -> Option<&str> {
        match self {
            QueryPlan::IndexScan { index_name, .. } | QueryPlan::TextScan { index_name, .. } => {
                Some(index_name)
            }
            QueryPlan::CollectionScan => None,
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            QueryPlan::IndexScan { .. } => "IXSCAN",
            QueryPlan::TextScan { .. } => "TEXT",
            QueryPlan::CollectionScan => "COLLSCAN",
        }
    }

    /// Short form for profile entries, e.g. `IXSCAN { customer_id: 1 }`
    pub fn summary(&self) -> String {
        match self {
            QueryPlan::IndexScan { key_pattern, .. } => {
                let keys = key_pattern
                    .as_object()
                    .map(|keys| {
                        keys.iter()
                            .map(|(field, dir)| format!("{}: {}", field, dir))
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                format!("IXSCAN {{ {} }}", keys)
            }
            QueryPlan::TextScan { index_name, .. } => format!("TEXT {{ {} }}", index_name),
            QueryPlan::CollectionScan => "COLLSCAN".to_string(),
        }
    }
}

/// Candidate index with its planner score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexCandidate {
    pub name: String,
    pub key: Value,
    pub score: usize,
}

// ============================================================================
// QUERY PLANNER
// ============================================================================

pub struct QueryPlanner;

impl QueryPlanner {
    /// Key predicates an ordered index can apply: equality on a leading run
    /// of fields, optionally followed by one range field
    fn predicates_for(definition: &IndexDefinition, shape: &QueryShape) -> Vec<KeyPredicate> {
        let mut predicates = Vec::new();
        for field in &definition.fields {
            if field.kind == KeyKind::Text {
                break;
            }
            if let Some(values) = shape.equality_values(&field.field) {
                // Sparse indexes hold no entry for missing fields, which a
                // null equality must still find
                if definition.sparse && values.iter().any(Value::is_null) {
                    break;
                }
                predicates.push(KeyPredicate::Eq(values.iter().map(IndexKey::from).collect()));
                continue;
            }
            if field.kind == KeyKind::Hashed {
                break;
            }
            if let Some(range) = shape.range(&field.field) {
                predicates.push(KeyPredicate::Range {
                    lower: map_bound(&range.lower),
                    upper: map_bound(&range.upper),
                });
            }
            break;
        }
        predicates
    }

    /// Planner score: two points per equality field, one for a trailing range
    fn score(definition: &IndexDefinition, shape: &QueryShape) -> usize {
        if definition.is_text() {
            return 0;
        }
        Self::predicates_for(definition, shape)
            .iter()
            .map(|p| match p {
                KeyPredicate::Eq(_) => 2,
                KeyPredicate::Range { .. } => 1,
            })
            .sum()
    }

    /// Whether the planner would answer this shape from the index
    pub fn would_use(definition: &IndexDefinition, shape: &QueryShape) -> bool {
        if definition.is_text() {
            return shape.text;
        }
        !shape.text && Self::score(definition, shape) > 0
    }

    /// Best index for the shape; ties go to the narrower, then older index
    pub fn choose<'a>(
        shape: &QueryShape,
        indexes: &'a [IndexDefinition],
    ) -> Option<&'a IndexDefinition> {
        if shape.text {
            return indexes.iter().find(|d| d.is_text());
        }
        let mut best: Option<(&IndexDefinition, usize)> = None;
        for definition in indexes {
            let score = Self::score(definition, shape);
            if score == 0 {
                continue;
            }
            let better = match best {
                None => true,
                Some((current, current_score)) => {
                    score > current_score
                        || (score == current_score && definition.fields.len() < current.fields.len())
                }
            };
            if better {
                best = Some((definition, score));
            }
        }
        best.map(|(definition, _)| definition)
    }

    /// All usable indexes with their scores, best first
    pub fn candidates(shape: &QueryShape, indexes: &[IndexDefinition]) -> Vec<IndexCandidate> {
        let mut candidates: Vec<IndexCandidate> = indexes
            .iter()
            .filter(|d| Self::would_use(d, shape))
            .map(|d| IndexCandidate {
                name: d.name.clone(),
                key: d.key_pattern(),
                score: if d.is_text() { 1 } else { Self::score(d, shape) },
            })
            .collect();
        candidates.sort_by(|a, b| b.score.cmp(&a.score));
        candidates
    }

    /// Plan for a query against the given indexes
    ///
    /// A `$text` clause needs the collection's text index; `hint` forces a
    /// named index. Neither falls back to a collection scan.
    pub fn plan(
        shape: &QueryShape,
        indexes: &[IndexDefinition],
        text_terms: Option<&[String]>,
        hint: Option<&str>,
    ) -> Result<QueryPlan> {
        if let Some(terms) = text_terms {
            let text_index = indexes.iter().find(|d| d.is_text()).ok_or_else(|| {
                StoreLensError::IndexUnavailable(format!(
                    "text index required for $text query on '{}'",
                    shape.collection
                ))
            })?;
            if let Some(hint) = hint {
                if hint != text_index.name {
                    return Err(StoreLensError::IndexUnavailable(format!(
                        "hint '{}' cannot answer a $text query",
                        hint
                    )));
                }
            }
            return Ok(QueryPlan::TextScan {
                index_name: text_index.name.clone(),
                terms: terms.to_vec(),
            });
        }

        if let Some(hint) = hint {
            let definition = indexes.iter().find(|d| d.name == hint).ok_or_else(|| {
                StoreLensError::IndexUnavailable(format!(
                    "hint provided does not correspond to an existing index: {}",
                    hint
                ))
            })?;
            if definition.is_text() {
                return Err(StoreLensError::IndexUnavailable(format!(
                    "text index '{}' can only be hinted for $text queries",
                    hint
                )));
            }
            return Ok(Self::index_scan(definition, shape));
        }

        Ok(match Self::choose(shape, indexes) {
            Some(definition) => Self::index_scan(definition, shape),
            None => QueryPlan::CollectionScan,
        })
    }

    fn index_scan(definition: &IndexDefinition, shape: &QueryShape) -> QueryPlan {
        QueryPlan::IndexScan {
            index_name: definition.name.clone(),
            key_pattern: definition.key_pattern(),
            predicates: Self::predicates_for(definition, shape),
        }
    }

    /// Index definitions that would serve the shape, following the
    /// equality, sort, range ordering of compound keys
    pub fn recommend(shape: &QueryShape) -> Vec<IndexDefinition> {
        if shape.text {
            return Vec::new();
        }
        let mut keys: Vec<(String, i32)> = Vec::new();
        let push = |keys: &mut Vec<(String, i32)>, field: &str, dir: i32| {
            if !keys.iter().any(|(f, _)| f == field) {
                keys.push((field.to_string(), dir));
            }
        };
        for (field, _) in &shape.equality {
            push(&mut keys, field, 1);
        }
        for (field, dir) in &shape.sort {
            push(&mut keys, field, if *dir < 0 { -1 } else { 1 });
        }
        for range in &shape.ranges {
            push(&mut keys, &range.field, 1);
        }
        if keys.is_empty() {
            return Vec::new();
        }

        let as_definition = |keys: &[(String, i32)]| {
            let pairs: Vec<(&str, i32)> = keys.iter().map(|(f, d)| (f.as_str(), *d)).collect();
            IndexDefinition::new(&pairs)
        };
        let mut recommended = vec![as_definition(&keys)];

        // Without the sort keys the index still covers equality + range
        if !shape.sort.is_empty() && !shape.ranges.is_empty() && !shape.equality.is_empty() {
            let mut narrow: Vec<(String, i32)> =
                shape.equality.iter().map(|(f, _)| (f.clone(), 1)).collect();
            for range in &shape.ranges {
                if !narrow.iter().any(|(f, _)| f == &range.field) {
                    narrow.push((range.field.clone(), 1));
                }
            }
            let definition = as_definition(&narrow);
            if definition.name != recommended[0].name {
                recommended.push(definition);
            }
        }
        recommended
    }

    /// `explain()`-style description of the plan
    pub fn explain(shape: &QueryShape, plan: &QueryPlan, indexes: &[IndexDefinition]) -> Value {
        let mut winning = Map::new();
        winning.insert("stage".to_string(), json!(plan.stage()));
        match plan {
            QueryPlan::IndexScan {
                index_name,
                key_pattern,
                predicates,
            } => {
                winning.insert("indexName".to_string(), json!(index_name));
                winning.insert("keyPattern".to_string(), key_pattern.clone());
                winning.insert(
                    "indexBounds".to_string(),
                    json!(predicates.iter().map(describe_predicate).collect::<Vec<_>>()),
                );
            }
            QueryPlan::TextScan { index_name, terms } => {
                winning.insert("indexName".to_string(), json!(index_name));
                winning.insert("terms".to_string(), json!(terms));
            }
            QueryPlan::CollectionScan => {}
        }

        let rejected: Vec<Value> = Self::candidates(shape, indexes)
            .into_iter()
            .filter(|c| Some(c.name.as_str()) != plan.index_name())
            .map(|c| json!({"stage": "IXSCAN", "indexName": c.name, "keyPattern": c.key}))
            .collect();

        json!({
            "queryPlanner": {
                "namespace": shape.collection,
                "winningPlan": Value::Object(winning),
                "rejectedPlans": rejected,
            }
        })
    }
}

fn map_bound(bound: &Bound<Value>) -> Bound<IndexKey> {
    match bound {
        Bound::Included(v) => Bound::Included(IndexKey::from(v)),
        Bound::Excluded(v) => Bound::Excluded(IndexKey::from(v)),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn describe_predicate(predicate: &KeyPredicate) -> Value {
    fn bound(b: &Bound<IndexKey>, open: &str) -> String {
        match b {
            Bound::Included(k) => format!("{:?}", k),
            Bound::Excluded(k) => format!("{:?} (exclusive)", k),
            Bound::Unbounded => open.to_string(),
        }
    }
    match predicate {
        KeyPredicate::Eq(keys) => {
            json!({"eq": keys.iter().map(|k| format!("{:?}", k)).collect::<Vec<_>>()})
        }
        KeyPredicate::Range { lower, upper } => {
            json!({"from": bound(lower, "MinKey"), "to": bound(upper, "MaxKey")})
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(filter: Value) -> QueryShape {
        QueryShape::from_filter("orders", &filter, &[])
    }

    #[test]
    fn test_shape_from_filter() {
        let s = QueryShape::from_filter(
            "orders",
            &json!({
                "customer_id": "c1",
                "order_status": {"$in": ["canceled", "unavailable"]},
                "order_purchase_timestamp": {"$gte": "2017-01-01", "$lt": "2018-01-01"},
                "$or": [{"a": 1}, {"b": 2}]
            }),
            &[("order_purchase_timestamp".to_string(), -1)],
        );
        assert_eq!(s.equality.len(), 2);
        assert_eq!(s.equality_values("order_status").unwrap().len(), 2);
        let range = s.range("order_purchase_timestamp").unwrap();
        assert_eq!(range.lower, Bound::Included(json!("2017-01-01")));
        assert_eq!(range.upper, Bound::Excluded(json!("2018-01-01")));
        assert!(s.range("a").is_none());
    }

    #[test]
    fn test_shape_merges_and_clauses() {
        let s = shape(json!({"$and": [{"a": 1}, {"b": {"$gt": 2}}]}));
        assert_eq!(s.equality_values("a"), Some(&[json!(1)][..]));
        assert!(s.range("b").is_some());
    }

    #[test]
    fn test_compound_index_would_be_used() {
        let index = IndexDefinition::new(&[("customer_id", 1), ("order_status", 1)]);
        let s = shape(json!({"customer_id": "X", "order_status": "delivered"}));
        assert!(QueryPlanner::would_use(&index, &s));

        // Trailing field alone cannot use the compound index
        assert!(!QueryPlanner::would_use(&index, &shape(json!({"order_status": "delivered"}))));
    }

    #[test]
    fn test_choose_prefers_longest_prefix() {
        let indexes = vec![
            IndexDefinition::new(&[("customer_id", 1)]),
            IndexDefinition::new(&[("customer_id", 1), ("order_status", 1)]),
        ];
        let s = shape(json!({"customer_id": "X", "order_status": "delivered"}));
        let chosen = QueryPlanner::choose(&s, &indexes).unwrap();
        assert_eq!(chosen.name, "customer_id_1_order_status_1");

        let s = shape(json!({"customer_id": "X"}));
        assert_eq!(QueryPlanner::choose(&s, &indexes).unwrap().name, "customer_id_1");
    }

    #[test]
    fn test_plan_with_missing_hint_fails() {
        let indexes = vec![IndexDefinition::new(&[("customer_id", 1)])];
        let s = shape(json!({"customer_id": "X"}));
        let result = QueryPlanner::plan(&s, &indexes, None, Some("nope_1"));
        assert!(matches!(result, Err(StoreLensError::IndexUnavailable(_))));
    }

    #[test]
    fn test_text_plan_requires_text_index() {
        let s = shape(json!({"$text": {"$search": "cama"}}));
        let terms = vec!["cama".to_string()];
        assert!(QueryPlanner::plan(&s, &[], Some(&terms), None).is_err());

        let indexes = vec![IndexDefinition::text(&["product_category_name"])];
        let plan = QueryPlanner::plan(&s, &indexes, Some(&terms), None).unwrap();
        assert_eq!(plan.stage(), "TEXT");
    }

    #[test]
    fn test_sparse_index_skips_null_equality() {
        let index = IndexDefinition::new(&[("order_approved_at", 1)]).sparse(true);
        assert!(!QueryPlanner::would_use(&index, &shape(json!({"order_approved_at": null}))));
    }

    #[test]
    fn test_recommend_esr_order() {
        let s = QueryShape::from_filter(
            "orders",
            &json!({"order_status": "delivered", "order_purchase_timestamp": {"$gte": "2017-01-01"}}),
            &[("customer_id".to_string(), 1)],
        );
        let recommended = QueryPlanner::recommend(&s);
        assert_eq!(
            recommended[0].name,
            "order_status_1_customer_id_1_order_purchase_timestamp_1"
        );
        assert_eq!(recommended[1].name, "order_status_1_order_purchase_timestamp_1");
        assert!(QueryPlanner::recommend(&shape(json!({}))).is_empty());
    }

    #[test]
    fn test_explain_reports_stage() {
        let indexes = vec![IndexDefinition::new(&[("customer_id", 1)])];
        let s = shape(json!({"customer_id": "X"}));
        let plan = QueryPlanner::plan(&s, &indexes, None, None).unwrap();
        let explained = QueryPlanner::explain(&s, &plan, &indexes);
        assert_eq!(explained["queryPlanner"]["winningPlan"]["stage"], "IXSCAN");
        assert_eq!(plan.summary(), "IXSCAN { customer_id: 1 }");

        let s = shape(json!({"price": 3}));
        let plan = QueryPlanner::plan(&s, &indexes, None, None).unwrap();
        assert_eq!(plan, QueryPlan::CollectionScan);
    }
}
