// storelens-core/src/find_options.rs
// Find query options: projection, sort, limit, skip, index hint

use crate::error::{Result, StoreLensError};
use crate::value_utils::{compare_values_with_none, lookup_field, remove_nested_value, set_nested_value};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Options for find queries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Projection: field → 1 (include) or 0 (exclude), in request order
    pub projection: Option<Vec<(String, i32)>>,

    /// Sort: [(field, direction)], direction: 1 (asc) or -1 (desc)
    pub sort: Option<Vec<(String, i32)>>,

    pub limit: Option<usize>,

    pub skip: Option<usize>,

    /// Index name the planner must use
    pub hint: Option<String>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_projection(mut self, projection: Vec<(String, i32)>) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_sort(mut self, sort: Vec<(String, i32)>) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_hint(mut self, index_name: &str) -> Self {
        self.hint = Some(index_name.to_string());
        self
    }

    /// Hint by key pattern, e.g. `[("customer_id", 1), ("order_status", 1)]`
    pub fn with_hint_keys(self, keys: &[(&str, i32)]) -> Self {
        let name = keys
            .iter()
            .map(|(field, dir)| format!("{}_{}", field, dir))
            .collect::<Vec<_>>()
            .join("_");
        self.with_hint(&name)
    }

    /// Parse `{projection, sort, limit, skip, hint}`; every key is optional
    pub fn from_json(spec: &Value) -> Result<Self> {
        let obj = spec.as_object().ok_or_else(|| {
            StoreLensError::InvalidQuery("Find options must be an object".to_string())
        })?;
        let mut options = FindOptions::new();

        for (key, value) in obj {
            match key.as_str() {
                "projection" => options.projection = Some(parse_field_directions(value, "projection")?),
                "sort" => options.sort = Some(parse_field_directions(value, "sort")?),
                "limit" => options.limit = Some(parse_count(value, "limit")?),
                "skip" => options.skip = Some(parse_count(value, "skip")?),
                "hint" => {
                    options.hint = Some(match value {
                        Value::String(name) => name.clone(),
                        Value::Object(_) => {
                            let keys = parse_field_directions(value, "hint")?;
                            let pairs: Vec<(&str, i32)> =
                                keys.iter().map(|(f, d)| (f.as_str(), *d)).collect();
                            FindOptions::new()
                                .with_hint_keys(&pairs)
                                .hint
                                .unwrap_or_default()
                        }
                        _ => {
                            return Err(StoreLensError::InvalidQuery(
                                "hint must be an index name or key pattern".to_string(),
                            ))
                        }
                    })
                }
                other => {
                    return Err(StoreLensError::InvalidQuery(format!(
                        "Unknown find option: {}",
                        other
                    )))
                }
            }
        }
        if let Some(projection) = &options.projection {
            validate_projection(projection)?;
        }
        Ok(options)
    }
}

fn parse_field_directions(value: &Value, what: &str) -> Result<Vec<(String, i32)>> {
    let obj = value.as_object().ok_or_else(|| {
        StoreLensError::InvalidQuery(format!("{} must be an object", what))
    })?;
    obj.iter()
        .map(|(field, dir)| {
            let dir = match dir {
                Value::Bool(true) => 1,
                Value::Bool(false) => 0,
                other => other.as_i64().ok_or_else(|| {
                    StoreLensError::InvalidQuery(format!("{} value for '{}' must be a number", what, field))
                })? as i32,
            };
            Ok((field.clone(), dir))
        })
        .collect()
}

fn parse_count(value: &Value, what: &str) -> Result<usize> {
    value
        .as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| StoreLensError::InvalidQuery(format!("{} must be a non-negative integer", what)))
}

/// Inclusion and exclusion cannot be mixed, except for excluding `_id`
pub fn validate_projection(projection: &[(String, i32)]) -> Result<()> {
    let includes = projection.iter().any(|(_, action)| *action != 0);
    let excludes = projection
        .iter()
        .any(|(field, action)| *action == 0 && field != "_id");
    if includes && excludes {
        return Err(StoreLensError::InvalidQuery(
            "Cannot mix inclusion and exclusion in a projection".to_string(),
        ));
    }
    Ok(())
}

/// Apply projection to a document
/// Supports dot notation for nested fields (e.g., "customer.state")
pub fn apply_projection(doc: &Value, projection: &[(String, i32)]) -> Value {
    if projection.is_empty() {
        return doc.clone();
    }

    let include_mode = projection.iter().any(|(_, action)| *action != 0);

    if include_mode {
        let mut result = Value::Object(Map::new());
        let exclude_id = projection.iter().any(|(f, a)| f == "_id" && *a == 0);
        if !exclude_id {
            if let Some(id) = doc.get("_id") {
                set_nested_value(&mut result, "_id", id.clone());
            }
        }
        for (field, action) in projection {
            if *action == 0 {
                continue;
            }
            if let Some(value) = lookup_field(doc, field) {
                set_nested_value(&mut result, field, value.into_owned());
            }
        }
        result
    } else {
        let mut result = doc.clone();
        for (field, _) in projection {
            remove_nested_value(&mut result, field);
        }
        result
    }
}

/// Stable multi-key sort; missing fields sort with null, before everything else
pub fn apply_sort(docs: &mut [Value], sort: &[(String, i32)]) {
    if sort.is_empty() {
        return;
    }

    docs.sort_by(|a, b| compare_by_keys(a, b, sort));
}

/// Comparison used by [`apply_sort`] and the `$sort` stage
pub fn compare_by_keys(a: &Value, b: &Value, sort: &[(String, i32)]) -> Ordering {
    for (field, direction) in sort {
        let val_a = lookup_field(a, field);
        let val_b = lookup_field(b, field);

        let cmp = compare_values_with_none(val_a.as_deref(), val_b.as_deref());

        if cmp != Ordering::Equal {
            return if *direction < 0 { cmp.reverse() } else { cmp };
        }
    }
    Ordering::Equal
}

/// Skip then limit
pub fn apply_limit_skip(docs: Vec<Value>, skip: Option<usize>, limit: Option<usize>) -> Vec<Value> {
    let skipped = docs.into_iter().skip(skip.unwrap_or(0));
    match limit {
        Some(limit) => skipped.take(limit).collect(),
        None => skipped.collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, i32)]) -> Vec<(String, i32)> {
        pairs.iter().map(|(f, d)| (f.to_string(), *d)).collect()
    }

    #[test]
    fn test_projection_include_mode() {
        let doc = json!({"_id": 1, "customer": {"state": "SP", "city": "x"}, "total": 9});
        let projected = apply_projection(&doc, &fields(&[("customer.state", 1)]));
        assert_eq!(projected, json!({"_id": 1, "customer": {"state": "SP"}}));

        let projected = apply_projection(&doc, &fields(&[("total", 1), ("_id", 0)]));
        assert_eq!(projected, json!({"total": 9}));
    }

    #[test]
    fn test_projection_exclude_mode() {
        let doc = json!({"_id": 1, "customer": {"state": "SP", "city": "x"}, "total": 9});
        let projected = apply_projection(&doc, &fields(&[("customer.city", 0), ("_id", 0)]));
        assert_eq!(projected, json!({"customer": {"state": "SP"}, "total": 9}));
    }

    #[test]
    fn test_projection_validation() {
        assert!(validate_projection(&fields(&[("a", 1), ("_id", 0)])).is_ok());
        let result = validate_projection(&fields(&[("a", 1), ("b", 0)]));
        assert!(result.unwrap_err().to_string().contains("Cannot mix"));
    }

    #[test]
    fn test_sort_multi_key_and_missing() {
        let mut docs = vec![
            json!({"state": "SP", "total": 10}),
            json!({"state": "RJ", "total": 30}),
            json!({"total": 5}),
            json!({"state": "SP", "total": 20}),
        ];
        apply_sort(&mut docs, &fields(&[("state", 1), ("total", -1)]));
        assert_eq!(docs[0], json!({"total": 5}));
        assert_eq!(docs[1]["state"], "RJ");
        assert_eq!(docs[2]["total"], 20);
        assert_eq!(docs[3]["total"], 10);
    }

    #[test]
    fn test_limit_skip() {
        let docs: Vec<Value> = (0..10).map(|i| json!(i)).collect();
        assert_eq!(apply_limit_skip(docs.clone(), Some(8), Some(5)), vec![json!(8), json!(9)]);
        assert_eq!(apply_limit_skip(docs, None, Some(0)).len(), 0);
    }

    #[test]
    fn test_from_json_and_hint_keys() {
        let options = FindOptions::from_json(&json!({
            "sort": {"order_purchase_timestamp": -1},
            "limit": 10,
            "hint": {"customer_id": 1, "order_status": 1}
        }))
        .unwrap();
        assert_eq!(options.sort, Some(fields(&[("order_purchase_timestamp", -1)])));
        assert_eq!(options.limit, Some(10));
        assert_eq!(options.hint.as_deref(), Some("customer_id_1_order_status_1"));

        assert!(FindOptions::from_json(&json!({"batch": 3})).is_err());
        assert!(FindOptions::from_json(&json!({"limit": -1})).is_err());
    }
}
