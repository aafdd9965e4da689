//! Value utility functions shared across modules
//!
//! This module provides common functions for working with JSON values,
//! including nested field access, array-aware path resolution and the
//! ordering rules used by queries, sorting and grouping.

use crate::dates;
use serde_json::Value;
use std::borrow::Cow;
use std::cmp::Ordering;

/// Get nested value from JSON with dot notation support
///
/// Supports:
/// - Simple fields: "name"
/// - Nested objects: "address.city"
/// - Array indexing: "items.0.name"
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use storelens_core::value_utils::get_nested_value;
///
/// let doc = json!({"address": {"city": "NYC"}});
/// assert_eq!(get_nested_value(&doc, "address.city"), Some(&json!("NYC")));
/// ```
pub fn get_nested_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if !path.contains('.') {
        return doc.get(path);
    }

    let mut value = doc;
    for part in path.split('.') {
        match value {
            Value::Object(map) => value = map.get(part)?,
            Value::Array(arr) => {
                if let Ok(index) = part.parse::<usize>() {
                    value = arr.get(index)?;
                } else {
                    return None;
                }
            }
            _ => return None,
        }
    }
    Some(value)
}

/// Resolve a path, mapping over arrays met along the way
///
/// `"items.price"` on `{"items": [{"price": 1}, {"price": 2}]}` yields `[1, 2]`.
/// Elements without the field are skipped, as aggregation field paths do.
pub fn resolve_path(doc: &Value, path: &str) -> Option<Value> {
    let parts: Vec<&str> = path.split('.').collect();
    resolve_parts(doc, &parts)
}

fn resolve_parts(value: &Value, parts: &[&str]) -> Option<Value> {
    let Some((head, rest)) = parts.split_first() else {
        return Some(value.clone());
    };
    match value {
        Value::Object(map) => resolve_parts(map.get(*head)?, rest),
        Value::Array(arr) => {
            if let Ok(index) = head.parse::<usize>() {
                return resolve_parts(arr.get(index)?, rest);
            }
            let mapped: Vec<Value> = arr
                .iter()
                .filter(|elem| elem.is_object())
                .filter_map(|elem| resolve_parts(elem, parts))
                .collect();
            Some(Value::Array(mapped))
        }
        _ => None,
    }
}

/// Field lookup for query matching: borrowed when the path is direct,
/// otherwise the array-mapped value from [`resolve_path`].
pub fn lookup_field<'a>(doc: &'a Value, path: &str) -> Option<Cow<'a, Value>> {
    if let Some(value) = get_nested_value(doc, path) {
        return Some(Cow::Borrowed(value));
    }
    if path.contains('.') {
        return resolve_path(doc, path).map(Cow::Owned);
    }
    None
}

/// Set a value at a nested path with dot notation support
///
/// Creates intermediate objects if they don't exist.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use storelens_core::value_utils::set_nested_value;
///
/// let mut doc = json!({"name": "Alice"});
/// set_nested_value(&mut doc, "address.city", json!("NYC"));
/// assert_eq!(doc["address"]["city"], "NYC");
/// ```
pub fn set_nested_value(doc: &mut Value, path: &str, value: Value) {
    let mut parts = path.split('.').peekable();
    let mut current = doc;

    while let Some(part) = parts.next() {
        let Value::Object(map) = current else {
            // Cannot navigate into non-object
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        let next = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !next.is_object() {
            *next = Value::Object(serde_json::Map::new());
        }
        current = next;
    }
}

/// Remove the value at a dotted path, returning it when present
pub fn remove_nested_value(doc: &mut Value, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => doc.as_object_mut()?.shift_remove(path),
        Some((parent, last)) => {
            let mut current = doc;
            for part in parent.split('.') {
                current = match current {
                    Value::Object(map) => map.get_mut(part)?,
                    Value::Array(arr) => arr.get_mut(part.parse::<usize>().ok()?)?,
                    _ => return None,
                };
            }
            current.as_object_mut()?.shift_remove(last)
        }
    }
}

/// Compare two JSON values of the same kind
///
/// Returns `Some(Ordering)` for comparable types (numbers, strings, booleans),
/// `None` for incompatible types (e.g., comparing string to number).
/// Two strings that both parse as timestamps compare chronologically, so
/// `"2017-10-02 10:56:33"` equals `"2017-10-02T10:56:33Z"`.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use std::cmp::Ordering;
/// use storelens_core::value_utils::compare_values;
///
/// assert_eq!(compare_values(&json!(10), &json!(5)), Some(Ordering::Greater));
/// assert_eq!(compare_values(&json!("a"), &json!("b")), Some(Ordering::Less));
/// assert_eq!(compare_values(&json!("a"), &json!(1)), None); // incompatible
/// ```
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(n1), Value::Number(n2)) => {
            if let (Some(i1), Some(i2)) = (n1.as_i64(), n2.as_i64()) {
                return Some(i1.cmp(&i2));
            }
            let f1 = n1.as_f64()?;
            let f2 = n2.as_f64()?;
            f1.partial_cmp(&f2)
        }
        (Value::String(s1), Value::String(s2)) => Some(compare_strings(s1, s2)),
        (Value::Bool(b1), Value::Bool(b2)) => Some(b1.cmp(b2)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn compare_strings(s1: &str, s2: &str) -> Ordering {
    if s1 == s2 {
        return Ordering::Equal;
    }
    if let (Some(d1), Some(d2)) = (dates::parse_timestamp(s1), dates::parse_timestamp(s2)) {
        return d1.cmp(&d2);
    }
    s1.cmp(s2)
}

/// Rank of a value's type in the cross-type sort order:
/// null < numbers < strings < objects < arrays < booleans
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order over all JSON values, used wherever a deterministic result is
/// required (sort, group keys, min/max, bucket boundaries).
pub fn total_cmp(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Number(n1), Value::Number(n2)) => {
            if let (Some(i1), Some(i2)) = (n1.as_i64(), n2.as_i64()) {
                return i1.cmp(&i2);
            }
            let f1 = n1.as_f64().unwrap_or(f64::NAN);
            let f2 = n2.as_f64().unwrap_or(f64::NAN);
            f1.total_cmp(&f2)
        }
        (Value::String(s1), Value::String(s2)) => compare_strings(s1, s2),
        (Value::Bool(b1), Value::Bool(b2)) => b1.cmp(b2),
        (Value::Array(a1), Value::Array(a2)) => {
            for (x, y) in a1.iter().zip(a2.iter()) {
                let cmp = total_cmp(x, y);
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            a1.len().cmp(&a2.len())
        }
        (Value::Object(o1), Value::Object(o2)) => {
            for ((k1, v1), (k2, v2)) in o1.iter().zip(o2.iter()) {
                let cmp = k1.cmp(k2).then_with(|| total_cmp(v1, v2));
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            o1.len().cmp(&o2.len())
        }
        _ => Ordering::Equal,
    }
}

/// Equality with numeric and timestamp normalisation (`1 == 1.0`)
pub fn values_equal(a: &Value, b: &Value) -> bool {
    a == b || total_cmp(a, b) == Ordering::Equal
}

/// Compare two optional JSON values with None handling
///
/// Used for sorting where missing values need consistent ordering.
/// None sorts with null, before any other value.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use std::cmp::Ordering;
/// use storelens_core::value_utils::compare_values_with_none;
///
/// assert_eq!(compare_values_with_none(None, Some(&json!(5))), Ordering::Less);
/// assert_eq!(compare_values_with_none(Some(&json!(10)), None), Ordering::Greater);
/// ```
pub fn compare_values_with_none(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.unwrap_or(&Value::Null);
    let b = b.unwrap_or(&Value::Null);
    total_cmp(a, b)
}

/// Numeric view of a value
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Float to JSON number; NaN and infinities become null
pub fn number_value(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Creates a canonical string representation of a JSON value
/// where object keys are always sorted alphabetically.
///
/// This ensures that two logically equivalent JSON objects with different
/// key ordering (e.g., `{"a":1,"b":2}` and `{"b":2,"a":1}`) produce the
/// same string representation. Integral floats render like integers so
/// `1.0` and `1` share a key.
///
/// Used for group keys, document ids and `$addToSet` deduplication.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use storelens_core::value_utils::canonical_json_string;
///
/// let v1 = json!({"a": 1, "b": 2});
/// let v2 = json!({"b": 2, "a": 1});
/// assert_eq!(canonical_json_string(&v1), canonical_json_string(&v2));
/// ```
pub fn canonical_json_string(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));

            let inner: String = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", Value::String((*k).clone()), canonical_json_string(v)))
                .collect::<Vec<_>>()
                .join(",");

            format!("{{{}}}", inner)
        }
        Value::Array(arr) => {
            let inner: String = arr
                .iter()
                .map(canonical_json_string)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{}]", inner)
        }
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => format!("{}", f as i64),
            _ => value.to_string(),
        },
        _ => value.to_string(),
    }
}

/// Aggregation truthiness: false, null, missing and zero are false
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => true,
    }
}
