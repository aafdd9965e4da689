// storage/update_ops.rs
//! Update operators
//!
//! `$set $unset $inc $mul $push $addToSet $pull $pop $currentDate`, with
//! dotted paths, numeric array indexes, `$[]` (every element) and
//! `$[ident]` (elements matching an array filter). The plain positional
//! `$` operator is not supported.

use crate::dates;
use crate::error::{Result, StoreLensError};
use crate::query::matches_filter;
use crate::value_utils::values_equal;
use chrono::Utc;
use serde_json::{Map, Value};

/// Check the shape of an update document without applying it
pub fn validate_update(update: &Value) -> Result<()> {
    let ops = update.as_object().ok_or_else(|| {
        StoreLensError::InvalidQuery("Update must be an object".to_string())
    })?;
    if ops.is_empty() {
        return Err(StoreLensError::InvalidQuery(
            "Update document must not be empty".to_string(),
        ));
    }
    for (op, fields) in ops {
        if !op.starts_with('$') {
            return Err(StoreLensError::InvalidQuery(format!(
                "Update document requires atomic operators, found '{}'",
                op
            )));
        }
        if !fields.is_object() {
            return Err(StoreLensError::InvalidQuery(format!(
                "Modifiers for {} must be an object",
                op
            )));
        }
        for field in fields.as_object().into_iter().flat_map(|f| f.keys()) {
            if field == "_id" || field.starts_with("_id.") {
                return Err(StoreLensError::InvalidQuery(
                    "Performing an update on the path '_id' would modify the immutable field '_id'"
                        .to_string(),
                ));
            }
            if field.split('.').any(|segment| segment == "$") {
                return Err(StoreLensError::InvalidQuery(format!(
                    "The positional operator '$' is not supported in '{}'; use '$[<identifier>]' with arrayFilters",
                    field
                )));
            }
        }
    }
    Ok(())
}

/// `arrayFilters` by identifier
struct ArrayFilters<'a> {
    filters: Vec<(String, &'a Value)>,
}

impl<'a> ArrayFilters<'a> {
    fn parse(filters: &'a [Value]) -> Result<Self> {
        let mut parsed = Vec::new();
        for filter in filters {
            let obj = filter.as_object().ok_or_else(|| {
                StoreLensError::InvalidQuery("Each array filter must be an object".to_string())
            })?;
            let ident = obj
                .keys()
                .next()
                .and_then(|key| key.split('.').next())
                .ok_or_else(|| {
                    StoreLensError::InvalidQuery("Array filter must not be empty".to_string())
                })?;
            if obj.keys().any(|key| key.split('.').next() != Some(ident)) {
                return Err(StoreLensError::InvalidQuery(format!(
                    "Array filter for '{}' mixes identifiers",
                    ident
                )));
            }
            parsed.push((ident.to_string(), filter));
        }
        Ok(ArrayFilters { filters: parsed })
    }

    fn matches(&self, ident: &str, element: &Value) -> Result<bool> {
        let (_, filter) = self
            .filters
            .iter()
            .find(|(name, _)| name == ident)
            .ok_or_else(|| {
                StoreLensError::InvalidQuery(format!(
                    "No array filter found for identifier '{}'",
                    ident
                ))
            })?;
        let mut wrapped = Map::new();
        wrapped.insert(ident.to_string(), element.clone());
        matches_filter(&Value::Object(wrapped), filter)
    }
}

enum Segment<'p> {
    AllElements,
    Filtered(&'p str),
    Key(&'p str),
}

fn segment(raw: &str) -> Segment<'_> {
    if raw == "$[]" {
        Segment::AllElements
    } else if let Some(ident) = raw.strip_prefix("$[").and_then(|r| r.strip_suffix(']')) {
        Segment::Filtered(ident)
    } else {
        Segment::Key(raw)
    }
}

// ============================================================================
// SLOTS: a (container, key) pair the operators read and write
// ============================================================================

fn slot_get<'v>(parent: &'v Value, key: &str) -> Option<&'v Value> {
    match parent {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

fn slot_set(parent: &mut Value, key: &str, value: Value) -> Result<()> {
    match parent {
        Value::Object(map) => {
            map.insert(key.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = key.parse::<usize>().map_err(|_| {
                StoreLensError::InvalidQuery(format!("Cannot create field '{}' in an array", key))
            })?;
            if index >= items.len() {
                items.resize(index + 1, Value::Null);
            }
            items[index] = value;
            Ok(())
        }
        other => Err(StoreLensError::InvalidQuery(format!(
            "Cannot create field '{}' in element {}",
            key, other
        ))),
    }
}

fn slot_remove(parent: &mut Value, key: &str) {
    match parent {
        Value::Object(map) => {
            map.shift_remove(key);
        }
        // Array elements are nulled, not removed, so indexes stay put
        Value::Array(items) => {
            if let Some(item) = key.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                *item = Value::Null;
            }
        }
        _ => {}
    }
}

/// Visit every (container, key) slot a path resolves to. With `create`,
/// missing intermediate objects are created on the way.
fn for_each_slot(
    node: &mut Value,
    segments: &[&str],
    filters: &ArrayFilters<'_>,
    create: bool,
    action: &mut dyn FnMut(&mut Value, &str) -> Result<()>,
) -> Result<()> {
    let Some((head, rest)) = segments.split_first() else {
        return Ok(());
    };

    match segment(head) {
        Segment::Key(key) if rest.is_empty() => action(node, key),
        Segment::Key(key) => {
            let child = match node {
                Value::Object(map) => {
                    if !map.contains_key(key) {
                        if !create {
                            return Ok(());
                        }
                        map.insert(key.to_string(), Value::Object(Map::new()));
                    }
                    map.get_mut(key)
                }
                Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
                _ => None,
            };
            match child {
                Some(child) => for_each_slot(child, rest, filters, create, action),
                None if create => Err(StoreLensError::InvalidQuery(format!(
                    "Cannot create field '{}' in a non-object element",
                    key
                ))),
                None => Ok(()),
            }
        }
        positional => {
            let Value::Array(items) = node else {
                return Err(StoreLensError::InvalidQuery(format!(
                    "The path segment '{}' requires an array",
                    head
                )));
            };
            let mut selected = Vec::new();
            for (i, item) in items.iter().enumerate() {
                let keep = match positional {
                    Segment::Filtered(ident) => filters.matches(ident, item)?,
                    _ => true,
                };
                if keep {
                    selected.push(i);
                }
            }
            for i in selected {
                if rest.is_empty() {
                    action(node, &i.to_string())?;
                } else if let Value::Array(items) = node {
                    for_each_slot(&mut items[i], rest, filters, create, action)?;
                }
            }
            Ok(())
        }
    }
}

// ============================================================================
// OPERATORS
// ============================================================================

fn each_items(value: &Value) -> Vec<Value> {
    match value.as_object().and_then(|m| m.get("$each")) {
        Some(Value::Array(items)) => items.clone(),
        Some(single) => vec![single.clone()],
        None => vec![value.clone()],
    }
}

fn arithmetic(current: Option<&Value>, operand: &Value, op: &str, field: &str) -> Result<Value> {
    let non_numeric = || {
        StoreLensError::InvalidQuery(format!(
            "Cannot apply {} to a value of non-numeric type in field '{}'",
            op, field
        ))
    };
    if !operand.is_number() {
        return Err(non_numeric());
    }
    let current = match current {
        Some(Value::Null) | None => {
            return Ok(if op == "$inc" { operand.clone() } else { zero_like(operand) });
        }
        Some(v) if !v.is_number() => return Err(non_numeric()),
        Some(v) => v,
    };
    // Integers stay integers when both sides are integral
    if let (Some(a), Some(b)) = (current.as_i64(), operand.as_i64()) {
        let result = if op == "$inc" { a.checked_add(b) } else { a.checked_mul(b) };
        if let Some(n) = result {
            return Ok(Value::from(n));
        }
    }
    let (a, b) = (
        current.as_f64().ok_or_else(non_numeric)?,
        operand.as_f64().ok_or_else(non_numeric)?,
    );
    let n = if op == "$inc" { a + b } else { a * b };
    Ok(crate::value_utils::number_value(n))
}

fn zero_like(operand: &Value) -> Value {
    if operand.is_i64() || operand.is_u64() {
        Value::from(0)
    } else {
        Value::from(0.0)
    }
}

fn pull_matches(element: &Value, condition: &Value) -> Result<bool> {
    match condition.as_object() {
        Some(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => {
            let mut wrapped = Map::new();
            wrapped.insert("v".to_string(), element.clone());
            let mut filter = Map::new();
            filter.insert("v".to_string(), condition.clone());
            matches_filter(&Value::Object(wrapped), &Value::Object(filter))
        }
        Some(_) if element.is_object() => matches_filter(element, condition),
        _ => Ok(values_equal(element, condition)),
    }
}

fn apply_operator(
    doc: &mut Value,
    op: &str,
    field: &str,
    operand: &Value,
    filters: &ArrayFilters<'_>,
) -> Result<()> {
    let segments: Vec<&str> = field.split('.').collect();
    let creates = !matches!(op, "$unset" | "$pull" | "$pop");

    for_each_slot(doc, &segments, filters, creates, &mut |parent, key| {
        match op {
            "$set" => slot_set(parent, key, operand.clone()),
            "$unset" => {
                slot_remove(parent, key);
                Ok(())
            }
            "$inc" | "$mul" => {
                let next = arithmetic(slot_get(parent, key), operand, op, field)?;
                slot_set(parent, key, next)
            }
            "$currentDate" => slot_set(parent, key, dates::timestamp_value(&Utc::now())),
            "$push" | "$addToSet" => {
                let mut array = match slot_get(parent, key) {
                    Some(Value::Array(items)) => items.clone(),
                    None | Some(Value::Null) => Vec::new(),
                    Some(_) => {
                        return Err(StoreLensError::InvalidQuery(format!(
                            "{}: field '{}' is not an array",
                            op, field
                        )))
                    }
                };
                let items = each_items(operand);
                if op == "$push" {
                    let position = operand
                        .get("$position")
                        .and_then(Value::as_u64)
                        .map(|p| p as usize);
                    match position {
                        Some(pos) => {
                            let at = pos.min(array.len());
                            array.splice(at..at, items);
                        }
                        None => array.extend(items),
                    }
                    if let Some(slice) = operand.get("$slice").and_then(Value::as_i64) {
                        if slice < 0 {
                            let keep = slice.unsigned_abs() as usize;
                            if array.len() > keep {
                                array.drain(..array.len() - keep);
                            }
                        } else {
                            array.truncate(slice as usize);
                        }
                    }
                } else {
                    for item in items {
                        if !array.iter().any(|existing| values_equal(existing, &item)) {
                            array.push(item);
                        }
                    }
                }
                slot_set(parent, key, Value::Array(array))
            }
            "$pull" => match slot_get(parent, key) {
                Some(Value::Array(items)) => {
                    let mut kept = Vec::with_capacity(items.len());
                    for item in items {
                        if !pull_matches(item, operand)? {
                            kept.push(item.clone());
                        }
                    }
                    slot_set(parent, key, Value::Array(kept))
                }
                None | Some(Value::Null) => Ok(()),
                Some(_) => Err(StoreLensError::InvalidQuery(format!(
                    "$pull: field '{}' is not an array",
                    field
                ))),
            },
            "$pop" => match slot_get(parent, key) {
                Some(Value::Array(items)) => {
                    let mut items = items.clone();
                    match operand.as_i64() {
                        Some(-1) if !items.is_empty() => {
                            items.remove(0);
                        }
                        Some(1) => {
                            items.pop();
                        }
                        Some(-1) => {}
                        _ => {
                            return Err(StoreLensError::InvalidQuery(format!(
                                "$pop: value must be -1 or 1, got {}",
                                operand
                            )))
                        }
                    }
                    slot_set(parent, key, Value::Array(items))
                }
                None => Ok(()),
                Some(_) => Err(StoreLensError::InvalidQuery(format!(
                    "$pop: field '{}' is not an array",
                    field
                ))),
            },
            other => Err(StoreLensError::InvalidQuery(format!(
                "Unsupported update operator: {}",
                other
            ))),
        }
    })
}

/// Apply an update document; returns whether the document changed
///
/// Works on a copy, so a failing operator leaves `doc` untouched.
pub fn apply_update(doc: &mut Value, update: &Value, array_filters: &[Value]) -> Result<bool> {
    validate_update(update)?;
    let filters = ArrayFilters::parse(array_filters)?;

    let mut next = doc.clone();
    if let Some(ops) = update.as_object() {
        for (op, fields) in ops {
            if let Some(fields) = fields.as_object() {
                for (field, operand) in fields {
                    apply_operator(&mut next, op, field, operand, &filters)?;
                }
            }
        }
    }

    if next == *doc {
        return Ok(false);
    }
    *doc = next;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn apply(doc: &mut Value, update: Value) -> Result<bool> {
        apply_update(doc, &update, &[])
    }

    #[test]
    fn test_set_nested_and_noop() {
        let mut doc = json!({"_id": 1, "order_status": "created"});
        assert!(apply(&mut doc, json!({"$set": {"order_status": "approved", "flags.priority": true}})).unwrap());
        assert_eq!(doc["flags"]["priority"], true);
        assert!(!apply(&mut doc, json!({"$set": {"order_status": "approved"}})).unwrap());
    }

    #[test]
    fn test_unset_missing_is_noop() {
        let mut doc = json!({"_id": 1, "a": {"b": 1}});
        assert!(!apply(&mut doc, json!({"$unset": {"x.y": ""}})).unwrap());
        assert!(apply(&mut doc, json!({"$unset": {"a.b": ""}})).unwrap());
        assert_eq!(doc, json!({"_id": 1, "a": {}}));
    }

    #[test]
    fn test_inc_and_mul_keep_integer_type() {
        let mut doc = json!({"_id": 1, "qty": 2, "price": 10.0});
        apply(&mut doc, json!({"$inc": {"qty": 3, "views": 1}, "$mul": {"price": 1.1}})).unwrap();
        assert_eq!(doc["qty"], json!(5));
        assert_eq!(doc["views"], json!(1));
        assert!((doc["price"].as_f64().unwrap() - 11.0).abs() < 1e-9);

        let err = apply(&mut doc, json!({"$inc": {"_missing": "x"}})).unwrap_err();
        assert!(err.to_string().contains("non-numeric"));
    }

    #[test]
    fn test_push_each_slice_and_add_to_set() {
        let mut doc = json!({"_id": 1, "tags": ["a"]});
        apply(&mut doc, json!({"$push": {"tags": {"$each": ["b", "c", "d"], "$slice": -3}}})).unwrap();
        assert_eq!(doc["tags"], json!(["b", "c", "d"]));
        assert!(!apply(&mut doc, json!({"$addToSet": {"tags": "b"}})).unwrap());
        apply(&mut doc, json!({"$addToSet": {"tags": {"$each": ["e", "b"]}}})).unwrap();
        assert_eq!(doc["tags"], json!(["b", "c", "d", "e"]));
    }

    #[test]
    fn test_pull_by_value_and_condition() {
        let mut doc = json!({
            "_id": 1,
            "tags": ["gift", "sale"],
            "reviews": [{"reviewer_id": "u1", "rating": 2}, {"reviewer_id": "u2", "rating": 5}]
        });
        apply(&mut doc, json!({"$pull": {"tags": "sale"}})).unwrap();
        assert_eq!(doc["tags"], json!(["gift"]));
        apply(&mut doc, json!({"$pull": {"reviews": {"reviewer_id": "u1"}}})).unwrap();
        assert_eq!(doc["reviews"].as_array().unwrap().len(), 1);

        let mut doc = json!({"_id": 1, "scores": [1, 6, 3, 9]});
        apply(&mut doc, json!({"$pull": {"scores": {"$gte": 6}}})).unwrap();
        assert_eq!(doc["scores"], json!([1, 3]));
    }

    #[test]
    fn test_filtered_positional_update() {
        let mut doc = json!({
            "_id": 1,
            "reviews": [{"reviewer_id": "u1", "rating": 2}, {"reviewer_id": "u2", "rating": 5}]
        });
        let filters = vec![json!({"r.reviewer_id": "u1"})];
        let changed = apply_update(
            &mut doc,
            &json!({"$set": {"reviews.$[r].rating": 4, "reviews.$[r].comment": "better"}}),
            &filters,
        )
        .unwrap();
        assert!(changed);
        assert_eq!(doc["reviews"][0], json!({"reviewer_id": "u1", "rating": 4, "comment": "better"}));
        assert_eq!(doc["reviews"][1]["rating"], 5);
    }

    #[test]
    fn test_all_elements_positional() {
        let mut doc = json!({"_id": 1, "items": [{"price": 10}, {"price": 20}]});
        apply(&mut doc, json!({"$mul": {"items.$[].price": 2}})).unwrap();
        assert_eq!(doc["items"], json!([{"price": 20}, {"price": 40}]));
    }

    #[test]
    fn test_missing_array_filter_is_error() {
        let mut doc = json!({"_id": 1, "items": [1, 2]});
        let err = apply(&mut doc, json!({"$set": {"items.$[x]": 0}})).unwrap_err();
        assert!(err.to_string().contains("No array filter"));
        assert_eq!(doc["items"], json!([1, 2]));
    }

    #[test]
    fn test_rejections() {
        let mut doc = json!({"_id": 1});
        assert!(apply(&mut doc, json!({"name": "x"})).is_err());
        assert!(apply(&mut doc, json!({"$set": {"_id": 2}})).is_err());
        assert!(apply(&mut doc, json!({"$set": {"items.$.price": 2}})).is_err());
        assert!(apply(&mut doc, json!({"$rename": {"a": "b"}})).is_err());
        assert!(apply(&mut doc, json!({})).is_err());
    }

    #[test]
    fn test_current_date() {
        let mut doc = json!({"_id": 1});
        apply(&mut doc, json!({"$currentDate": {"last_modified": true}})).unwrap();
        assert!(dates::looks_like_timestamp(doc["last_modified"].as_str().unwrap()));
    }
}
