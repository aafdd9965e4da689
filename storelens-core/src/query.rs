// src/query.rs
//! Collection query filters
//!
//! Matching is delegated to the operator registry in [`operators`]. The
//! [`Query`] wrapper adds what the store needs on top of plain matching:
//! the `$text` clause, which is answered from a text index, is split off
//! from the rest of the filter when the query is built.

pub mod operators;

use crate::error::{Result, StoreLensError};
use crate::index::tokenize;
use serde_json::{Map, Value};

pub use operators::matches_filter;

/// `{$text: {$search: "..."}}`, tokenized the way text indexes are
#[derive(Debug, Clone, PartialEq)]
pub struct TextSearch {
    pub search: String,
    pub terms: Vec<String>,
}

impl TextSearch {
    fn from_json(spec: &Value) -> Result<Self> {
        let search = spec
            .get("$search")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StoreLensError::InvalidQuery("$text requires a $search string".to_string())
            })?;
        Ok(TextSearch {
            search: search.to_string(),
            terms: tokenize(search),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Query {
    /// Filter without the `$text` clause
    filter: Value,
    text: Option<TextSearch>,
}

impl Query {
    /// Empty query, matches every document
    pub fn new() -> Self {
        Query {
            filter: Value::Object(Map::new()),
            text: None,
        }
    }

    pub fn from_json(json: &Value) -> Result<Self> {
        let obj = json
            .as_object()
            .ok_or_else(|| StoreLensError::InvalidQuery("Filter must be an object".to_string()))?;

        let mut filter = obj.clone();
        let text = match filter.remove("$text") {
            Some(spec) => Some(TextSearch::from_json(&spec)?),
            None => None,
        };

        Ok(Query {
            filter: Value::Object(filter),
            text,
        })
    }

    /// Check the non-text part of the query against a document
    pub fn matches(&self, document: &Value) -> Result<bool> {
        matches_filter(document, &self.filter)
    }

    pub fn filter(&self) -> &Value {
        &self.filter
    }

    pub fn text(&self) -> Option<&TextSearch> {
        self.text.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.filter.as_object().map(Map::is_empty).unwrap_or(true)
    }
}

impl Default for Query {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_new_matches_all() {
        let query = Query::new();
        assert!(query.is_empty());
        assert!(query.matches(&json!({"name": "x"})).unwrap());
    }

    #[test]
    fn test_query_matches_comparison_operators() {
        let query = Query::from_json(&json!({"price": {"$gte": 18, "$lt": 30}})).unwrap();
        assert!(query.matches(&json!({"price": 25})).unwrap());
        assert!(!query.matches(&json!({"price": 15})).unwrap());
        assert!(!query.matches(&json!({"price": 35})).unwrap());
    }

    #[test]
    fn test_query_matches_complex_nested() {
        let query = Query::from_json(&json!({
            "$and": [
                {"$or": [{"customer_state": "SP"}, {"customer_state": "RJ"}]},
                {"total": {"$gte": 100}}
            ]
        }))
        .unwrap();

        assert!(query.matches(&json!({"customer_state": "SP", "total": 120})).unwrap());
        assert!(!query.matches(&json!({"customer_state": "RJ", "total": 20})).unwrap());
        assert!(!query.matches(&json!({"customer_state": "MG", "total": 500})).unwrap());
    }

    #[test]
    fn test_query_splits_text_clause() {
        let query = Query::from_json(&json!({
            "$text": {"$search": "Cama Mesa_banho"},
            "price": {"$gt": 10}
        }))
        .unwrap();

        let text = query.text().unwrap();
        assert_eq!(text.terms, vec!["cama", "mesa", "banho"]);
        assert_eq!(query.filter(), &json!({"price": {"$gt": 10}}));
        assert!(!query.is_empty());
    }

    #[test]
    fn test_query_text_requires_search() {
        let result = Query::from_json(&json!({"$text": {"term": "x"}}));
        assert!(result.unwrap_err().to_string().contains("$search"));
    }

    #[test]
    fn test_query_rejects_non_object() {
        assert!(Query::from_json(&json!("status")).is_err());
    }

    #[test]
    fn test_invalid_operator_surfaces_error() {
        let query = Query::from_json(&json!({"price": {"$near": 3}})).unwrap();
        assert!(query.matches(&json!({"price": 3})).is_err());
    }
}
