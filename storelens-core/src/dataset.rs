// storelens-core/src/dataset.rs
//! JSON dataset import
//!
//! A dataset is one JSON object mapping collection names to arrays of
//! documents, e.g. `{"orders": [...], "order_items": [...]}`.

use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::database::Database;
use crate::error::{Result, StoreLensError};

/// Documents inserted per collection, in file order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub collections: Vec<(String, usize)>,
}

impl LoadSummary {
    pub fn total(&self) -> usize {
        self.collections.iter().map(|(_, n)| n).sum()
    }

    pub fn count(&self, collection: &str) -> Option<usize> {
        self.collections
            .iter()
            .find(|(name, _)| name == collection)
            .map(|(_, n)| *n)
    }
}

pub fn load_value(db: &Database, dataset: Value) -> Result<LoadSummary> {
    let Value::Object(collections) = dataset else {
        return Err(StoreLensError::InvalidQuery(
            "dataset must be a JSON object of collection arrays".to_string(),
        ));
    };

    let mut summary = LoadSummary::default();
    for (name, documents) in collections {
        let Value::Array(documents) = documents else {
            return Err(StoreLensError::InvalidQuery(format!(
                "dataset entry '{}' must be an array of documents",
                name
            )));
        };
        let inserted = if documents.is_empty() {
            0
        } else {
            db.collection(&name).insert_many(documents)?.len()
        };
        summary.collections.push((name, inserted));
    }
    info!(
        db = db.name(),
        collections = summary.collections.len(),
        documents = summary.total(),
        "dataset loaded"
    );
    Ok(summary)
}

pub fn load_str(db: &Database, json: &str) -> Result<LoadSummary> {
    load_value(db, serde_json::from_str(json)?)
}

pub fn load_file(db: &Database, path: impl AsRef<Path>) -> Result<LoadSummary> {
    let text = fs::read_to_string(path.as_ref())?;
    load_str(db, &text)
}
