// storelens-core/src/error.rs
// Error types shared by the store adapter, pipeline evaluator and workflows

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Counts accumulated by a multi-step operation before it stopped.
///
/// Steps keep the order in which they were first recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    steps: Vec<(String, u64)>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the count for a step, replacing any earlier value
    pub fn record(&mut self, step: &str, count: u64) {
        if let Some(entry) = self.steps.iter_mut().find(|(name, _)| name == step) {
            entry.1 = count;
        } else {
            self.steps.push((step.to_string(), count));
        }
    }

    pub fn with(mut self, step: &str, count: u64) -> Self {
        self.record(step, count);
        self
    }

    pub fn get(&self, step: &str) -> Option<u64> {
        self.steps
            .iter()
            .find(|(name, _)| name == step)
            .map(|(_, count)| *count)
    }

    pub fn steps(&self) -> &[(String, u64)] {
        &self.steps
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .steps
            .iter()
            .map(|(name, count)| format!("{}={}", name, count))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

#[derive(Error, Debug)]
pub enum StoreLensError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Aggregation error: {0}")]
    AggregationError(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    /// An update or delete filter matched zero documents
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uniqueness or validator breach; the write was rejected as a whole
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Division undefined: {0}")]
    DivisionUndefined(String),

    /// A hint named an index that does not exist
    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Index error: {0}")]
    IndexError(String),

    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("Sharding error: {0}")]
    ShardingError(String),

    #[error("Pipeline cancelled before stage {0}")]
    Cancelled(usize),

    #[error("{operation} failed after partial progress ({progress}): {source}")]
    PartialFailure {
        operation: String,
        progress: Progress,
        #[source]
        source: Box<StoreLensError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreLensError {
    pub fn partial(operation: &str, progress: Progress, source: StoreLensError) -> Self {
        StoreLensError::PartialFailure {
            operation: operation.to_string(),
            progress,
            source: Box::new(source),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreLensError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreLensError>;
