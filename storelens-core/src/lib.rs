// storelens-core/src/lib.rs
// Aggregation pipeline evaluator, index advisor and report runner for an
// e-commerce document model

pub mod admin;
pub mod aggregation;
pub mod config;
pub mod database;
pub mod dataset;
pub mod dates;
pub mod document;
pub mod error;
pub mod expression;
pub mod find_options;
pub mod functions;
pub mod index;
pub mod model;
pub mod profiler;
pub mod query;
pub mod query_planner;
pub mod reports;
pub mod saga;
pub mod schema;
pub mod sharding;
pub mod storage;
pub mod value_utils;

// Public exports
pub use aggregation::{MergeCounts, Pipeline, PipelineContext, PipelineSummary};
pub use config::EngineConfig;
pub use database::{AggregateOptions, AggregateOutput, Collection, Database};
pub use document::{Document, DocumentId};
pub use error::{Progress, Result, StoreLensError};
pub use find_options::FindOptions;
pub use index::{IndexDefinition, IndexUsage};
pub use model::{Customer, Item, Order, OrderStatus, Product, Review};
pub use profiler::{ProfileEntry, ProfilingLevel};
pub use query::Query;
pub use query_planner::{QueryPlanner, QueryShape};
pub use reports::{ExecutionStats, ReportName, ReportOutput, ReportParams, ReportRunner};
pub use saga::SagaProgress;
pub use sharding::{Route, ShardKey};
pub use storage::{DocumentStore, MemoryStore, Session, Store, StoreAdmin};
