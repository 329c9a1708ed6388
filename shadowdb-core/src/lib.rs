// src/lib.rs
// In-memory document database engine with MongoDB query semantics

pub mod aggregation;
pub mod collection_core;
pub mod database;
pub mod document;
pub mod error;
pub mod expression;
pub mod find_options;
pub mod index;
pub mod logging;
pub mod path;
pub mod projection;
pub mod query;
pub mod text;
pub mod update;
pub mod value;

// Public exports
pub use aggregation::{Pipeline, PipelineContext, Stage};
pub use collection_core::{CollectionCore, FindAndModifyOptions, InsertManyResult, UpdateResult};
pub use database::{DatabaseConfig, DatabaseCore};
pub use document::{Document, ID_FIELD};
pub use error::{Result, ShadowDbError};
pub use expression::{Evaluated, Expr};
pub use find_options::FindOptions;
pub use index::{IndexDefinition, IndexManager, IndexOptions};
pub use logging::{get_log_level, set_log_level, LogLevel};
pub use projection::Projection;
pub use query::Query;
pub use text::{TextSearchOptions, TextSearchResult, TextStats};
pub use update::Update;
pub use value::{ObjectId, Value};
