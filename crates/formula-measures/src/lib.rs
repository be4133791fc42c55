mod cache;
mod catalog;
mod config;
mod context;
mod engine;
mod error;
mod expr;
mod iterator;
pub mod kpi;
mod measure;
mod model;
mod parser;
mod predicate;
mod store;
mod time_intel;
mod value;

pub use crate::cache::CacheStats;
pub use crate::catalog::{
    Catalog, DateTable, JoinPath, JoinStep, Relationship, TableRole, TableSchema,
};
pub use crate::config::{
    DateTableConfig, EngineSettings, MeasureConfig, ModelConfig, RelationshipConfig, TableConfig,
};
pub use crate::context::{ContextFingerprint, FilterContext};
pub use crate::engine::{Evaluator, RowContext};
pub use crate::error::{MeasureError, MeasureResult};
pub use crate::expr::{
    BinaryOp, Expr, FilterModifier, IterateKind, PeriodFunction, PeriodUnit, RankOrder, RankTies,
    RelationshipRef, TableExpr, UnaryOp,
};
pub use crate::measure::{normalize_measure_name, Measure, MeasureDefinition, MeasureRegistry};
pub use crate::model::DataModel;
pub use crate::parser::parse;
pub use crate::predicate::{CompareOp, Predicate};
pub use crate::store::{
    AggregateOp, InMemoryStore, Row, RowIter, RowSchema, Store, StoreError, StoreResult, Table,
};
pub use crate::time_intel::{shift_date, window};
pub use crate::value::{compare_values, Value};
