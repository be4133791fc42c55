use crate::store::StoreError;
use chrono::NaiveDate;

pub type MeasureResult<T> = Result<T, MeasureError>;

#[derive(Debug, thiserror::Error)]
pub enum MeasureError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("unknown column {table}[{column}]")]
    UnknownColumn { table: String, column: String },

    #[error("unknown measure: {0}")]
    UnknownMeasure(String),

    #[error("measure {measure} references unknown measure [{reference}]")]
    UnknownMeasureReference { measure: String, reference: String },

    #[error("unknown variable {0}")]
    UnknownVariable(String),

    #[error("unknown relationship: {0}")]
    UnknownRelationship(String),

    #[error("duplicate table: {table}")]
    DuplicateTable { table: String },

    #[error("duplicate measure: {measure}")]
    DuplicateMeasure { measure: String },

    #[error("invalid relationship {relationship}: {reason}")]
    InvalidRelationship { relationship: String, reason: String },

    #[error("ambiguous join from {from} to {to}: {}", .paths.join(" | "))]
    AmbiguousJoin {
        from: String,
        to: String,
        paths: Vec<String>,
    },

    #[error("no relationship path from {from} to {to}")]
    NoJoinPath { from: String, to: String },

    #[error("cyclic measure reference: {}", .cycle.join(" -> "))]
    CyclicMeasure { cycle: Vec<String> },

    #[error("conditional in measure {measure} has no default branch")]
    MissingDefaultBranch { measure: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("date table has no rows between {start} and {end}")]
    MissingDateRange { start: NaiveDate, end: NaiveDate },

    #[error("no date table has been marked")]
    NoDateTable,

    #[error("filter context cannot restrict fact table {table} directly")]
    FactTableFilter { table: String },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Any other storage fault: schema mismatches, non-numeric data, dangling keys.
    #[error(transparent)]
    Store(StoreError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("type error: {0}")]
    Type(String),
}

impl From<StoreError> for MeasureError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => MeasureError::StoreUnavailable(reason),
            other => MeasureError::Store(other),
        }
    }
}
