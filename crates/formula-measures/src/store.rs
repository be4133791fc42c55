use crate::predicate::Predicate;
use crate::value::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store has no table {0}")]
    UnknownTable(String),

    #[error("store has no column {table}[{column}]")]
    UnknownColumn { table: String, column: String },

    #[error("store already has a table named {0}")]
    DuplicateTable(String),

    #[error("schema mismatch for {table}: expected {expected} values, got {actual}")]
    SchemaMismatch {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("{op:?} over {table} requires a column")]
    MissingColumn { table: String, op: AggregateOp },

    #[error("cannot aggregate non-numeric value {value} in {table}[{column}]")]
    NonNumeric {
        table: String,
        column: String,
        value: Value,
    },

    #[error(
        "referential integrity violation: {from_table}[{from_column}] value {value} has no match in {to_table}[{to_column}]"
    )]
    ReferentialIntegrity {
        from_table: String,
        from_column: String,
        to_table: String,
        to_column: String,
        value: Value,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AggregateOp {
    Sum,
    /// Number of non-blank values in the column.
    Count,
    /// Number of rows; the column is ignored.
    CountRows,
    Average,
    Min,
    Max,
    DistinctCount,
}

impl AggregateOp {
    pub fn requires_column(self) -> bool {
        !matches!(self, AggregateOp::CountRows)
    }
}

/// Column layout shared by every [`Row`] produced from one table.
#[derive(Debug)]
pub struct RowSchema {
    columns: Vec<String>,
    column_index: HashMap<String, usize>,
}

impl RowSchema {
    pub fn new(columns: Vec<String>) -> Self {
        let column_index = columns
            .iter()
            .enumerate()
            .map(|(idx, c)| (c.clone(), idx))
            .collect();
        Self {
            columns,
            column_index,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.column_index.get(column).copied()
    }
}

#[derive(Clone, Debug)]
pub struct Row {
    schema: Arc<RowSchema>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(schema: Arc<RowSchema>, values: Vec<Value>) -> Self {
        Self { schema, values }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        let idx = self.schema.column_index(column)?;
        self.values.get(idx)
    }

    pub fn columns(&self) -> &[String] {
        self.schema.columns()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// A lazy scan over the rows of one table. Calling [`Store::rows`] again restarts the scan.
pub type RowIter<'a> = Box<dyn Iterator<Item = StoreResult<Row>> + 'a>;

/// Data access capability consumed by the evaluator.
///
/// Every query is scoped to one table and narrowed by a [`Predicate`] over that table's columns;
/// the engine has already projected dimension restrictions through relationships by the time it
/// calls the store. Implementations own storage, indexing and retries. Errors are reported to the
/// caller of `evaluate` unchanged.
pub trait Store: fmt::Debug + Send + Sync {
    /// Aggregate `column` over the rows matching `predicate`.
    ///
    /// Returns a number, or BLANK when the aggregate has no non-blank input (counts return `0`).
    fn aggregate(
        &self,
        table: &str,
        op: AggregateOp,
        column: Option<&str>,
        predicate: &Predicate,
    ) -> StoreResult<Value>;

    fn distinct_values(
        &self,
        table: &str,
        column: &str,
        predicate: &Predicate,
    ) -> StoreResult<BTreeSet<Value>>;

    fn rows(&self, table: &str, predicate: Predicate) -> StoreResult<RowIter<'_>>;

    /// Check that every non-blank `from_table[from_column]` value exists in `to_table[to_column]`.
    fn check_referential_integrity(
        &self,
        from_table: &str,
        from_column: &str,
        to_table: &str,
        to_column: &str,
    ) -> StoreResult<()> {
        let keys = self.distinct_values(to_table, to_column, &Predicate::True)?;
        let dangling = self
            .distinct_values(from_table, from_column, &Predicate::True)?
            .into_iter()
            .find(|value| !value.is_blank() && !keys.contains(value));
        match dangling {
            Some(value) => Err(StoreError::ReferentialIntegrity {
                from_table: from_table.to_string(),
                from_column: from_column.to_string(),
                to_table: to_table.to_string(),
                to_column: to_column.to_string(),
                value,
            }),
            None => Ok(()),
        }
    }
}

/// A named, row-oriented table held by [`InMemoryStore`].
#[derive(Clone, Debug)]
pub struct Table {
    name: String,
    schema: Arc<RowSchema>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<impl Into<String>>) -> Self {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        Self {
            name: name.into(),
            schema: Arc::new(RowSchema::new(columns)),
            rows: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[String] {
        self.schema.columns()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> StoreResult<()> {
        if row.len() != self.schema.columns().len() {
            return Err(StoreError::SchemaMismatch {
                table: self.name.clone(),
                expected: self.schema.columns().len(),
                actual: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.schema.column_index(column)?;
        self.rows.get(row)?.get(idx)
    }

    fn column_idx(&self, column: &str) -> StoreResult<usize> {
        self.schema
            .column_index(column)
            .ok_or_else(|| StoreError::UnknownColumn {
                table: self.name.clone(),
                column: column.to_string(),
            })
    }

    fn check_predicate(&self, predicate: &Predicate) -> StoreResult<()> {
        for column in predicate.columns() {
            self.column_idx(column)?;
        }
        Ok(())
    }

    fn matching_rows<'a>(
        &'a self,
        predicate: &'a Predicate,
    ) -> impl Iterator<Item = &'a Vec<Value>> + 'a {
        let schema = &self.schema;
        self.rows.iter().filter(move |row| {
            let lookup = |column: &str| {
                schema
                    .column_index(column)
                    .and_then(|idx| row.get(idx))
                    .cloned()
                    .unwrap_or(Value::Blank)
            };
            predicate.matches(&lookup)
        })
    }
}

/// Scan-based reference [`Store`] over row-oriented tables.
///
/// Every query is a full table scan; it exists so models can be exercised without an external
/// storage engine.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    tables: HashMap<String, Table>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, table: Table) -> StoreResult<()> {
        if self.tables.contains_key(table.name()) {
            return Err(StoreError::DuplicateTable(table.name().to_string()));
        }
        self.tables.insert(table.name().to_string(), table);
        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    fn table_ref(&self, name: &str) -> StoreResult<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
    }
}

impl Store for InMemoryStore {
    fn aggregate(
        &self,
        table: &str,
        op: AggregateOp,
        column: Option<&str>,
        predicate: &Predicate,
    ) -> StoreResult<Value> {
        let table_ref = self.table_ref(table)?;
        table_ref.check_predicate(predicate)?;

        if op == AggregateOp::CountRows {
            let count = table_ref.matching_rows(predicate).count();
            return Ok(Value::from(count as i64));
        }

        let column = column.ok_or_else(|| StoreError::MissingColumn {
            table: table.to_string(),
            op,
        })?;
        let idx = table_ref.column_idx(column)?;
        let values = table_ref
            .matching_rows(predicate)
            .map(|row| &row[idx])
            .filter(|v| !v.is_blank());

        match op {
            AggregateOp::Count | AggregateOp::CountRows => Ok(Value::from(values.count() as i64)),
            AggregateOp::DistinctCount => {
                let distinct: BTreeSet<&Value> = values.collect();
                Ok(Value::from(distinct.len() as i64))
            }
            AggregateOp::Min => Ok(values.min().cloned().unwrap_or(Value::Blank)),
            AggregateOp::Max => Ok(values.max().cloned().unwrap_or(Value::Blank)),
            AggregateOp::Sum | AggregateOp::Average => {
                let mut sum = 0.0;
                let mut count = 0usize;
                for value in values {
                    let n = match value {
                        Value::Number(n) => n.0,
                        // Boolean flags sum as 0/1 so `SUM(Crimes[Arrest])` counts arrests.
                        Value::Boolean(b) => f64::from(u8::from(*b)),
                        other => {
                            return Err(StoreError::NonNumeric {
                                table: table.to_string(),
                                column: column.to_string(),
                                value: other.clone(),
                            })
                        }
                    };
                    sum += n;
                    count += 1;
                }
                if count == 0 {
                    Ok(Value::Blank)
                } else if op == AggregateOp::Sum {
                    Ok(Value::from(sum))
                } else {
                    Ok(Value::from(sum / count as f64))
                }
            }
        }
    }

    fn distinct_values(
        &self,
        table: &str,
        column: &str,
        predicate: &Predicate,
    ) -> StoreResult<BTreeSet<Value>> {
        let table_ref = self.table_ref(table)?;
        table_ref.check_predicate(predicate)?;
        let idx = table_ref.column_idx(column)?;
        Ok(table_ref
            .matching_rows(predicate)
            .map(|row| row[idx].clone())
            .collect())
    }

    fn rows(&self, table: &str, predicate: Predicate) -> StoreResult<RowIter<'_>> {
        let table_ref = self.table_ref(table)?;
        table_ref.check_predicate(&predicate)?;
        let schema = Arc::clone(&table_ref.schema);
        let iter = table_ref.rows.iter().filter_map(move |row| {
            let lookup = |column: &str| {
                schema
                    .column_index(column)
                    .and_then(|idx| row.get(idx))
                    .cloned()
                    .unwrap_or(Value::Blank)
            };
            predicate
                .matches(&lookup)
                .then(|| Ok(Row::new(Arc::clone(&schema), row.clone())))
        });
        Ok(Box::new(iter))
    }
}
