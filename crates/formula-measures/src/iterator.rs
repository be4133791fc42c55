//! Row iteration for `SUMX`-style reductions, `RANKX` and `FILTER` table arguments.
//!
//! A [`TableScan`] describes which rows of a table an argument yields; opening it starts a fresh
//! store scan, so the same scan can be walked any number of times. Each yielded dimension row is
//! pinned: the row's key replaces every restriction on its table, and the row is pushed onto the
//! row context. Fact rows are only pushed onto the row context.

use crate::context::FilterContext;
use crate::engine::{coerce_number, truthy, Evaluator, RowContext, VarEnv};
use crate::error::{MeasureError, MeasureResult};
use crate::expr::{Expr, IterateKind, RankOrder, RankTies, TableExpr};
use crate::predicate::Predicate;
use crate::store::{Row, RowIter};
use crate::time_intel;
use crate::value::{compare_values, Value};
use std::cmp::Ordering;

/// The resolved rows of a table argument, ready to be opened.
#[derive(Clone, Debug)]
pub(crate) struct TableScan<'a> {
    table: String,
    /// Key column used to pin rows. `None` for fact tables.
    key: Option<String>,
    /// Store-side selection of candidate rows.
    predicate: Predicate,
    /// Context the yielded rows are pinned into.
    filter: FilterContext,
    /// Row-level conditions from `FILTER`, evaluated with each row pinned.
    conditions: Vec<&'a Expr>,
}

pub(crate) struct ScanItem {
    pub row: Row,
    pub value: Value,
}

impl<'a> TableScan<'a> {
    pub(crate) fn resolve(
        evaluator: &Evaluator<'a>,
        table: &'a TableExpr,
        filter: &FilterContext,
    ) -> MeasureResult<Self> {
        match table {
            TableExpr::Table(name) => Self::over(evaluator, name, filter, filter),
            TableExpr::All(name) => {
                Self::over(evaluator, name, &filter.clear_all(&[name.as_str()]), filter)
            }
            TableExpr::Filter { source, predicate } => {
                let mut scan = Self::resolve(evaluator, source, filter)?;
                scan.conditions.push(&**predicate);
                Ok(scan)
            }
            TableExpr::Period(function) => {
                let catalog = evaluator.model().catalog();
                let date_table = catalog.date_table()?;
                let dates =
                    time_intel::period_dates(evaluator, *function, filter)?.unwrap_or_default();
                Ok(Self {
                    table: date_table.table.clone(),
                    key: Some(catalog.key_column(&date_table.table)?.to_string()),
                    predicate: Predicate::in_values(
                        date_table.column.as_str(),
                        dates.into_iter().map(Value::from),
                    ),
                    filter: filter.clone(),
                    conditions: Vec::new(),
                })
            }
        }
    }

    fn over(
        evaluator: &Evaluator<'a>,
        table: &str,
        candidates: &FilterContext,
        filter: &FilterContext,
    ) -> MeasureResult<Self> {
        let schema = evaluator.model().catalog().table(table)?;
        Ok(Self {
            table: table.to_string(),
            key: schema.key.clone(),
            predicate: evaluator.eligibility(table, candidates)?,
            filter: filter.clone(),
            conditions: Vec::new(),
        })
    }

    pub(crate) fn table(&self) -> &str {
        &self.table
    }

    /// The table and key column this scan's rows are identified by.
    pub(crate) fn key_column(&self) -> MeasureResult<(String, String)> {
        match &self.key {
            Some(key) => Ok((self.table.clone(), key.clone())),
            None => Err(MeasureError::FactTableFilter {
                table: self.table.clone(),
            }),
        }
    }

    /// Start a scan. When `project` is set, each yielded item carries that expression evaluated
    /// with the row pinned.
    pub(crate) fn open<'e>(
        &self,
        evaluator: &'e mut Evaluator<'a>,
        env: &'e mut VarEnv<'a>,
        row_ctx: &RowContext,
        project: Option<&'a Expr>,
    ) -> MeasureResult<ScanIter<'e, 'a>> {
        let store = evaluator.model().store();
        let rows = store.rows(&self.table, self.predicate.clone())?;
        Ok(ScanIter {
            evaluator,
            env,
            rows,
            scan: self.clone(),
            row_ctx: row_ctx.clone(),
            project,
        })
    }
}

pub(crate) struct ScanIter<'e, 'a> {
    evaluator: &'e mut Evaluator<'a>,
    env: &'e mut VarEnv<'a>,
    rows: RowIter<'a>,
    scan: TableScan<'a>,
    row_ctx: RowContext,
    project: Option<&'a Expr>,
}

impl<'a> ScanIter<'_, 'a> {
    fn pin(&self, row: &Row) -> (FilterContext, RowContext) {
        let table = self.scan.table.as_str();
        let filter = match &self.scan.key {
            Some(key) => {
                let value = row.get(key).cloned().unwrap_or(Value::Blank);
                self.scan
                    .filter
                    .clear_all(&[table])
                    .restrict(table, Predicate::equals(key.as_str(), value))
            }
            None => self.scan.filter.clone(),
        };
        (filter, self.row_ctx.with_row(table, row.clone()))
    }

    fn next_item(&mut self) -> MeasureResult<Option<ScanItem>> {
        'rows: while let Some(row) = self.rows.next() {
            let row = row?;
            let (filter, row_ctx) = self.pin(&row);
            for condition in &self.scan.conditions {
                let keep = self
                    .evaluator
                    .eval_scalar(*condition, &filter, &row_ctx, self.env)?;
                if !truthy(&keep)? {
                    continue 'rows;
                }
            }
            let value = match self.project {
                Some(expr) => self
                    .evaluator
                    .eval_scalar(expr, &filter, &row_ctx, self.env)?,
                None => Value::Blank,
            };
            return Ok(Some(ScanItem { row, value }));
        }
        Ok(None)
    }
}

impl Iterator for ScanIter<'_, '_> {
    type Item = MeasureResult<ScanItem>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_item().transpose()
    }
}

/// `SUMX`/`AVERAGEX`/`MINX`/`MAXX`/`COUNTX`: evaluate `expr` once per row and reduce the non-blank
/// results.
pub(crate) fn iterate<'a>(
    evaluator: &mut Evaluator<'a>,
    kind: IterateKind,
    table: &'a TableExpr,
    expr: &'a Expr,
    filter: &FilterContext,
    row_ctx: &RowContext,
    env: &mut VarEnv<'a>,
) -> MeasureResult<Value> {
    let scan = TableScan::resolve(evaluator, table, filter)?;
    let mut values = Vec::new();
    for item in scan.open(evaluator, env, row_ctx, Some(expr))? {
        let item = item?;
        if !item.value.is_blank() {
            values.push(item.value);
        }
    }
    log::trace!("{kind:?} over {} rows of {}", values.len(), scan.table());
    reduce(kind, values)
}

fn reduce(kind: IterateKind, values: Vec<Value>) -> MeasureResult<Value> {
    match kind {
        IterateKind::Count => Ok(Value::from(values.len() as i64)),
        IterateKind::Sum | IterateKind::Average => {
            if values.is_empty() {
                return Ok(Value::Blank);
            }
            let mut sum = 0.0;
            for value in &values {
                sum += coerce_number(value)?;
            }
            if kind == IterateKind::Sum {
                Ok(Value::from(sum))
            } else {
                Ok(Value::from(sum / values.len() as f64))
            }
        }
        IterateKind::Min | IterateKind::Max => {
            let mut best: Option<Value> = None;
            for value in values {
                let replace = match &best {
                    None => true,
                    Some(current) => {
                        let ord = compare_values(&value, current).ok_or_else(|| {
                            MeasureError::Type(format!("cannot compare {value} and {current}"))
                        })?;
                        if kind == IterateKind::Min {
                            ord == Ordering::Less
                        } else {
                            ord == Ordering::Greater
                        }
                    }
                };
                if replace {
                    best = Some(value);
                }
            }
            Ok(best.unwrap_or(Value::Blank))
        }
    }
}

/// `RANKX`: rank the current context's value of `expr` among the values of `expr` for every row of
/// `table`, evaluated with the table's own restrictions removed.
///
/// Rows whose value is BLANK are left out of the group; a BLANK current value ranks BLANK.
#[allow(clippy::too_many_arguments)]
pub(crate) fn rank<'a>(
    evaluator: &mut Evaluator<'a>,
    table: &'a TableExpr,
    expr: &'a Expr,
    order: RankOrder,
    ties: RankTies,
    filter: &FilterContext,
    row_ctx: &RowContext,
    env: &mut VarEnv<'a>,
) -> MeasureResult<Value> {
    let current = evaluator.eval_scalar(expr, filter, row_ctx, env)?;
    if current.is_blank() {
        return Ok(Value::Blank);
    }
    let current = coerce_number(&current)?;

    let group_filter = match table.base_table(None) {
        Some(base) => filter.clear_all(&[base]),
        None => filter.clone(),
    };
    let scan = TableScan::resolve(evaluator, table, &group_filter)?;
    let mut group = Vec::new();
    for item in scan.open(evaluator, env, row_ctx, Some(expr))? {
        let item = item?;
        if !item.value.is_blank() {
            group.push(coerce_number(&item.value)?);
        }
    }

    let better = |v: f64| match order {
        RankOrder::Descending => v > current,
        RankOrder::Ascending => v < current,
    };
    let ahead = match ties {
        RankTies::Skip => group.iter().filter(|v| better(**v)).count(),
        RankTies::Dense => {
            let mut distinct: Vec<f64> = group.into_iter().filter(|v| better(*v)).collect();
            distinct.sort_by(f64::total_cmp);
            distinct.dedup();
            distinct.len()
        }
    };
    Ok(Value::from((ahead + 1) as i64))
}
