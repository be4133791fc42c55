use crate::cache::{CacheStats, EvaluationCache};
use crate::context::FilterContext;
use crate::error::{MeasureError, MeasureResult};
use crate::expr::{BinaryOp, Expr, FilterModifier, UnaryOp};
use crate::iterator::{self, TableScan};
use crate::measure::{normalize_measure_name, resolve_relationship};
use crate::model::DataModel;
use crate::predicate::{CompareOp, Predicate};
use crate::store::{AggregateOp, Row};
use crate::time_intel;
use crate::value::{compare_values, Value};
use std::collections::BTreeSet;

/// The rows of enclosing iterators, innermost last.
#[derive(Clone, Debug, Default)]
pub struct RowContext {
    stack: Vec<RowFrame>,
}

#[derive(Clone, Debug)]
struct RowFrame {
    table: String,
    row: Row,
}

impl RowContext {
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// A copy of this context with `row` of `table` as the innermost frame.
    pub fn with_row(&self, table: &str, row: Row) -> Self {
        let mut out = self.clone();
        out.stack.push(RowFrame {
            table: table.to_string(),
            row,
        });
        out
    }

    /// The value of `table[column]` in the innermost row of `table`.
    pub fn value(&self, table: &str, column: &str) -> Option<Value> {
        self.stack
            .iter()
            .rev()
            .find(|frame| frame.table == table)
            .and_then(|frame| frame.row.get(column).cloned())
    }

    fn has_table(&self, table: &str) -> bool {
        self.stack.iter().any(|frame| frame.table == table)
    }
}

#[derive(Debug)]
struct VarSlot<'a> {
    name: &'a str,
    expr: &'a Expr,
    filter: FilterContext,
    row_ctx: RowContext,
    value: Option<Value>,
}

/// `VAR` bindings in scope. A binding captures the context it was defined in and is evaluated on
/// first reference only.
#[derive(Debug, Default)]
pub(crate) struct VarEnv<'a> {
    slots: Vec<VarSlot<'a>>,
}

/// Evaluates expressions for one query. Owns the query's [`EvaluationCache`].
#[derive(Debug)]
pub struct Evaluator<'a> {
    model: &'a DataModel,
    cache: EvaluationCache,
}

impl<'a> Evaluator<'a> {
    pub fn new(model: &'a DataModel) -> Self {
        Self {
            model,
            cache: EvaluationCache::new(),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub(crate) fn model(&self) -> &'a DataModel {
        self.model
    }

    pub fn evaluate_measure(&mut self, name: &str, filter: &FilterContext) -> MeasureResult<Value> {
        let model = self.model;
        let measure = model
            .measure(name)
            .ok_or_else(|| MeasureError::UnknownMeasure(name.to_string()))?;
        let key = normalize_measure_name(&measure.name);
        let use_cache = model.settings().cache_measures;

        let fingerprint = filter.fingerprint();
        if use_cache {
            if let Some(value) = self.cache.get(&key, &fingerprint) {
                return Ok(value);
            }
        }

        let mut env = VarEnv::default();
        let value = self.eval_scalar(&measure.expr, filter, &RowContext::default(), &mut env)?;
        if use_cache {
            self.cache.insert(&key, fingerprint, value.clone());
        }
        Ok(value)
    }

    pub fn evaluate_expr(&mut self, expr: &'a Expr, filter: &FilterContext) -> MeasureResult<Value> {
        let mut env = VarEnv::default();
        self.eval_scalar(expr, filter, &RowContext::default(), &mut env)
    }

    pub(crate) fn eval_scalar(
        &mut self,
        expr: &'a Expr,
        filter: &FilterContext,
        row_ctx: &RowContext,
        env: &mut VarEnv<'a>,
    ) -> MeasureResult<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::ColumnRef { table, column } => {
                if !row_ctx.has_table(table) {
                    return Err(MeasureError::Type(format!(
                        "no row context for {table}[{column}]"
                    )));
                }
                Ok(row_ctx.value(table, column).unwrap_or(Value::Blank))
            }
            Expr::MeasureRef(name) => self.evaluate_measure(name, filter),
            Expr::Aggregate {
                op,
                table,
                column,
                predicate,
            } => self.eval_aggregate(*op, table, column.as_deref(), predicate.as_ref(), filter),
            Expr::Var(name) => self.eval_var(name, env),
            Expr::Let { bindings, body } => {
                let depth = env.slots.len();
                for (name, binding) in bindings {
                    env.slots.push(VarSlot {
                        name: name.as_str(),
                        expr: binding,
                        filter: filter.clone(),
                        row_ctx: row_ctx.clone(),
                        value: None,
                    });
                }
                let result = self.eval_scalar(body, filter, row_ctx, env);
                env.slots.truncate(depth);
                result
            }
            Expr::Conditional { branches, default } => {
                for (cond, value) in branches {
                    let test = self.eval_scalar(cond, filter, row_ctx, env)?;
                    if truthy(&test)? {
                        return self.eval_scalar(value, filter, row_ctx, env);
                    }
                }
                match default {
                    Some(default) => self.eval_scalar(default, filter, row_ctx, env),
                    None => Err(MeasureError::MissingDefaultBranch {
                        measure: "<expression>".into(),
                    }),
                }
            }
            Expr::Unary { op, expr } => {
                let value = self.eval_scalar(expr, filter, row_ctx, env)?;
                eval_unary(*op, value)
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval_scalar(left, filter, row_ctx, env)?;
                let right = self.eval_scalar(right, filter, row_ctx, env)?;
                eval_binary(*op, left, right)
            }
            Expr::SafeDivide {
                numerator,
                denominator,
                default,
            } => {
                let numerator = self.eval_scalar(numerator, filter, row_ctx, env)?;
                let denominator = self.eval_scalar(denominator, filter, row_ctx, env)?;
                let d = match &denominator {
                    Value::Blank => None,
                    other => Some(coerce_number(other)?).filter(|d| *d != 0.0),
                };
                let Some(d) = d else {
                    return self.eval_scalar(default, filter, row_ctx, env);
                };
                if numerator.is_blank() {
                    return Ok(Value::Blank);
                }
                Ok(Value::from(coerce_number(&numerator)? / d))
            }
            Expr::Calculate { expr, modifiers } => {
                match self.apply_modifiers(modifiers, filter, row_ctx, env)? {
                    Some(derived) => self.eval_scalar(expr, &derived, row_ctx, env),
                    None => Ok(Value::Blank),
                }
            }
            Expr::Iterate { kind, table, expr } => {
                iterator::iterate(self, *kind, table, expr, filter, row_ctx, env)
            }
            Expr::Rank {
                table,
                expr,
                order,
                ties,
            } => iterator::rank(self, table, expr, *order, *ties, filter, row_ctx, env),
            Expr::SelectedValue {
                table,
                column,
                alternate,
            } => {
                let predicate = self.eligibility(table, filter)?;
                let values = self
                    .model
                    .store()
                    .distinct_values(table, column, &predicate)?;
                if values.len() == 1 {
                    if let Some(value) = values.into_iter().next() {
                        return Ok(value);
                    }
                }
                match alternate {
                    Some(alternate) => self.eval_scalar(alternate, filter, row_ctx, env),
                    None => Ok(Value::Blank),
                }
            }
        }
    }

    fn eval_aggregate(
        &mut self,
        op: AggregateOp,
        table: &str,
        column: Option<&str>,
        predicate: Option<&Predicate>,
        filter: &FilterContext,
    ) -> MeasureResult<Value> {
        let mut eligible = self.eligibility(table, filter)?;
        if let Some(predicate) = predicate {
            eligible = eligible.and(predicate.clone());
        }
        log::trace!("aggregate {op:?} {table}[{}] where {eligible}", column.unwrap_or("*"));
        Ok(self
            .model
            .store()
            .aggregate(table, op, column, &eligible)?)
    }

    fn eval_var(&mut self, name: &str, env: &mut VarEnv<'a>) -> MeasureResult<Value> {
        let idx = env
            .slots
            .iter()
            .rposition(|slot| slot.name == name)
            .ok_or_else(|| MeasureError::UnknownVariable(name.to_string()))?;
        if let Some(value) = &env.slots[idx].value {
            return Ok(value.clone());
        }

        // The binding only sees the bindings defined before it.
        let mut tail = env.slots.split_off(idx);
        let result = {
            let slot = &tail[0];
            let (expr, filter, row_ctx) = (slot.expr, slot.filter.clone(), slot.row_ctx.clone());
            self.eval_scalar(expr, &filter, &row_ctx, env)
        };
        env.slots.append(&mut tail);
        let value = result?;
        env.slots[idx].value = Some(value.clone());
        Ok(value)
    }

    /// Apply `CALCULATE` filter arguments left to right.
    ///
    /// Relationship hints are applied first. Table and period arguments are computed against the
    /// incoming context (plus hints), not against the partially modified one. Returns `None` when a
    /// period argument has no as-of date, in which case the whole `CALCULATE` is BLANK.
    fn apply_modifiers(
        &mut self,
        modifiers: &'a [FilterModifier],
        filter: &FilterContext,
        row_ctx: &RowContext,
        env: &mut VarEnv<'a>,
    ) -> MeasureResult<Option<FilterContext>> {
        let model = self.model;
        let catalog = model.catalog();
        let mut base = filter.clone();
        for modifier in modifiers {
            if let FilterModifier::UseRelationship(reference) = modifier {
                base = base.use_relationship(resolve_relationship(catalog, reference)?);
            }
        }

        let mut resolved = Vec::with_capacity(modifiers.len());
        for modifier in modifiers {
            resolved.push(match modifier {
                FilterModifier::Table(table) => {
                    let scan = TableScan::resolve(self, table, &base)?;
                    let (table, column) = scan.key_column()?;
                    let mut keys = BTreeSet::new();
                    for item in scan.open(self, env, row_ctx, None)? {
                        if let Some(key) = item?.row.get(&column) {
                            keys.insert(key.clone());
                        }
                    }
                    Some((table, Predicate::In { column, values: keys }))
                }
                FilterModifier::Period(function) => {
                    let Some(dates) = time_intel::period_dates(self, *function, &base)? else {
                        return Ok(None);
                    };
                    let date_table = catalog.date_table()?;
                    Some((
                        date_table.table.clone(),
                        Predicate::in_values(
                            date_table.column.as_str(),
                            dates.into_iter().map(Value::from),
                        ),
                    ))
                }
                _ => None,
            });
        }

        let mut out = base;
        for (modifier, resolved) in modifiers.iter().zip(resolved) {
            out = match modifier {
                FilterModifier::Override { table, predicate } => {
                    self.ensure_filterable(table)?;
                    out.override_with(table, predicate.clone())
                }
                FilterModifier::Restrict { table, predicate } => {
                    self.ensure_filterable(table)?;
                    out.restrict(table, predicate.clone())
                }
                FilterModifier::All(tables) => {
                    let tables: Vec<&str> = tables.iter().map(String::as_str).collect();
                    out.clear_all(&tables)
                }
                FilterModifier::AllColumns { table, columns } => {
                    let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
                    out.clear_columns(table, &columns)
                }
                FilterModifier::AllExcept { table, keep } => {
                    let keep: Vec<&str> = keep.iter().map(String::as_str).collect();
                    out.clear_all_except(table, &keep)
                }
                FilterModifier::Table(_) => match resolved {
                    Some((table, predicate)) => out.override_with(&table, predicate),
                    None => out,
                },
                FilterModifier::Period(_) => match resolved {
                    Some((table, predicate)) => out.clear_all(&[table.as_str()]).restrict(&table, predicate),
                    None => out,
                },
                FilterModifier::UseRelationship(_) => out,
            };
        }
        Ok(Some(out))
    }

    fn ensure_filterable(&self, table: &str) -> MeasureResult<()> {
        if self.model.catalog().table(table)?.is_fact() {
            return Err(MeasureError::FactTableFilter {
                table: table.to_string(),
            });
        }
        Ok(())
    }

    /// The store predicate selecting the rows of `table` visible under `filter`.
    ///
    /// Restrictions on `table` itself apply directly. Restrictions on other tables are projected
    /// back along the resolved join path, hop by hop, as key sets. Restricted tables that `table`
    /// cannot reach do not filter it.
    pub(crate) fn eligibility(
        &self,
        table: &str,
        filter: &FilterContext,
    ) -> MeasureResult<Predicate> {
        let catalog = self.model.catalog();
        catalog.table(table)?;
        let mut parts = Vec::new();
        for restricted in filter.restricted_tables() {
            if catalog.table(restricted)?.is_fact() {
                return Err(MeasureError::FactTableFilter {
                    table: restricted.to_string(),
                });
            }
            let predicate = filter.table_predicate(restricted);
            if restricted == table {
                parts.push(predicate);
                continue;
            }
            match catalog.resolve_path_with_hints(table, restricted, filter.relationship_hints())? {
                Some(path) => {
                    let mut projected = predicate;
                    for step in path.steps.iter().rev() {
                        projected = self.project_step(
                            projected,
                            &step.to_table,
                            &step.to_column,
                            &step.from_column,
                        )?;
                    }
                    parts.push(projected);
                }
                None => {
                    log::trace!("{restricted} does not filter {table}: no relationship path");
                }
            }
        }
        Ok(Predicate::all(parts))
    }

    /// Turn a predicate over `to_table` into a predicate over the foreign key `from_column`.
    fn project_step(
        &self,
        predicate: Predicate,
        to_table: &str,
        to_column: &str,
        from_column: &str,
    ) -> MeasureResult<Predicate> {
        let columns = predicate.columns();
        if columns.len() == 1 && columns.contains(to_column) {
            return Ok(predicate.rename_column(to_column, from_column));
        }
        log::trace!("project {to_table} keys where {predicate}");
        let keys = self
            .model
            .store()
            .distinct_values(to_table, to_column, &predicate)?;
        Ok(Predicate::In {
            column: from_column.to_string(),
            values: keys,
        })
    }
}

pub(crate) fn truthy(value: &Value) -> MeasureResult<bool> {
    value
        .truthy()
        .ok_or_else(|| MeasureError::Type(format!("{value} is not a condition")))
}

pub(crate) fn coerce_number(value: &Value) -> MeasureResult<f64> {
    match value {
        Value::Number(n) => Ok(n.0),
        Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Blank => Ok(0.0),
        Value::Date(_) | Value::Text(_) => Err(MeasureError::Type(format!(
            "cannot coerce {value} to number"
        ))),
    }
}

fn eval_unary(op: UnaryOp, value: Value) -> MeasureResult<Value> {
    match op {
        UnaryOp::Negate if value.is_blank() => Ok(Value::Blank),
        UnaryOp::Negate => Ok(Value::from(-coerce_number(&value)?)),
        UnaryOp::Not => Ok(Value::from(!truthy(&value)?)),
        UnaryOp::IsBlank => Ok(Value::from(value.is_blank())),
    }
}

fn eval_binary(op: BinaryOp, left: Value, right: Value) -> MeasureResult<Value> {
    let compare = |cmp: CompareOp| -> MeasureResult<Value> {
        let ord = compare_values(&left, &right).ok_or_else(|| {
            MeasureError::Type(format!("cannot compare {left} and {right}"))
        })?;
        Ok(Value::from(cmp.test(ord)))
    };
    match op {
        BinaryOp::Add | BinaryOp::Subtract => {
            if left.is_blank() && right.is_blank() {
                return Ok(Value::Blank);
            }
            let (l, r) = (coerce_number(&left)?, coerce_number(&right)?);
            Ok(Value::from(if op == BinaryOp::Add { l + r } else { l - r }))
        }
        BinaryOp::Multiply => {
            if left.is_blank() || right.is_blank() {
                return Ok(Value::Blank);
            }
            Ok(Value::from(coerce_number(&left)? * coerce_number(&right)?))
        }
        BinaryOp::Divide => {
            let r = coerce_number(&right)?;
            if r == 0.0 {
                return Err(MeasureError::DivisionByZero);
            }
            if left.is_blank() {
                return Ok(Value::Blank);
            }
            Ok(Value::from(coerce_number(&left)? / r))
        }
        BinaryOp::Equals => compare(CompareOp::Equals),
        BinaryOp::NotEquals => compare(CompareOp::NotEquals),
        BinaryOp::Less => compare(CompareOp::Less),
        BinaryOp::LessEquals => compare(CompareOp::LessEquals),
        BinaryOp::Greater => compare(CompareOp::Greater),
        BinaryOp::GreaterEquals => compare(CompareOp::GreaterEquals),
        BinaryOp::And => Ok(Value::from(truthy(&left)? && truthy(&right)?)),
        BinaryOp::Or => Ok(Value::from(truthy(&left)? || truthy(&right)?)),
    }
}
