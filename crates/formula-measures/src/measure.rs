use crate::catalog::{Catalog, TableRole};
use crate::error::{MeasureError, MeasureResult};
use crate::expr::{Expr, FilterModifier, RelationshipRef, TableExpr};
use crate::predicate::Predicate;
use std::collections::{BTreeSet, HashMap, HashSet};

/// A registered measure. Never mutated after registration.
#[derive(Clone, Debug, PartialEq)]
pub struct Measure {
    pub name: String,
    /// Source text when the measure was registered from a formula.
    pub expression: Option<String>,
    pub expr: Expr,
    /// Normalized names of the measures this one references directly.
    pub dependencies: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MeasureDefinition {
    pub name: String,
    pub expr: Expr,
    pub expression: Option<String>,
}

impl MeasureDefinition {
    pub fn new(name: impl Into<String>, expr: Expr) -> Self {
        Self {
            name: name.into(),
            expr,
            expression: None,
        }
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }
}

/// Measures by normalized name, plus the static checks run before a measure is accepted.
#[derive(Clone, Debug, Default)]
pub struct MeasureRegistry {
    measures: HashMap<String, Measure>,
}

/// Measure names are matched case-insensitively and may be written with or without brackets.
pub fn normalize_measure_name(name: &str) -> String {
    let trimmed = name.trim();
    trimmed
        .strip_prefix('[')
        .and_then(|n| n.strip_suffix(']'))
        .unwrap_or(trimmed)
        .trim()
        .to_uppercase()
}

impl MeasureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Measure> {
        self.measures.get(&normalize_measure_name(name))
    }

    pub fn len(&self) -> usize {
        self.measures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measures.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.measures.values().map(|m| m.name.as_str())
    }

    /// Register a group of measures atomically.
    ///
    /// Measures in the same batch may reference each other. Either every definition is accepted or
    /// none is.
    pub fn register_batch(
        &mut self,
        catalog: &Catalog,
        definitions: Vec<MeasureDefinition>,
    ) -> MeasureResult<()> {
        let mut staged: HashMap<String, Measure> = HashMap::new();
        let mut order = Vec::new();
        for def in definitions {
            let key = normalize_measure_name(&def.name);
            if self.measures.contains_key(&key) || staged.contains_key(&key) {
                return Err(MeasureError::DuplicateMeasure { measure: def.name });
            }
            validate_expr(catalog, &def.name, &def.expr)?;
            let dependencies = def
                .expr
                .referenced_measures()
                .into_iter()
                .map(normalize_measure_name)
                .collect();
            order.push(key.clone());
            staged.insert(
                key,
                Measure {
                    name: def.name,
                    expression: def.expression,
                    expr: def.expr,
                    dependencies,
                },
            );
        }

        for key in &order {
            let measure = &staged[key];
            for dep in &measure.dependencies {
                if !self.measures.contains_key(dep) && !staged.contains_key(dep) {
                    return Err(MeasureError::UnknownMeasureReference {
                        measure: measure.name.clone(),
                        reference: dep_display_name(&measure.expr, dep),
                    });
                }
            }
        }

        let lookup = |key: &str| staged.get(key).or_else(|| self.measures.get(key));
        if let Some(cycle) = find_cycle(&order, &lookup) {
            return Err(MeasureError::CyclicMeasure { cycle });
        }

        for key in order {
            if let Some(measure) = staged.remove(&key) {
                log::debug!(
                    "registered measure [{}] ({} dependencies)",
                    measure.name,
                    measure.dependencies.len()
                );
                self.measures.insert(key, measure);
            }
        }
        Ok(())
    }

    /// Check an ad-hoc expression against the catalog and the registered measures.
    pub fn validate_adhoc(&self, catalog: &Catalog, expr: &Expr) -> MeasureResult<()> {
        validate_expr(catalog, "<expression>", expr)?;
        for reference in expr.referenced_measures() {
            if self.get(reference).is_none() {
                return Err(MeasureError::UnknownMeasure(reference.to_string()));
            }
        }
        Ok(())
    }
}

fn dep_display_name(expr: &Expr, key: &str) -> String {
    expr.referenced_measures()
        .into_iter()
        .find(|name| normalize_measure_name(name) == key)
        .map(|name| name.trim().trim_start_matches('[').trim_end_matches(']').to_string())
        .unwrap_or_else(|| key.to_string())
}

/// DFS over measure references starting from `roots`. Returns the first cycle found as a list of
/// measure names that starts and ends with the same measure.
fn find_cycle<'a>(
    roots: &[String],
    lookup: &dyn Fn(&str) -> Option<&'a Measure>,
) -> Option<Vec<String>> {
    fn visit<'a>(
        key: &str,
        lookup: &dyn Fn(&str) -> Option<&'a Measure>,
        done: &mut HashSet<String>,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = stack.iter().position(|k| k == key) {
            let mut cycle: Vec<String> = stack[pos..]
                .iter()
                .map(|k| lookup(k).map_or_else(|| k.clone(), |m| m.name.clone()))
                .collect();
            cycle.push(lookup(key).map_or_else(|| key.to_string(), |m| m.name.clone()));
            return Some(cycle);
        }
        if done.contains(key) {
            return None;
        }
        let measure = lookup(key)?;
        stack.push(key.to_string());
        for dep in &measure.dependencies {
            if let Some(cycle) = visit(dep, lookup, done, stack) {
                return Some(cycle);
            }
        }
        stack.pop();
        done.insert(key.to_string());
        None
    }

    let mut done = HashSet::new();
    for root in roots {
        let mut stack = Vec::new();
        if let Some(cycle) = visit(root, lookup, &mut done, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

/// Static checks shared by measure registration and ad-hoc evaluation: every table, column,
/// variable and relationship must resolve, conditionals need a default branch, and no table the
/// expression aggregates may have an ambiguous join to a dimension.
pub(crate) fn validate_expr(catalog: &Catalog, measure: &str, expr: &Expr) -> MeasureResult<()> {
    let mut validator = Validator {
        catalog,
        measure,
        scope: Vec::new(),
        aggregated: BTreeSet::new(),
        hints: BTreeSet::new(),
    };
    validator.check(expr)?;

    let dimensions: Vec<&str> = catalog
        .tables()
        .filter(|t| t.role == TableRole::Dimension)
        .map(|t| t.name.as_str())
        .collect();
    for table in &validator.aggregated {
        for dimension in &dimensions {
            // Unconnected tables are fine; only ambiguity is fatal.
            catalog.resolve_path_with_hints(table, dimension, &validator.hints)?;
        }
    }
    Ok(())
}

struct Validator<'a> {
    catalog: &'a Catalog,
    measure: &'a str,
    scope: Vec<String>,
    aggregated: BTreeSet<String>,
    hints: BTreeSet<String>,
}

impl Validator<'_> {
    fn check(&mut self, expr: &Expr) -> MeasureResult<()> {
        match expr {
            Expr::Literal(_) | Expr::MeasureRef(_) => Ok(()),
            Expr::ColumnRef { table, column } => self.catalog.lookup_column(table, column),
            Expr::SelectedValue {
                table,
                column,
                alternate,
            } => {
                self.catalog.lookup_column(table, column)?;
                if let Some(alternate) = alternate {
                    self.check(alternate)?;
                }
                Ok(())
            }
            Expr::Aggregate {
                op,
                table,
                column,
                predicate,
            } => {
                self.catalog.table(table)?;
                match column {
                    Some(column) => self.catalog.lookup_column(table, column)?,
                    None if op.requires_column() => {
                        return Err(MeasureError::Type(format!(
                            "{op:?} over {table} requires a column"
                        )))
                    }
                    None => {}
                }
                if let Some(predicate) = predicate {
                    self.check_predicate(table, predicate)?;
                }
                self.aggregated.insert(table.clone());
                Ok(())
            }
            Expr::Var(name) => {
                if self.scope.iter().any(|v| v == name) {
                    Ok(())
                } else {
                    Err(MeasureError::UnknownVariable(name.clone()))
                }
            }
            Expr::Let { bindings, body } => {
                let depth = self.scope.len();
                for (name, value) in bindings {
                    self.check(value)?;
                    self.scope.push(name.clone());
                }
                let result = self.check(body);
                self.scope.truncate(depth);
                result
            }
            Expr::Conditional { branches, default } => {
                let Some(default) = default else {
                    return Err(MeasureError::MissingDefaultBranch {
                        measure: self.measure.to_string(),
                    });
                };
                for (cond, value) in branches {
                    self.check(cond)?;
                    self.check(value)?;
                }
                self.check(default)
            }
            Expr::Unary { expr, .. } => self.check(expr),
            Expr::Binary { left, right, .. } => {
                self.check(left)?;
                self.check(right)
            }
            Expr::SafeDivide {
                numerator,
                denominator,
                default,
            } => {
                self.check(numerator)?;
                self.check(denominator)?;
                self.check(default)
            }
            Expr::Calculate { expr, modifiers } => {
                for modifier in modifiers {
                    self.check_modifier(modifier)?;
                }
                self.check(expr)
            }
            Expr::Iterate { table, expr, .. } => {
                self.check_table(table)?;
                if let Some(base) = self.base_table(table)? {
                    if self.catalog.table(&base)?.is_fact() {
                        self.aggregated.insert(base);
                    }
                }
                self.check(expr)
            }
            Expr::Rank { table, expr, .. } => {
                self.check_table(table)?;
                if let Some(base) = self.base_table(table)? {
                    if self.catalog.table(&base)?.is_fact() {
                        return Err(MeasureError::Type(format!(
                            "RANKX needs a dimension table, {base} is a fact table"
                        )));
                    }
                }
                self.check(expr)
            }
        }
    }

    fn check_predicate(&self, table: &str, predicate: &Predicate) -> MeasureResult<()> {
        for column in predicate.columns() {
            self.catalog.lookup_column(table, column)?;
        }
        Ok(())
    }

    fn base_table(&self, table: &TableExpr) -> MeasureResult<Option<String>> {
        let date_table = match table {
            TableExpr::Period(_) => Some(self.catalog.date_table()?.table.as_str()),
            _ => None,
        };
        Ok(table.base_table(date_table).map(String::from))
    }

    fn check_table(&mut self, table: &TableExpr) -> MeasureResult<()> {
        match table {
            TableExpr::Table(name) | TableExpr::All(name) => self.catalog.table(name).map(|_| ()),
            TableExpr::Filter { source, predicate } => {
                self.check_table(source)?;
                self.check(predicate)
            }
            TableExpr::Period(_) => self.catalog.date_table().map(|_| ()),
        }
    }

    fn check_modifier(&mut self, modifier: &FilterModifier) -> MeasureResult<()> {
        match modifier {
            FilterModifier::Override { table, predicate }
            | FilterModifier::Restrict { table, predicate } => {
                self.check_predicate(table, predicate)
            }
            FilterModifier::All(tables) => {
                for table in tables {
                    self.catalog.table(table)?;
                }
                Ok(())
            }
            FilterModifier::AllColumns { table, columns } => {
                for column in columns {
                    self.catalog.lookup_column(table, column)?;
                }
                Ok(())
            }
            FilterModifier::AllExcept { table, keep } => {
                for column in keep {
                    self.catalog.lookup_column(table, column)?;
                }
                Ok(())
            }
            FilterModifier::Table(table) => {
                self.check_table(table)?;
                if let Some(base) = self.base_table(table)? {
                    self.catalog.key_column(&base)?;
                }
                Ok(())
            }
            FilterModifier::Period(_) => self.catalog.date_table().map(|_| ()),
            FilterModifier::UseRelationship(reference) => {
                let name = resolve_relationship(self.catalog, reference)?;
                self.hints.insert(name);
                Ok(())
            }
        }
    }
}

pub(crate) fn resolve_relationship(
    catalog: &Catalog,
    reference: &RelationshipRef,
) -> MeasureResult<String> {
    match reference {
        RelationshipRef::Named(name) => catalog
            .relationship(name)
            .map(|r| r.name.clone())
            .ok_or_else(|| MeasureError::UnknownRelationship(name.clone())),
        RelationshipRef::Columns {
            left_table,
            left_column,
            right_table,
            right_column,
        } => catalog
            .find_relationship_by_columns(
                (left_table.as_str(), left_column.as_str()),
                (right_table.as_str(), right_column.as_str()),
            )
            .map(|r| r.name.clone()),
    }
}
