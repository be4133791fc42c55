use crate::cache::CacheStats;
use crate::catalog::{Catalog, Relationship, TableSchema};
use crate::config::{EngineSettings, ModelConfig};
use crate::context::FilterContext;
use crate::engine::Evaluator;
use crate::error::{MeasureError, MeasureResult};
use crate::expr::Expr;
use crate::measure::{Measure, MeasureDefinition, MeasureRegistry};
use crate::predicate::Predicate;
use crate::store::Store;
use crate::value::Value;
use std::sync::Arc;

/// A star-schema model: catalog, registered measures and the store they are evaluated against.
///
/// Registration takes `&mut self`; evaluation takes `&self`, so a fully built model can be shared
/// between threads and queried concurrently. Each query owns its own evaluation cache.
#[derive(Clone, Debug)]
pub struct DataModel {
    catalog: Catalog,
    measures: MeasureRegistry,
    store: Arc<dyn Store>,
    settings: EngineSettings,
}

impl DataModel {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            catalog: Catalog::new(),
            measures: MeasureRegistry::new(),
            store,
            settings: EngineSettings::default(),
        }
    }

    pub fn from_config(config: &ModelConfig, store: Arc<dyn Store>) -> MeasureResult<Self> {
        config.build(store)
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> MeasureResult<Self> {
        settings.validate()?;
        self.settings = settings;
        Ok(self)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn register_table(&mut self, schema: TableSchema) -> MeasureResult<()> {
        self.catalog.register_table(schema)
    }

    /// Register an active or inactive many-to-one relationship from `fact[fk]` to `dim[key]`.
    pub fn register_relationship(
        &mut self,
        fact: &str,
        fk: &str,
        dim: &str,
        key: &str,
        active: bool,
    ) -> MeasureResult<()> {
        let mut relationship = Relationship::new(fact, fk, dim, key);
        if !active {
            relationship = relationship.inactive();
        }
        self.catalog.register_relationship(relationship)
    }

    /// Register a relationship. When it enforces referential integrity, the store is checked for
    /// dangling foreign keys first and nothing is registered if one is found.
    pub fn add_relationship(&mut self, relationship: Relationship) -> MeasureResult<()> {
        if relationship.enforce_referential_integrity {
            self.catalog
                .lookup_column(&relationship.from_table, &relationship.from_column)?;
            self.catalog
                .lookup_column(&relationship.to_table, &relationship.to_column)?;
            self.store.check_referential_integrity(
                &relationship.from_table,
                &relationship.from_column,
                &relationship.to_table,
                &relationship.to_column,
            )?;
        }
        self.catalog.register_relationship(relationship)
    }

    pub fn mark_date_table(
        &mut self,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> MeasureResult<()> {
        self.catalog.mark_date_table(table, column)
    }

    pub fn register_measure(&mut self, name: impl Into<String>, expr: Expr) -> MeasureResult<()> {
        self.register_measures(vec![MeasureDefinition::new(name, expr)])
    }

    /// Register definitions that may reference each other. All or none are registered.
    pub fn register_measures(&mut self, definitions: Vec<MeasureDefinition>) -> MeasureResult<()> {
        self.measures.register_batch(&self.catalog, definitions)
    }

    pub fn register_measure_text(
        &mut self,
        name: impl Into<String>,
        expression: impl Into<String>,
    ) -> MeasureResult<()> {
        let expression = expression.into();
        let expr = crate::parser::parse(&expression)?;
        self.register_measures(vec![
            MeasureDefinition::new(name, expr).with_expression(expression)
        ])
    }

    pub fn measure(&self, name: &str) -> Option<&Measure> {
        self.measures.get(name)
    }

    pub fn measures(&self) -> &MeasureRegistry {
        &self.measures
    }

    pub fn evaluate(&self, measure: &str, filter: &FilterContext) -> MeasureResult<Value> {
        self.evaluate_with_stats(measure, filter)
            .map(|(value, _)| value)
    }

    /// Like [`DataModel::evaluate`], also returning the query's cache counters.
    pub fn evaluate_with_stats(
        &self,
        measure: &str,
        filter: &FilterContext,
    ) -> MeasureResult<(Value, CacheStats)> {
        log::debug!("evaluate [{measure}] under {filter}");
        let mut evaluator = Evaluator::new(self);
        let value = evaluator.evaluate_measure(measure, filter)?;
        let stats = evaluator.cache_stats();
        log::debug!(
            "[{measure}] = {value} ({} cache hits, {} misses)",
            stats.hits,
            stats.misses
        );
        Ok((value, stats))
    }

    /// Evaluate an expression that is not registered as a measure. It is checked the same way a
    /// measure definition is.
    pub fn evaluate_expr(&self, expr: &Expr, filter: &FilterContext) -> MeasureResult<Value> {
        self.measures.validate_adhoc(&self.catalog, expr)?;
        Evaluator::new(self).evaluate_expr(expr, filter)
    }

    pub fn evaluate_text(&self, expression: &str, filter: &FilterContext) -> MeasureResult<Value> {
        let expr = crate::parser::parse(expression)?;
        self.evaluate_expr(&expr, filter)
    }

    /// Evaluate several measures under one context. A failing measure produces an error for its
    /// own cell only.
    pub fn evaluate_many(
        &self,
        measures: &[&str],
        filter: &FilterContext,
    ) -> Vec<(String, MeasureResult<Value>)> {
        let mut evaluator = Evaluator::new(self);
        measures
            .iter()
            .map(|name| {
                let result = evaluator.evaluate_measure(name, filter);
                if let Err(err) = &result {
                    log::debug!("[{name}] failed: {err}");
                }
                (name.to_string(), result)
            })
            .collect()
    }

    /// Evaluate `measure` once per visible member of `table[column]`, with the member overriding
    /// any existing restriction on the column.
    pub fn evaluate_by(
        &self,
        measure: &str,
        table: &str,
        column: &str,
        filter: &FilterContext,
    ) -> MeasureResult<Vec<(Value, MeasureResult<Value>)>> {
        self.catalog.lookup_column(table, column)?;
        if self.catalog.table(table)?.is_fact() {
            return Err(MeasureError::FactTableFilter {
                table: table.to_string(),
            });
        }
        if self.measure(measure).is_none() {
            return Err(MeasureError::UnknownMeasure(measure.to_string()));
        }

        let mut evaluator = Evaluator::new(self);
        let visible = evaluator.eligibility(table, filter)?;
        let members = self.store.distinct_values(table, column, &visible)?;
        log::debug!("evaluate [{measure}] by {table}[{column}] ({} members)", members.len());

        let mut out = Vec::with_capacity(members.len());
        for member in members {
            let cell = filter.override_with(table, Predicate::equals(column, member.clone()));
            let result = evaluator.evaluate_measure(measure, &cell);
            out.push((member, result));
        }
        Ok(out)
    }
}
