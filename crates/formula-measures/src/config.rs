//! Engine settings and JSON model definitions.

use crate::catalog::{Relationship, TableRole, TableSchema};
use crate::error::{MeasureError, MeasureResult};
use crate::measure::MeasureDefinition;
use crate::model::DataModel;
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Evaluation settings shared by every query against a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Memoize measure results per (measure, filter context) within one query.
    pub cache_measures: bool,
    /// First month (1-12) of the fiscal year used by year-to-date and previous-year windows.
    pub fiscal_year_start_month: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            cache_measures: true,
            fiscal_year_start_month: 1,
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> MeasureResult<()> {
        if !(1..=12).contains(&self.fiscal_year_start_month) {
            return Err(MeasureError::Config(format!(
                "fiscal_year_start_month must be between 1 and 12, got {}",
                self.fiscal_year_start_month
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    pub role: TableRole,
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub enforce_referential_integrity: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateTableConfig {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureConfig {
    pub name: String,
    /// Formula text, e.g. `DIVIDE([Total Arrests], [Total Crimes], 0) * 100`.
    pub expression: String,
}

/// A complete model definition: schema, relationships, date table and measures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub settings: EngineSettings,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
    #[serde(default)]
    pub relationships: Vec<RelationshipConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_table: Option<DateTableConfig>,
    #[serde(default)]
    pub measures: Vec<MeasureConfig>,
}

impl ModelConfig {
    pub fn from_json_str(json: &str) -> MeasureResult<Self> {
        serde_json::from_str(json).map_err(|e| MeasureError::Config(e.to_string()))
    }

    pub fn to_json_string(&self) -> MeasureResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| MeasureError::Config(e.to_string()))
    }

    /// Build a model over `store`. Measures are registered as one batch, so they may reference
    /// each other in any order.
    pub fn build(&self, store: Arc<dyn Store>) -> MeasureResult<DataModel> {
        let mut model = DataModel::new(store).with_settings(self.settings.clone())?;

        for table in &self.tables {
            let schema = match table.role {
                TableRole::Fact => TableSchema::fact(&table.name, table.columns.clone()),
                TableRole::Dimension => {
                    let key = table.key.clone().ok_or_else(|| {
                        MeasureError::Config(format!(
                            "dimension {} must declare a key column",
                            table.name
                        ))
                    })?;
                    TableSchema::dimension(&table.name, table.columns.clone(), key)
                }
            };
            model.register_table(schema)?;
        }

        for rel in &self.relationships {
            let mut relationship =
                Relationship::new(&rel.from_table, &rel.from_column, &rel.to_table, &rel.to_column);
            if let Some(name) = &rel.name {
                relationship = relationship.with_name(name);
            }
            if !rel.active {
                relationship = relationship.inactive();
            }
            if rel.enforce_referential_integrity {
                relationship = relationship.enforcing_referential_integrity();
            }
            model.add_relationship(relationship)?;
        }

        if let Some(date_table) = &self.date_table {
            model.mark_date_table(&date_table.table, &date_table.column)?;
        }

        let mut definitions = Vec::with_capacity(self.measures.len());
        for measure in &self.measures {
            let expr = crate::parser::parse(&measure.expression)?;
            definitions
                .push(MeasureDefinition::new(&measure.name, expr).with_expression(&measure.expression));
        }
        model.register_measures(definitions)?;

        log::debug!(
            "built model with {} tables and {} measures",
            self.tables.len(),
            self.measures.len()
        );
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_default_when_omitted() {
        let config = ModelConfig::from_json_str(r#"{ "tables": [] }"#).unwrap();
        assert_eq!(config.settings, EngineSettings::default());
    }

    #[test]
    fn settings_reject_invalid_fiscal_month() {
        let settings = EngineSettings {
            fiscal_year_start_month: 13,
            ..EngineSettings::default()
        };
        assert!(matches!(settings.validate(), Err(MeasureError::Config(_))));
    }
}
