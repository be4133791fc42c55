use crate::error::{MeasureError, MeasureResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableRole {
    Fact,
    Dimension,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub role: TableRole,
    pub columns: Vec<String>,
    /// Surrogate key column. Always set for dimensions.
    pub key: Option<String>,
}

impl TableSchema {
    pub fn fact(name: impl Into<String>, columns: Vec<impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            role: TableRole::Fact,
            columns: columns.into_iter().map(Into::into).collect(),
            key: None,
        }
    }

    pub fn dimension(
        name: impl Into<String>,
        columns: Vec<impl Into<String>>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            role: TableRole::Dimension,
            columns: columns.into_iter().map(Into::into).collect(),
            key: Some(key.into()),
        }
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn is_fact(&self) -> bool {
        self.role == TableRole::Fact
    }
}

/// A many-to-one link from `from_table[from_column]` to the key of `to_table`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relationship {
    pub name: String,
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    pub is_active: bool,
    /// Verify against the store, at registration, that every foreign key has a matching key.
    pub enforce_referential_integrity: bool,
}

impl Relationship {
    pub fn new(
        from_table: impl Into<String>,
        from_column: impl Into<String>,
        to_table: impl Into<String>,
        to_column: impl Into<String>,
    ) -> Self {
        let from_table = from_table.into();
        let from_column = from_column.into();
        let to_table = to_table.into();
        let to_column = to_column.into();
        Self {
            name: format!("{from_table}[{from_column}] -> {to_table}[{to_column}]"),
            from_table,
            from_column,
            to_table,
            to_column,
            is_active: true,
            enforce_referential_integrity: false,
        }
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn enforcing_referential_integrity(mut self) -> Self {
        self.enforce_referential_integrity = true;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinStep {
    pub relationship: String,
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

impl From<&Relationship> for JoinStep {
    fn from(rel: &Relationship) -> Self {
        Self {
            relationship: rel.name.clone(),
            from_table: rel.from_table.clone(),
            from_column: rel.from_column.clone(),
            to_table: rel.to_table.clone(),
            to_column: rel.to_column.clone(),
        }
    }
}

/// Ordered many-to-one hops from a (fact) table to a dimension. Empty when both ends are the same
/// table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JoinPath {
    pub steps: Vec<JoinStep>,
}

impl JoinPath {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Display for JoinPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, step) in self.steps.iter().enumerate() {
            if idx > 0 {
                f.write_str(" => ")?;
            }
            write!(
                f,
                "{}[{}] -> {}[{}]",
                step.from_table, step.from_column, step.to_table, step.to_column
            )?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DateTable {
    pub table: String,
    pub column: String,
}

/// Tables, relationships and the marked date table of one model.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    tables: BTreeMap<String, TableSchema>,
    relationships: Vec<Relationship>,
    date_table: Option<DateTable>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_table(&mut self, schema: TableSchema) -> MeasureResult<()> {
        if self.tables.contains_key(&schema.name) {
            return Err(MeasureError::DuplicateTable { table: schema.name });
        }
        if let Some(key) = &schema.key {
            if !schema.has_column(key) {
                return Err(MeasureError::UnknownColumn {
                    table: schema.name.clone(),
                    column: key.clone(),
                });
            }
        }
        if schema.role == TableRole::Dimension && schema.key.is_none() {
            return Err(MeasureError::Config(format!(
                "dimension {} must declare a key column",
                schema.name
            )));
        }
        log::debug!("registered {:?} table {}", schema.role, schema.name);
        self.tables.insert(schema.name.clone(), schema);
        Ok(())
    }

    pub fn table(&self, name: &str) -> MeasureResult<&TableSchema> {
        self.tables
            .get(name)
            .ok_or_else(|| MeasureError::UnknownTable(name.to_string()))
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    pub fn lookup_column(&self, table: &str, column: &str) -> MeasureResult<()> {
        if self.table(table)?.has_column(column) {
            Ok(())
        } else {
            Err(MeasureError::UnknownColumn {
                table: table.to_string(),
                column: column.to_string(),
            })
        }
    }

    /// Key column of a dimension table.
    pub fn key_column(&self, table: &str) -> MeasureResult<&str> {
        let schema = self.table(table)?;
        schema
            .key
            .as_deref()
            .ok_or_else(|| MeasureError::FactTableFilter {
                table: table.to_string(),
            })
    }

    pub fn register_relationship(&mut self, relationship: Relationship) -> MeasureResult<()> {
        self.lookup_column(&relationship.from_table, &relationship.from_column)?;
        self.lookup_column(&relationship.to_table, &relationship.to_column)?;

        let invalid = |reason: &str| MeasureError::InvalidRelationship {
            relationship: relationship.name.clone(),
            reason: reason.to_string(),
        };
        if relationship.from_table == relationship.to_table {
            return Err(invalid("a table cannot relate to itself"));
        }
        let target = self.table(&relationship.to_table)?;
        if target.role != TableRole::Dimension {
            return Err(invalid("the target table must be a dimension"));
        }
        if target.key.as_deref() != Some(relationship.to_column.as_str()) {
            return Err(invalid("the target column must be the dimension key"));
        }
        if self.relationship(&relationship.name).is_some() {
            return Err(invalid("a relationship with this name already exists"));
        }

        if relationship.is_active {
            if let Some(existing) = self.relationships.iter().find(|r| {
                r.is_active
                    && r.from_table == relationship.from_table
                    && r.to_table == relationship.to_table
            }) {
                return Err(MeasureError::AmbiguousJoin {
                    from: relationship.from_table.clone(),
                    to: relationship.to_table.clone(),
                    paths: vec![existing.name.clone(), relationship.name.clone()],
                });
            }
        }

        log::debug!(
            "registered {} relationship {}",
            if relationship.is_active { "active" } else { "inactive" },
            relationship.name
        );
        self.relationships.push(relationship);
        Ok(())
    }

    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    /// Find the relationship joining the two columns, in either order.
    pub fn find_relationship_by_columns(
        &self,
        left: (&str, &str),
        right: (&str, &str),
    ) -> MeasureResult<&Relationship> {
        let joins = |r: &Relationship, from: (&str, &str), to: (&str, &str)| {
            r.from_table == from.0
                && r.from_column == from.1
                && r.to_table == to.0
                && r.to_column == to.1
        };
        self.relationships
            .iter()
            .find(|r| joins(r, left, right) || joins(r, right, left))
            .ok_or_else(|| {
                MeasureError::UnknownRelationship(format!(
                    "{}[{}] <-> {}[{}]",
                    left.0, left.1, right.0, right.1
                ))
            })
    }

    pub fn mark_date_table(
        &mut self,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> MeasureResult<()> {
        let table = table.into();
        let column = column.into();
        self.lookup_column(&table, &column)?;
        if self.table(&table)?.role != TableRole::Dimension {
            return Err(MeasureError::Config(format!(
                "date table {table} must be a dimension"
            )));
        }
        self.date_table = Some(DateTable { table, column });
        Ok(())
    }

    pub fn date_table(&self) -> MeasureResult<&DateTable> {
        self.date_table.as_ref().ok_or(MeasureError::NoDateTable)
    }

    pub fn resolve_path(&self, from: &str, to: &str) -> MeasureResult<JoinPath> {
        self.resolve_path_with_hints(from, to, &BTreeSet::new())?
            .ok_or_else(|| MeasureError::NoJoinPath {
                from: from.to_string(),
                to: to.to_string(),
            })
    }

    /// Resolve the unique many-to-one path from `from` to `to`.
    ///
    /// `hints` names relationships activated with `USERELATIONSHIP`: a hinted relationship is
    /// followed even if inactive, and it deactivates the other relationships between the same pair
    /// of tables. When several paths remain and some of them go through a hinted relationship, only
    /// those are kept. Returns `Ok(None)` when the tables are not connected and `AmbiguousJoin` when
    /// more than one path is left.
    pub fn resolve_path_with_hints(
        &self,
        from: &str,
        to: &str,
        hints: &BTreeSet<String>,
    ) -> MeasureResult<Option<JoinPath>> {
        self.table(from)?;
        self.table(to)?;
        if from == to {
            return Ok(Some(JoinPath::default()));
        }

        let hinted_pairs: BTreeSet<(&str, &str)> = self
            .relationships
            .iter()
            .filter(|r| hints.contains(&r.name))
            .map(|r| (r.from_table.as_str(), r.to_table.as_str()))
            .collect();
        let edges: Vec<&Relationship> = self
            .relationships
            .iter()
            .filter(|r| {
                if hints.contains(&r.name) {
                    return true;
                }
                r.is_active && !hinted_pairs.contains(&(r.from_table.as_str(), r.to_table.as_str()))
            })
            .collect();

        let mut found = Vec::new();
        let mut visited = vec![from];
        let mut current = Vec::new();
        collect_paths(&edges, from, to, &mut visited, &mut current, &mut found);

        if found.len() > 1 {
            let hinted = |path: &JoinPath| {
                path.steps
                    .iter()
                    .any(|step| hints.contains(&step.relationship))
            };
            if found.iter().any(hinted) {
                found.retain(hinted);
            }
        }

        match found.len() {
            0 => Ok(None),
            1 => Ok(found.pop()),
            _ => Err(MeasureError::AmbiguousJoin {
                from: from.to_string(),
                to: to.to_string(),
                paths: found.iter().map(ToString::to_string).collect(),
            }),
        }
    }
}

fn collect_paths<'a>(
    edges: &[&'a Relationship],
    at: &str,
    target: &str,
    visited: &mut Vec<&'a str>,
    current: &mut Vec<JoinStep>,
    found: &mut Vec<JoinPath>,
) {
    for &rel in edges.iter().filter(|r| r.from_table == at) {
        if visited.contains(&rel.to_table.as_str()) {
            continue;
        }
        current.push(JoinStep::from(rel));
        if rel.to_table == target {
            found.push(JoinPath {
                steps: current.clone(),
            });
        } else {
            visited.push(rel.to_table.as_str());
            collect_paths(edges, &rel.to_table, target, visited, current, found);
            visited.pop();
        }
        current.pop();
    }
}
