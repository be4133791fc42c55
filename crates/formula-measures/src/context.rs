use crate::predicate::Predicate;
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// The set of active row restrictions, per dimension table, under which an expression is evaluated.
///
/// A context is an immutable value: every derivation returns a new context and leaves `self`
/// untouched, so a context can be shared between sibling sub-expressions and across threads.
/// Restrictions on one table are ANDed; a single predicate may itself be a multi-value `In` or an
/// `Or` (multi-select).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterContext {
    tables: BTreeMap<String, Vec<Predicate>>,
    relationship_hints: BTreeSet<String>,
}

/// Canonical rendering of a [`FilterContext`], used as a cache key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextFingerprint(String);

impl ContextFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FilterContext {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn is_unrestricted(&self) -> bool {
        self.tables.is_empty()
    }

    /// Intersect the rows allowed on `table` with the rows satisfying `predicate`.
    pub fn restrict(&self, table: &str, predicate: Predicate) -> Self {
        let mut out = self.clone();
        if !predicate.is_true() {
            out.tables
                .entry(table.to_string())
                .or_default()
                .push(predicate);
        }
        out
    }

    /// Replace every restriction on `table` that touches a column read by `predicate`, then apply
    /// `predicate`. Restrictions on other columns are kept.
    pub fn override_with(&self, table: &str, predicate: Predicate) -> Self {
        let columns: BTreeSet<String> = predicate.columns().into_iter().map(String::from).collect();
        let mut out = self.clone();
        out.remove_where(table, |p| p.columns().iter().any(|c| columns.contains(*c)));
        out.restrict(table, predicate)
    }

    pub fn with_column_equals(&self, table: &str, column: &str, value: impl Into<Value>) -> Self {
        self.restrict(table, Predicate::equals(column, value))
    }

    pub fn with_column_in(
        &self,
        table: &str,
        column: &str,
        values: impl IntoIterator<Item = Value>,
    ) -> Self {
        self.restrict(table, Predicate::in_values(column, values))
    }

    /// Remove every restriction on the named tables.
    pub fn clear_all(&self, tables: &[&str]) -> Self {
        let mut out = self.clone();
        for table in tables {
            out.tables.remove(*table);
        }
        out
    }

    /// Remove restrictions on `table` that touch any of `columns`.
    pub fn clear_columns(&self, table: &str, columns: &[&str]) -> Self {
        let mut out = self.clone();
        out.remove_where(table, |p| p.columns().iter().any(|c| columns.contains(c)));
        out
    }

    /// Remove restrictions on `table` except those expressed purely in terms of `keep`.
    pub fn clear_all_except(&self, table: &str, keep: &[&str]) -> Self {
        let mut out = self.clone();
        out.remove_where(table, |p| !p.columns().iter().all(|c| keep.contains(c)));
        out
    }

    /// Activate the named relationship for joins resolved under the derived context.
    pub fn use_relationship(&self, name: impl Into<String>) -> Self {
        let mut out = self.clone();
        out.relationship_hints.insert(name.into());
        out
    }

    pub fn restrictions(&self, table: &str) -> &[Predicate] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Conjunction of every restriction on `table` (`True` when unrestricted).
    pub fn table_predicate(&self, table: &str) -> Predicate {
        Predicate::all(self.restrictions(table).iter().cloned())
    }

    pub fn restricted_tables(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn relationship_hints(&self) -> &BTreeSet<String> {
        &self.relationship_hints
    }

    pub fn fingerprint(&self) -> ContextFingerprint {
        let mut out = String::new();
        for (table, predicates) in &self.tables {
            let mut rendered: Vec<String> = predicates.iter().map(ToString::to_string).collect();
            rendered.sort();
            rendered.dedup();
            out.push_str(table);
            out.push('{');
            out.push_str(&rendered.join(";"));
            out.push('}');
        }
        if !self.relationship_hints.is_empty() {
            out.push_str("USE{");
            let hints: Vec<&str> = self.relationship_hints.iter().map(String::as_str).collect();
            out.push_str(&hints.join(";"));
            out.push('}');
        }
        ContextFingerprint(out)
    }

    fn remove_where(&mut self, table: &str, mut remove: impl FnMut(&Predicate) -> bool) {
        if let Some(predicates) = self.tables.get_mut(table) {
            predicates.retain(|p| !remove(p));
            if predicates.is_empty() {
                self.tables.remove(table);
            }
        }
    }
}

impl fmt::Display for FilterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unrestricted() && self.relationship_hints.is_empty() {
            return f.write_str("<unrestricted>");
        }
        f.write_str(self.fingerprint().as_str())
    }
}
