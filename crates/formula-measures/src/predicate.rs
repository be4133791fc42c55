use crate::value::{compare_values, Value};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CompareOp {
    Equals,
    NotEquals,
    Less,
    LessEquals,
    Greater,
    GreaterEquals,
}

impl CompareOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Equals => "=",
            CompareOp::NotEquals => "<>",
            CompareOp::Less => "<",
            CompareOp::LessEquals => "<=",
            CompareOp::Greater => ">",
            CompareOp::GreaterEquals => ">=",
        }
    }

    pub fn test(self, ord: Ordering) -> bool {
        match self {
            CompareOp::Equals => ord == Ordering::Equal,
            CompareOp::NotEquals => ord != Ordering::Equal,
            CompareOp::Less => ord == Ordering::Less,
            CompareOp::LessEquals => ord != Ordering::Greater,
            CompareOp::Greater => ord == Ordering::Greater,
            CompareOp::GreaterEquals => ord != Ordering::Less,
        }
    }

    /// The operator to use when the operands are swapped (`1 < x` is `x > 1`).
    pub fn flipped(self) -> Self {
        match self {
            CompareOp::Less => CompareOp::Greater,
            CompareOp::LessEquals => CompareOp::GreaterEquals,
            CompareOp::Greater => CompareOp::Less,
            CompareOp::GreaterEquals => CompareOp::LessEquals,
            other => other,
        }
    }
}

/// A row condition over the columns of a single table.
///
/// Predicates are plain data: the engine builds them from filter contexts and relationship
/// projections and hands them to the [`crate::Store`], which decides how to execute them.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Predicate {
    True,
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    In {
        column: String,
        values: BTreeSet<Value>,
    },
    /// Inclusive on both ends.
    Between {
        column: String,
        low: Value,
        high: Value,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn equals(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Equals, value)
    }

    pub fn in_values(column: impl Into<String>, values: impl IntoIterator<Item = Value>) -> Self {
        Predicate::In {
            column: column.into(),
            values: values.into_iter().collect(),
        }
    }

    pub fn between(
        column: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        Predicate::Between {
            column: column.into(),
            low: low.into(),
            high: high.into(),
        }
    }

    /// Conjunction of `parts`, flattening nested `And`s and dropping `True`.
    pub fn all(parts: impl IntoIterator<Item = Predicate>) -> Self {
        let mut out = Vec::new();
        for part in parts {
            match part {
                Predicate::True => {}
                Predicate::And(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Predicate::True,
            1 => out.pop().unwrap_or(Predicate::True),
            _ => Predicate::And(out),
        }
    }

    /// Disjunction of `parts`. An empty disjunction matches nothing.
    pub fn any(parts: impl IntoIterator<Item = Predicate>) -> Self {
        let mut out = Vec::new();
        for part in parts {
            match part {
                Predicate::True => return Predicate::True,
                Predicate::Or(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            1 => out.pop().unwrap_or(Predicate::True),
            _ => Predicate::Or(out),
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        Self::all([self, other])
    }

    pub fn negate(self) -> Self {
        match self {
            Predicate::Not(inner) => *inner,
            other => Predicate::Not(Box::new(other)),
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Predicate::True)
    }

    /// Every column this predicate reads.
    pub fn columns(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Predicate::True => {}
            Predicate::Compare { column, .. }
            | Predicate::In { column, .. }
            | Predicate::Between { column, .. } => {
                out.insert(column.as_str());
            }
            Predicate::And(parts) | Predicate::Or(parts) => {
                for part in parts {
                    part.collect_columns(out);
                }
            }
            Predicate::Not(inner) => inner.collect_columns(out),
        }
    }

    /// Rewrite every reference to `from` as a reference to `to`.
    ///
    /// Used to move a predicate on a dimension key onto the matching fact foreign key.
    pub fn rename_column(&self, from: &str, to: &str) -> Self {
        let rename = |column: &String| {
            if column == from {
                to.to_string()
            } else {
                column.clone()
            }
        };
        match self {
            Predicate::True => Predicate::True,
            Predicate::Compare { column, op, value } => Predicate::Compare {
                column: rename(column),
                op: *op,
                value: value.clone(),
            },
            Predicate::In { column, values } => Predicate::In {
                column: rename(column),
                values: values.clone(),
            },
            Predicate::Between { column, low, high } => Predicate::Between {
                column: rename(column),
                low: low.clone(),
                high: high.clone(),
            },
            Predicate::And(parts) => {
                Predicate::And(parts.iter().map(|p| p.rename_column(from, to)).collect())
            }
            Predicate::Or(parts) => {
                Predicate::Or(parts.iter().map(|p| p.rename_column(from, to)).collect())
            }
            Predicate::Not(inner) => Predicate::Not(Box::new(inner.rename_column(from, to))),
        }
    }

    /// Evaluate against a row. `lookup` returns the value of a column (BLANK when missing).
    pub fn matches(&self, lookup: &dyn Fn(&str) -> Value) -> bool {
        match self {
            Predicate::True => true,
            Predicate::Compare { column, op, value } => {
                let actual = lookup(column);
                match compare_values(&actual, value) {
                    Some(ord) => op.test(ord),
                    // Incomparable kinds are simply unequal.
                    None => *op == CompareOp::NotEquals,
                }
            }
            Predicate::In { column, values } => values.contains(&lookup(column)),
            Predicate::Between { column, low, high } => {
                let actual = lookup(column);
                matches!(
                    compare_values(&actual, low),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(
                    compare_values(&actual, high),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }
            Predicate::And(parts) => parts.iter().all(|p| p.matches(lookup)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(lookup)),
            Predicate::Not(inner) => !inner.matches(lookup),
        }
    }
}

impl fmt::Display for Predicate {
    /// Canonical rendering: operands of `&&`/`||` are sorted so logically identical
    /// conjunctions built in a different order render the same.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::True => f.write_str("TRUE()"),
            Predicate::Compare { column, op, value } => {
                write!(f, "[{column}] {} {value}", op.symbol())
            }
            Predicate::In { column, values } => {
                write!(f, "[{column}] IN {{")?;
                for (idx, value) in values.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("}")
            }
            Predicate::Between { column, low, high } => {
                write!(f, "[{column}] BETWEEN {low} AND {high}")
            }
            Predicate::And(parts) => write_joined(f, parts, " && "),
            Predicate::Or(parts) => write_joined(f, parts, " || "),
            Predicate::Not(inner) => write!(f, "NOT({inner})"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, parts: &[Predicate], sep: &str) -> fmt::Result {
    let mut rendered: Vec<String> = parts.iter().map(ToString::to_string).collect();
    rendered.sort();
    write!(f, "({})", rendered.join(sep))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(column: &str) -> Value {
        match column {
            "Year" => Value::from(2024),
            "District" => Value::from("North"),
            _ => Value::Blank,
        }
    }

    #[test]
    fn all_flattens_and_drops_true() {
        let p = Predicate::all([
            Predicate::True,
            Predicate::equals("Year", 2024),
            Predicate::all([Predicate::equals("District", "North"), Predicate::True]),
        ]);
        assert_eq!(
            p,
            Predicate::And(vec![
                Predicate::equals("Year", 2024),
                Predicate::equals("District", "North"),
            ])
        );
    }

    #[test]
    fn matches_rows() {
        let p = Predicate::equals("Year", 2024).and(Predicate::in_values(
            "District",
            [Value::from("North"), Value::from("South")],
        ));
        assert!(p.matches(&row));
        assert!(!Predicate::between("Year", 2020, 2023).matches(&row));
        assert!(Predicate::compare("District", CompareOp::NotEquals, 1).matches(&row));
        assert!(!Predicate::any(Vec::new()).matches(&row));
    }

    #[test]
    fn display_is_order_independent() {
        let a = Predicate::equals("Year", 2024).and(Predicate::equals("District", "North"));
        let b = Predicate::equals("District", "North").and(Predicate::equals("Year", 2024));
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn rename_moves_key_filters_to_foreign_keys() {
        let p = Predicate::in_values("DateKey", [Value::from(1), Value::from(2)]);
        let renamed = p.rename_column("DateKey", "OccurredOn");
        let columns: Vec<&str> = renamed.columns().into_iter().collect();
        assert_eq!(columns, vec!["OccurredOn"]);
    }
}
