use chrono::NaiveDate;
use ordered_float::OrderedFloat;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// A scalar produced by the Store or by evaluating a measure.
///
/// Values are totally ordered so they can be kept in `BTreeSet`s: `Blank` sorts first, followed by
/// booleans, numbers, dates and text. The cross-kind order only exists to give sets and context
/// fingerprints a canonical shape; DAX-style comparisons go through [`compare_values`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Value {
    #[default]
    Blank,
    Boolean(bool),
    Number(OrderedFloat<f64>),
    Date(NaiveDate),
    Text(Arc<str>),
}

impl Value {
    pub fn is_blank(&self) -> bool {
        matches!(self, Value::Blank)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(n.0),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Boolean interpretation used by conditions: BLANK is false, numbers are true when non-zero.
    ///
    /// Returns `None` for values that have no boolean meaning (text, dates).
    pub fn truthy(&self) -> Option<bool> {
        match self {
            Value::Blank => Some(false),
            Value::Boolean(b) => Some(*b),
            Value::Number(n) => Some(n.0 != 0.0),
            Value::Date(_) | Value::Text(_) => None,
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Value::Blank => 0,
            Value::Boolean(_) => 1,
            Value::Number(_) => 2,
            Value::Date(_) => 3,
            Value::Text(_) => 4,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Blank, Value::Blank) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.as_ref().cmp(b.as_ref()),
            _ => self.kind_rank().cmp(&other.kind_rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compare two values the way formula comparisons do.
///
/// BLANK coerces to `0`/`FALSE`/the empty string depending on the other side, booleans compare
/// as `0`/`1` against numbers. Returns `None` when the kinds cannot be compared (text vs. number,
/// date vs. text, ...).
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Blank, Value::Blank) => Some(Ordering::Equal),
        (Value::Text(l), Value::Text(r)) => Some(l.as_ref().cmp(r.as_ref())),
        (Value::Text(l), Value::Blank) => Some(l.as_ref().cmp("")),
        (Value::Blank, Value::Text(r)) => Some("".cmp(r.as_ref())),
        (Value::Date(l), Value::Date(r)) => Some(l.cmp(r)),
        // A blank date sorts before every real date.
        (Value::Date(_), Value::Blank) => Some(Ordering::Greater),
        (Value::Blank, Value::Date(_)) => Some(Ordering::Less),
        (Value::Text(_), _) | (_, Value::Text(_)) | (Value::Date(_), _) | (_, Value::Date(_)) => {
            None
        }
        _ => {
            let l = numeric(left)?;
            let r = numeric(right)?;
            l.partial_cmp(&r)
        }
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Blank => Some(0.0),
        Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => Some(n.0),
        Value::Date(_) | Value::Text(_) => None,
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Blank => f.write_str("BLANK()"),
            Value::Boolean(true) => f.write_str("TRUE()"),
            Value::Boolean(false) => f.write_str("FALSE()"),
            Value::Number(n) => write!(f, "{}", n.0),
            Value::Date(d) => write!(f, "DATE({})", d.format("%Y-%m-%d")),
            Value::Text(s) => write!(f, "\"{}\"", s.replace('"', "\"\"")),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(OrderedFloat(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(OrderedFloat(value as f64))
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(OrderedFloat(value as f64))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(Arc::from(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(Arc::from(value))
    }
}

impl From<Arc<str>> for Value {
    fn from(value: Arc<str>) -> Self {
        Value::Text(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_compares_like_zero_and_empty_text() {
        assert_eq!(
            compare_values(&Value::Blank, &Value::from(0.0)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            compare_values(&Value::Blank, &Value::from("")),
            Some(Ordering::Equal)
        );
        assert_eq!(compare_values(&Value::from("a"), &Value::from(1.0)), None);
    }

    #[test]
    fn set_order_is_grouped_by_kind() {
        let mut values = vec![
            Value::from("x"),
            Value::from(2.0),
            Value::Blank,
            Value::from(true),
            Value::from(1.0),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                Value::Blank,
                Value::from(true),
                Value::from(1.0),
                Value::from(2.0),
                Value::from("x"),
            ]
        );
    }

    #[test]
    fn display_is_unambiguous_across_kinds() {
        assert_eq!(Value::from("1").to_string(), "\"1\"");
        assert_eq!(Value::from(1.0).to_string(), "1");
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(Value::from(date).to_string(), "DATE(2024-03-01)");
    }
}
