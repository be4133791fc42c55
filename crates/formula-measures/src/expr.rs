use crate::predicate::Predicate;
use crate::store::AggregateOp;
use crate::value::Value;

/// A compiled measure expression.
///
/// Expressions are immutable once registered and are evaluated against an explicit
/// [`crate::FilterContext`]; nothing in the tree carries evaluation state.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Reads a column of the row currently being iterated.
    ColumnRef {
        table: String,
        column: String,
    },
    MeasureRef(String),
    Aggregate {
        op: AggregateOp,
        table: String,
        column: Option<String>,
        predicate: Option<Predicate>,
    },
    Var(String),
    Let {
        bindings: Vec<(String, Expr)>,
        body: Box<Expr>,
    },
    Conditional {
        branches: Vec<(Expr, Expr)>,
        default: Option<Box<Expr>>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    SafeDivide {
        numerator: Box<Expr>,
        denominator: Box<Expr>,
        default: Box<Expr>,
    },
    Calculate {
        expr: Box<Expr>,
        modifiers: Vec<FilterModifier>,
    },
    Iterate {
        kind: IterateKind,
        table: TableExpr,
        expr: Box<Expr>,
    },
    Rank {
        table: TableExpr,
        expr: Box<Expr>,
        order: RankOrder,
        ties: RankTies,
    },
    SelectedValue {
        table: String,
        column: String,
        alternate: Option<Box<Expr>>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
    IsBlank,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Equals,
    NotEquals,
    Less,
    LessEquals,
    Greater,
    GreaterEquals,
    And,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterateKind {
    Sum,
    Average,
    Min,
    Max,
    Count,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RankOrder {
    Ascending,
    #[default]
    Descending,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RankTies {
    #[default]
    Dense,
    Skip,
}

/// A table-valued argument: the rows an iterator walks or a `CALCULATE` filter keeps.
#[derive(Clone, Debug, PartialEq)]
pub enum TableExpr {
    /// The visible rows of a table under the current context.
    Table(String),
    /// Every row of a table, ignoring the table's restrictions.
    All(String),
    /// Rows of `source` for which `predicate` is true. The predicate is evaluated once per row with
    /// that row pinned, so it may reference columns and measures.
    Filter {
        source: Box<TableExpr>,
        predicate: Box<Expr>,
    },
    /// The date-table rows selected by a period function.
    Period(PeriodFunction),
}

impl TableExpr {
    /// The table whose rows this expression yields.
    pub fn base_table<'a>(&'a self, date_table: Option<&'a str>) -> Option<&'a str> {
        match self {
            TableExpr::Table(t) | TableExpr::All(t) => Some(t),
            TableExpr::Filter { source, .. } => source.base_table(date_table),
            TableExpr::Period(_) => date_table,
        }
    }
}

/// One filter argument of `CALCULATE`, applied left to right.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterModifier {
    /// Replace restrictions on the predicate's columns.
    Override { table: String, predicate: Predicate },
    /// Intersect with the existing restrictions (`KEEPFILTERS`).
    Restrict { table: String, predicate: Predicate },
    /// `ALL(table, ...)` / `REMOVEFILTERS(table)`.
    All(Vec<String>),
    /// `ALL(Table[Column], ...)`.
    AllColumns { table: String, columns: Vec<String> },
    AllExcept { table: String, keep: Vec<String> },
    /// Replace the table's key restriction with the keys yielded by the table expression.
    Table(TableExpr),
    Period(PeriodFunction),
    UseRelationship(RelationshipRef),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelationshipRef {
    Named(String),
    Columns {
        left_table: String,
        left_column: String,
        right_table: String,
        right_column: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeriodUnit {
    Day,
    Month,
    Quarter,
    Year,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeriodFunction {
    /// Start of the as-of date's unit through the as-of date (`DATESMTD`/`QTD`/`YTD`).
    ToDate(PeriodUnit),
    /// The whole unit preceding the as-of date's unit (`PREVIOUSMONTH`, ...).
    Previous(PeriodUnit),
    /// Every visible date shifted by `count` units (`DATEADD`, `SAMEPERIODLASTYEAR`).
    Shift { count: i32, unit: PeriodUnit },
    /// The trailing `count` units ending at the as-of date (`DATESINPERIOD`).
    Trailing { count: u32, unit: PeriodUnit },
}

impl PeriodFunction {
    pub fn same_period_last_year() -> Self {
        PeriodFunction::Shift {
            count: -1,
            unit: PeriodUnit::Year,
        }
    }
}

impl Expr {
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn number(value: f64) -> Self {
        Expr::Literal(Value::from(value))
    }

    pub fn blank() -> Self {
        Expr::Literal(Value::Blank)
    }

    pub fn measure(name: impl Into<String>) -> Self {
        Expr::MeasureRef(name.into())
    }

    pub fn column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Expr::ColumnRef {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    pub fn aggregate(
        op: AggregateOp,
        table: impl Into<String>,
        column: Option<&str>,
        predicate: Option<Predicate>,
    ) -> Self {
        Expr::Aggregate {
            op,
            table: table.into(),
            column: column.map(String::from),
            predicate,
        }
    }

    pub fn sum(table: impl Into<String>, column: &str) -> Self {
        Self::aggregate(AggregateOp::Sum, table, Some(column), None)
    }

    pub fn count_rows(table: impl Into<String>) -> Self {
        Self::aggregate(AggregateOp::CountRows, table, None, None)
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn unary(op: UnaryOp, expr: Expr) -> Self {
        Expr::Unary {
            op,
            expr: Box::new(expr),
        }
    }

    pub fn safe_divide(numerator: Expr, denominator: Expr, default: Expr) -> Self {
        Expr::SafeDivide {
            numerator: Box::new(numerator),
            denominator: Box::new(denominator),
            default: Box::new(default),
        }
    }

    pub fn calculate(expr: Expr, modifiers: Vec<FilterModifier>) -> Self {
        Expr::Calculate {
            expr: Box::new(expr),
            modifiers,
        }
    }

    pub fn conditional(branches: Vec<(Expr, Expr)>, default: Option<Expr>) -> Self {
        Expr::Conditional {
            branches,
            default: default.map(Box::new),
        }
    }

    pub fn let_in(bindings: Vec<(&str, Expr)>, body: Expr) -> Self {
        Expr::Let {
            bindings: bindings
                .into_iter()
                .map(|(name, expr)| (name.to_string(), expr))
                .collect(),
            body: Box::new(body),
        }
    }

    pub fn iterate(kind: IterateKind, table: TableExpr, expr: Expr) -> Self {
        Expr::Iterate {
            kind,
            table,
            expr: Box::new(expr),
        }
    }

    pub fn rank(table: TableExpr, expr: Expr, order: RankOrder, ties: RankTies) -> Self {
        Expr::Rank {
            table,
            expr: Box::new(expr),
            order,
            ties,
        }
    }

    /// Average of `expr` evaluated once per day of the trailing `days`-day window.
    pub fn moving_average(expr: Expr, days: u32) -> Self {
        Self::iterate(
            IterateKind::Average,
            TableExpr::Period(PeriodFunction::Trailing {
                count: days,
                unit: PeriodUnit::Day,
            }),
            expr,
        )
    }

    /// Names of the measures referenced anywhere in the expression, as written.
    pub fn referenced_measures(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.visit(&mut |expr| {
            if let Expr::MeasureRef(name) = expr {
                out.push(name.as_str());
            }
        });
        out
    }

    /// Pre-order walk over this expression and every nested expression, including the ones inside
    /// table arguments.
    pub fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Literal(_)
            | Expr::ColumnRef { .. }
            | Expr::MeasureRef(_)
            | Expr::Aggregate { .. }
            | Expr::Var(_) => {}
            Expr::SelectedValue { alternate, .. } => {
                if let Some(alternate) = alternate {
                    alternate.visit(f);
                }
            }
            Expr::Let { bindings, body } => {
                for (_, expr) in bindings {
                    expr.visit(f);
                }
                body.visit(f);
            }
            Expr::Conditional { branches, default } => {
                for (cond, value) in branches {
                    cond.visit(f);
                    value.visit(f);
                }
                if let Some(default) = default {
                    default.visit(f);
                }
            }
            Expr::Unary { expr, .. } => expr.visit(f),
            Expr::Binary { left, right, .. } => {
                left.visit(f);
                right.visit(f);
            }
            Expr::SafeDivide {
                numerator,
                denominator,
                default,
            } => {
                numerator.visit(f);
                denominator.visit(f);
                default.visit(f);
            }
            Expr::Calculate { expr, modifiers } => {
                expr.visit(f);
                for modifier in modifiers {
                    if let FilterModifier::Table(table) = modifier {
                        table.visit(f);
                    }
                }
            }
            Expr::Iterate { table, expr, .. } | Expr::Rank { table, expr, .. } => {
                table.visit(f);
                expr.visit(f);
            }
        }
    }
}

impl TableExpr {
    fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        if let TableExpr::Filter { source, predicate } = self {
            source.visit(f);
            predicate.visit(f);
        }
    }
}
