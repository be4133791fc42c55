//! Formula text front-end.
//!
//! Text is tokenized and parsed with a small Pratt parser into a syntax tree that mirrors the
//! surface language (function calls, names, operators). [`Lowering`] then turns that tree into an
//! [`Expr`], resolving which arguments are tables, which are filter arguments and which `CALCULATE`
//! conditions can be pushed down to the store as plain [`Predicate`]s.

use crate::error::{MeasureError, MeasureResult};
use crate::expr::{
    BinaryOp, Expr, FilterModifier, IterateKind, PeriodFunction, PeriodUnit, RankOrder, RankTies,
    RelationshipRef, TableExpr, UnaryOp,
};
use crate::predicate::{CompareOp, Predicate};
use crate::store::AggregateOp;
use crate::value::Value;
use chrono::NaiveDate;
use std::collections::BTreeSet;

/// Parse formula text into an expression.
///
/// ```
/// use formula_measures::{parse, Expr};
///
/// let expr = parse("DIVIDE([Total Arrests], [Total Crimes], 0)").unwrap();
/// assert!(matches!(expr, Expr::SafeDivide { .. }));
/// ```
pub fn parse(input: &str) -> MeasureResult<Expr> {
    let node = Parser::new(input)?.parse()?;
    Lowering::default().scalar(&node)
}

#[derive(Clone, Debug, PartialEq)]
enum Node {
    Number(f64),
    Text(String),
    /// `{a, b, c}`, only meaningful on the right of `IN`.
    List(Vec<Node>),
    /// A bare name: a table, a variable or a keyword argument such as `DESC`.
    Name(String),
    Measure(String),
    Column {
        table: String,
        column: String,
    },
    Let {
        bindings: Vec<(String, Node)>,
        body: Box<Node>,
    },
    Call {
        name: String,
        args: Vec<Node>,
    },
    Negate(Box<Node>),
    Binary {
        op: Op,
        left: Box<Node>,
        right: Box<Node>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
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
    In,
    And,
    Or,
}

impl Op {
    fn compare(self) -> Option<CompareOp> {
        Some(match self {
            Op::Equals => CompareOp::Equals,
            Op::NotEquals => CompareOp::NotEquals,
            Op::Less => CompareOp::Less,
            Op::LessEquals => CompareOp::LessEquals,
            Op::Greater => CompareOp::Greater,
            Op::GreaterEquals => CompareOp::GreaterEquals,
            _ => return None,
        })
    }

    fn binary(self) -> Option<BinaryOp> {
        Some(match self {
            Op::Add => BinaryOp::Add,
            Op::Subtract => BinaryOp::Subtract,
            Op::Multiply => BinaryOp::Multiply,
            Op::Divide => BinaryOp::Divide,
            Op::Equals => BinaryOp::Equals,
            Op::NotEquals => BinaryOp::NotEquals,
            Op::Less => BinaryOp::Less,
            Op::LessEquals => BinaryOp::LessEquals,
            Op::Greater => BinaryOp::Greater,
            Op::GreaterEquals => BinaryOp::GreaterEquals,
            Op::And => BinaryOp::And,
            Op::Or => BinaryOp::Or,
            Op::In => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Identifier(String),
    BracketIdentifier(String),
    Number(f64),
    String(String),
    Var,
    Return,
    Comma,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Plus,
    Minus,
    Star,
    Slash,
    Equals,
    NotEquals,
    Less,
    LessEquals,
    Greater,
    GreaterEquals,
    In,
    AndAnd,
    OrOr,
    Eof,
}

struct Lexer<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.chars().peekable(),
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn bump(&mut self) -> Option<char> {
        self.chars.next()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn consume_while(&mut self, mut predicate: impl FnMut(char) -> bool) -> String {
        let mut buf = String::new();
        while let Some(ch) = self.peek() {
            if !predicate(ch) {
                break;
            }
            buf.push(ch);
            self.bump();
        }
        buf
    }

    /// Read up to `close`, where a doubled `close` stands for one literal `close`.
    fn delimited(&mut self, close: char, what: &str) -> MeasureResult<String> {
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(MeasureError::Parse(format!("unterminated {what}"))),
                Some(c) if c == close => {
                    if self.eat(close) {
                        out.push(close);
                    } else {
                        return Ok(out);
                    }
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn next_token(&mut self) -> MeasureResult<Token> {
        self.consume_while(char::is_whitespace);
        let Some(ch) = self.bump() else {
            return Ok(Token::Eof);
        };

        let token = match ch {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            ',' => Token::Comma,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '=' => {
                self.eat('=');
                Token::Equals
            }
            '<' if self.eat('=') => Token::LessEquals,
            '<' if self.eat('>') => Token::NotEquals,
            '<' => Token::Less,
            '>' if self.eat('=') => Token::GreaterEquals,
            '>' => Token::Greater,
            '&' if self.eat('&') => Token::AndAnd,
            '|' if self.eat('|') => Token::OrOr,
            '"' => Token::String(self.delimited('"', "string")?),
            '\'' => Token::Identifier(self.delimited('\'', "quoted table name")?),
            '[' => Token::BracketIdentifier(self.delimited(']', "bracketed name")?.trim().to_string()),
            c if c.is_ascii_digit() || c == '.' => {
                let mut text = c.to_string();
                text.push_str(&self.consume_while(|c| c.is_ascii_digit() || c == '.'));
                if matches!(self.peek(), Some('e' | 'E')) {
                    text.extend(self.bump());
                    if matches!(self.peek(), Some('+' | '-')) {
                        text.extend(self.bump());
                    }
                    text.push_str(&self.consume_while(|c| c.is_ascii_digit()));
                }
                let number = text
                    .parse()
                    .map_err(|_| MeasureError::Parse(format!("invalid number {text:?}")))?;
                Token::Number(number)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = c.to_string();
                ident.push_str(&self.consume_while(|c| c.is_alphanumeric() || c == '_' || c == '.'));
                match ident.to_ascii_uppercase().as_str() {
                    "VAR" => Token::Var,
                    "RETURN" => Token::Return,
                    "IN" => Token::In,
                    _ => Token::Identifier(ident),
                }
            }
            other => {
                return Err(MeasureError::Parse(format!(
                    "unexpected character {other:?} in {:?}",
                    self.input
                )))
            }
        };
        Ok(token)
    }
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    lookahead: Token,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> MeasureResult<Self> {
        let mut lexer = Lexer::new(input);
        let lookahead = lexer.next_token()?;
        Ok(Self { lexer, lookahead })
    }

    fn bump(&mut self) -> MeasureResult<Token> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.lookahead, next))
    }

    fn expect(&mut self, token: Token) -> MeasureResult<()> {
        if self.lookahead == token {
            self.bump()?;
            Ok(())
        } else {
            Err(MeasureError::Parse(format!(
                "expected {token:?}, found {:?}",
                self.lookahead
            )))
        }
    }

    fn parse(&mut self) -> MeasureResult<Node> {
        let node = self.parse_expr(0)?;
        if self.lookahead != Token::Eof {
            return Err(MeasureError::Parse(format!(
                "unexpected token {:?}",
                self.lookahead
            )));
        }
        Ok(node)
    }

    fn parse_expr(&mut self, min_prec: u8) -> MeasureResult<Node> {
        let mut left = self.parse_prefix()?;
        while let Some((op, prec)) = self.infix_binding_power() {
            if prec < min_prec {
                break;
            }
            self.bump()?;
            let right = self.parse_expr(prec + 1)?;
            left = Node::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_prefix(&mut self) -> MeasureResult<Node> {
        match self.bump()? {
            Token::Var => self.parse_let(),
            Token::Minus => Ok(Node::Negate(Box::new(self.parse_expr(6)?))),
            Token::Plus => self.parse_expr(6),
            Token::Number(n) => Ok(Node::Number(n)),
            Token::String(s) => Ok(Node::Text(s)),
            Token::BracketIdentifier(name) => Ok(Node::Measure(name)),
            Token::Identifier(ident) => self.parse_ident(ident),
            Token::LParen => {
                let inner = self.parse_expr(0)?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::LBrace => {
                let items = self.parse_items(Token::RBrace)?;
                Ok(Node::List(items))
            }
            other => Err(MeasureError::Parse(format!(
                "unexpected token in expression: {other:?}"
            ))),
        }
    }

    /// Comma separated expressions up to and including `close`.
    fn parse_items(&mut self, close: Token) -> MeasureResult<Vec<Node>> {
        let mut items = Vec::new();
        if self.lookahead != close {
            loop {
                items.push(self.parse_expr(0)?);
                if self.lookahead != Token::Comma {
                    break;
                }
                self.bump()?;
            }
        }
        self.expect(close)?;
        Ok(items)
    }

    fn parse_let(&mut self) -> MeasureResult<Node> {
        let mut bindings = Vec::new();
        loop {
            let name = match self.bump()? {
                Token::Identifier(name) => name,
                other => {
                    return Err(MeasureError::Parse(format!(
                        "expected a variable name after VAR, found {other:?}"
                    )))
                }
            };
            self.expect(Token::Equals)?;
            bindings.push((name, self.parse_expr(0)?));
            if self.lookahead != Token::Var {
                break;
            }
            self.bump()?;
        }
        self.expect(Token::Return)?;
        let body = self.parse_expr(0)?;
        Ok(Node::Let {
            bindings,
            body: Box::new(body),
        })
    }

    fn parse_ident(&mut self, ident: String) -> MeasureResult<Node> {
        match &self.lookahead {
            Token::LParen => {
                self.bump()?;
                let args = self.parse_items(Token::RParen)?;
                Ok(Node::Call {
                    name: ident.to_ascii_uppercase(),
                    args,
                })
            }
            Token::BracketIdentifier(column) => {
                let column = column.clone();
                self.bump()?;
                Ok(Node::Column {
                    table: ident,
                    column,
                })
            }
            _ => Ok(Node::Name(ident)),
        }
    }

    fn infix_binding_power(&self) -> Option<(Op, u8)> {
        // Higher binds tighter: `* /` > `+ -` > comparisons > `&&` > `||`.
        Some(match self.lookahead {
            Token::OrOr => (Op::Or, 1),
            Token::AndAnd => (Op::And, 2),
            Token::Equals => (Op::Equals, 3),
            Token::NotEquals => (Op::NotEquals, 3),
            Token::Less => (Op::Less, 3),
            Token::LessEquals => (Op::LessEquals, 3),
            Token::Greater => (Op::Greater, 3),
            Token::GreaterEquals => (Op::GreaterEquals, 3),
            Token::In => (Op::In, 3),
            Token::Plus => (Op::Add, 4),
            Token::Minus => (Op::Subtract, 4),
            Token::Star => (Op::Multiply, 5),
            Token::Slash => (Op::Divide, 5),
            _ => return None,
        })
    }
}

/// Turns the syntax tree into an [`Expr`]. Tracks the variables in scope so bare names can be told
/// apart from table names.
#[derive(Default)]
struct Lowering {
    scope: Vec<String>,
    switches: usize,
}

fn parse_error(message: impl Into<String>) -> MeasureError {
    MeasureError::Parse(message.into())
}

fn arity(name: &str, args: &[Node], min: usize, max: usize) -> MeasureResult<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else if max == usize::MAX {
            format!("at least {min}")
        } else {
            format!("{min} to {max}")
        };
        return Err(parse_error(format!(
            "{name} takes {expected} arguments, got {}",
            args.len()
        )));
    }
    Ok(())
}

fn column_arg<'n>(function: &str, node: &'n Node) -> MeasureResult<(&'n str, &'n str)> {
    match node {
        Node::Column { table, column } => Ok((table, column)),
        other => Err(parse_error(format!(
            "{function} expects a Table[Column] reference, got {other:?}"
        ))),
    }
}

fn table_name<'n>(function: &str, node: &'n Node) -> MeasureResult<&'n str> {
    match node {
        Node::Name(name) => Ok(name),
        other => Err(parse_error(format!(
            "{function} expects a table name, got {other:?}"
        ))),
    }
}

fn keyword(node: &Node) -> Option<String> {
    match node {
        Node::Name(name) => Some(name.to_ascii_uppercase()),
        _ => None,
    }
}

fn period_unit(node: &Node) -> MeasureResult<PeriodUnit> {
    match keyword(node).as_deref() {
        Some("DAY") => Ok(PeriodUnit::Day),
        Some("MONTH") => Ok(PeriodUnit::Month),
        Some("QUARTER") => Ok(PeriodUnit::Quarter),
        Some("YEAR") => Ok(PeriodUnit::Year),
        _ => Err(parse_error(format!(
            "expected DAY, MONTH, QUARTER or YEAR, got {node:?}"
        ))),
    }
}

fn integer(node: &Node) -> Option<i64> {
    match node {
        Node::Number(n) if n.fract() == 0.0 => Some(*n as i64),
        Node::Negate(inner) => integer(inner).map(|n| -n),
        _ => None,
    }
}

/// A literal value usable inside a store predicate.
fn constant(node: &Node) -> Option<Value> {
    match node {
        Node::Number(n) => Some(Value::from(*n)),
        Node::Text(s) => Some(Value::from(s.as_str())),
        Node::Negate(inner) => match constant(inner)? {
            Value::Number(n) => Some(Value::from(-n.into_inner())),
            _ => None,
        },
        Node::Call { name, args } => match (name.as_str(), args.as_slice()) {
            ("TRUE", []) => Some(Value::Boolean(true)),
            ("FALSE", []) => Some(Value::Boolean(false)),
            ("BLANK", []) => Some(Value::Blank),
            ("DATE", [y, m, d]) => {
                let (y, m, d) = (integer(y)?, integer(m)?, integer(d)?);
                NaiveDate::from_ymd_opt(
                    i32::try_from(y).ok()?,
                    u32::try_from(m).ok()?,
                    u32::try_from(d).ok()?,
                )
                .map(Value::Date)
            }
            _ => None,
        },
        _ => None,
    }
}

/// Translate a boolean condition into a single-table store predicate, if it only compares columns
/// of one table against constants.
fn predicate(node: &Node) -> Option<(String, Predicate)> {
    match node {
        Node::Binary { op: Op::In, left, right } => {
            let (Node::Column { table, column }, Node::List(items)) = (&**left, &**right) else {
                return None;
            };
            let values = items.iter().map(constant).collect::<Option<Vec<_>>>()?;
            Some((table.clone(), Predicate::in_values(column.as_str(), values)))
        }
        Node::Binary {
            op: op @ (Op::And | Op::Or),
            left,
            right,
        } => {
            let (lt, lp) = predicate(left)?;
            let (rt, rp) = predicate(right)?;
            if lt != rt {
                return None;
            }
            let combined = if *op == Op::And {
                Predicate::all([lp, rp])
            } else {
                Predicate::any([lp, rp])
            };
            Some((lt, combined))
        }
        Node::Binary { op, left, right } => {
            let cmp = op.compare()?;
            match (&**left, &**right) {
                (Node::Column { table, column }, other) => {
                    Some((table.clone(), Predicate::compare(column.as_str(), cmp, constant(other)?)))
                }
                (other, Node::Column { table, column }) => Some((
                    table.clone(),
                    Predicate::compare(column.as_str(), cmp.flipped(), constant(other)?),
                )),
                _ => None,
            }
        }
        Node::Call { name, args } if name == "NOT" && args.len() == 1 => {
            let (table, inner) = predicate(&args[0])?;
            Some((table, inner.negate()))
        }
        _ => None,
    }
}

fn all_root(table: &TableExpr) -> Option<&str> {
    match table {
        TableExpr::All(name) => Some(name),
        TableExpr::Filter { source, .. } => all_root(source),
        TableExpr::Table(_) | TableExpr::Period(_) => None,
    }
}

/// Every `Table[Column]` mentioned in `node`.
fn columns<'n>(node: &'n Node, out: &mut BTreeSet<(&'n str, &'n str)>) {
    match node {
        Node::Column { table, column } => {
            out.insert((table.as_str(), column.as_str()));
        }
        Node::List(items) | Node::Call { args: items, .. } => {
            for item in items {
                columns(item, out);
            }
        }
        Node::Let { bindings, body } => {
            for (_, value) in bindings {
                columns(value, out);
            }
            columns(body, out);
        }
        Node::Negate(inner) => columns(inner, out),
        Node::Binary { left, right, .. } => {
            columns(left, out);
            columns(right, out);
        }
        Node::Number(_) | Node::Text(_) | Node::Name(_) | Node::Measure(_) => {}
    }
}

impl Lowering {
    fn scalar(&mut self, node: &Node) -> MeasureResult<Expr> {
        match node {
            Node::Number(n) => Ok(Expr::number(*n)),
            Node::Text(s) => Ok(Expr::literal(s.as_str())),
            Node::Measure(name) => Ok(Expr::measure(name.as_str())),
            Node::Column { table, column } => Ok(Expr::column(table.as_str(), column.as_str())),
            Node::Name(name) => {
                let var = name.to_uppercase();
                if self.scope.contains(&var) {
                    Ok(Expr::var(var))
                } else {
                    Err(parse_error(format!(
                        "{name} is not a variable; tables cannot be used as values"
                    )))
                }
            }
            Node::List(_) => Err(parse_error("a {...} list is only valid after IN")),
            Node::Let { bindings, body } => {
                let depth = self.scope.len();
                let mut lowered = Vec::with_capacity(bindings.len());
                for (name, value) in bindings {
                    let value = self.scalar(value)?;
                    let name = name.to_uppercase();
                    self.scope.push(name.clone());
                    lowered.push((name, value));
                }
                let body = self.scalar(body);
                self.scope.truncate(depth);
                Ok(Expr::Let {
                    bindings: lowered,
                    body: Box::new(body?),
                })
            }
            Node::Negate(inner) => match constant(node) {
                Some(value) => Ok(Expr::Literal(value)),
                None => Ok(Expr::unary(UnaryOp::Negate, self.scalar(inner)?)),
            },
            Node::Binary {
                op: Op::In,
                left,
                right,
            } => {
                let Node::List(items) = &**right else {
                    return Err(parse_error("IN expects a {...} list"));
                };
                let needle = self.scalar(left)?;
                let mut alternatives = Vec::with_capacity(items.len());
                for item in items {
                    alternatives.push(Expr::binary(BinaryOp::Equals, needle.clone(), self.scalar(item)?));
                }
                Ok(alternatives
                    .into_iter()
                    .reduce(|acc, next| Expr::binary(BinaryOp::Or, acc, next))
                    .unwrap_or(Expr::literal(false)))
            }
            Node::Binary { op, left, right } => {
                let op = op
                    .binary()
                    .ok_or_else(|| parse_error(format!("unsupported operator {op:?}")))?;
                Ok(Expr::binary(op, self.scalar(left)?, self.scalar(right)?))
            }
            Node::Call { name, args } => self.call(name, args),
        }
    }

    fn call(&mut self, name: &str, args: &[Node]) -> MeasureResult<Expr> {
        let aggregate = |op: AggregateOp| -> MeasureResult<Expr> {
            arity(name, args, 1, 1)?;
            let (table, column) = column_arg(name, &args[0])?;
            Ok(Expr::aggregate(op, table, Some(column), None))
        };
        let iterate = |this: &mut Self, kind: IterateKind| -> MeasureResult<Expr> {
            arity(name, args, 2, 2)?;
            let table = this.table(&args[0])?;
            Ok(Expr::iterate(kind, table, this.scalar(&args[1])?))
        };
        let to_date = |this: &mut Self, unit: PeriodUnit| -> MeasureResult<Expr> {
            arity(name, args, 2, 2)?;
            column_arg(name, &args[1])?;
            Ok(Expr::calculate(
                this.scalar(&args[0])?,
                vec![FilterModifier::Period(PeriodFunction::ToDate(unit))],
            ))
        };

        match name {
            "TRUE" | "FALSE" | "BLANK" | "DATE" => constant(&Node::Call {
                name: name.to_string(),
                args: args.to_vec(),
            })
            .map(Expr::Literal)
            .ok_or_else(|| parse_error(format!("invalid {name}(...) literal"))),
            "IF" => {
                arity(name, args, 2, 3)?;
                let condition = self.scalar(&args[0])?;
                let then = self.scalar(&args[1])?;
                let otherwise = args.get(2).map(|a| self.scalar(a)).transpose()?;
                Ok(Expr::conditional(vec![(condition, then)], otherwise))
            }
            "SWITCH" => self.switch(args),
            "DIVIDE" => {
                arity(name, args, 2, 3)?;
                let default = match args.get(2) {
                    Some(alt) => self.scalar(alt)?,
                    None => Expr::blank(),
                };
                Ok(Expr::safe_divide(
                    self.scalar(&args[0])?,
                    self.scalar(&args[1])?,
                    default,
                ))
            }
            "ISBLANK" | "NOT" => {
                arity(name, args, 1, 1)?;
                let op = if name == "NOT" { UnaryOp::Not } else { UnaryOp::IsBlank };
                Ok(Expr::unary(op, self.scalar(&args[0])?))
            }
            "SUM" => aggregate(AggregateOp::Sum),
            "AVERAGE" => aggregate(AggregateOp::Average),
            "MIN" => aggregate(AggregateOp::Min),
            "MAX" | "LASTDATE" => aggregate(AggregateOp::Max),
            "FIRSTDATE" => aggregate(AggregateOp::Min),
            "COUNT" => aggregate(AggregateOp::Count),
            "DISTINCTCOUNT" => aggregate(AggregateOp::DistinctCount),
            "COUNTROWS" => {
                arity(name, args, 1, 1)?;
                self.count_rows(&args[0])
            }
            "SUMX" => iterate(self, IterateKind::Sum),
            "AVERAGEX" => iterate(self, IterateKind::Average),
            "MINX" => iterate(self, IterateKind::Min),
            "MAXX" => iterate(self, IterateKind::Max),
            "COUNTX" => iterate(self, IterateKind::Count),
            "RANKX" => self.rankx(args),
            "CALCULATE" => {
                arity(name, args, 1, usize::MAX)?;
                let mut modifiers = Vec::new();
                for arg in &args[1..] {
                    modifiers.extend(self.modifier(arg)?);
                }
                Ok(Expr::calculate(self.scalar(&args[0])?, modifiers))
            }
            "SELECTEDVALUE" => {
                arity(name, args, 1, 2)?;
                let (table, column) = column_arg(name, &args[0])?;
                let alternate = args.get(1).map(|a| self.scalar(a)).transpose()?;
                Ok(Expr::SelectedValue {
                    table: table.to_string(),
                    column: column.to_string(),
                    alternate: alternate.map(Box::new),
                })
            }
            "TOTALMTD" => to_date(self, PeriodUnit::Month),
            "TOTALQTD" => to_date(self, PeriodUnit::Quarter),
            "TOTALYTD" => to_date(self, PeriodUnit::Year),
            other => Err(parse_error(format!("unknown function {other}"))),
        }
    }

    /// `SWITCH(value, match1, result1, ..., [else])`. The value is bound once and compared against
    /// each match in order.
    fn switch(&mut self, args: &[Node]) -> MeasureResult<Expr> {
        arity("SWITCH", args, 3, usize::MAX)?;
        let subject = self.scalar(&args[0])?;
        self.switches += 1;
        let var = format!("SWITCH#{}", self.switches);

        let mut rest = &args[1..];
        let mut branches = Vec::new();
        while let [when, then, tail @ ..] = rest {
            let test = Expr::binary(BinaryOp::Equals, Expr::var(var.as_str()), self.scalar(when)?);
            branches.push((test, self.scalar(then)?));
            rest = tail;
        }
        let default = rest.first().map(|d| self.scalar(d)).transpose()?;
        Ok(Expr::Let {
            bindings: vec![(var, subject)],
            body: Box::new(Expr::conditional(branches, default)),
        })
    }

    fn count_rows(&mut self, arg: &Node) -> MeasureResult<Expr> {
        if let Node::Call { name, args } = arg {
            if name == "FILTER" {
                arity(name, args, 2, 2)?;
                if let Node::Name(table) = &args[0] {
                    if let Some((pred_table, pred)) = predicate(&args[1]) {
                        if pred_table == *table {
                            return Ok(Expr::aggregate(
                                AggregateOp::CountRows,
                                table.as_str(),
                                None,
                                Some(pred),
                            ));
                        }
                    }
                }
            }
        }
        match self.table(arg)? {
            TableExpr::Table(table) => Ok(Expr::count_rows(table)),
            TableExpr::All(table) => Ok(Expr::calculate(
                Expr::count_rows(table.as_str()),
                vec![FilterModifier::All(vec![table])],
            )),
            other => Ok(Expr::iterate(IterateKind::Count, other, Expr::number(1.0))),
        }
    }

    fn rankx(&mut self, args: &[Node]) -> MeasureResult<Expr> {
        arity("RANKX", args, 2, 4)?;
        let table = self.table(&args[0])?;
        let expr = self.scalar(&args[1])?;
        let order = match args.get(2).map(keyword) {
            None => RankOrder::default(),
            Some(Some(k)) if k == "DESC" => RankOrder::Descending,
            Some(Some(k)) if k == "ASC" => RankOrder::Ascending,
            Some(_) => return Err(parse_error("RANKX order must be ASC or DESC")),
        };
        let ties = match args.get(3).map(keyword) {
            None => RankTies::default(),
            Some(Some(k)) if k == "DENSE" => RankTies::Dense,
            Some(Some(k)) if k == "SKIP" => RankTies::Skip,
            Some(_) => return Err(parse_error("RANKX ties must be DENSE or SKIP")),
        };
        Ok(Expr::rank(table, expr, order, ties))
    }

    fn table(&mut self, node: &Node) -> MeasureResult<TableExpr> {
        if let Node::Name(name) = node {
            return Ok(TableExpr::Table(name.clone()));
        }
        let Node::Call { name, args } = node else {
            return Err(parse_error(format!("expected a table, got {node:?}")));
        };
        if let Some(function) = self.period(name, args)? {
            return Ok(TableExpr::Period(function));
        }
        match name.as_str() {
            "ALL" => {
                arity(name, args, 1, 1)?;
                Ok(TableExpr::All(table_name(name, &args[0])?.to_string()))
            }
            "FILTER" => {
                arity(name, args, 2, 2)?;
                let source = self.table(&args[0])?;
                Ok(TableExpr::Filter {
                    source: Box::new(source),
                    predicate: Box::new(self.scalar(&args[1])?),
                })
            }
            other => Err(parse_error(format!("{other} does not return a table"))),
        }
    }

    /// Date-table functions. Returns `None` when `name` is not one of them.
    fn period(&self, name: &str, args: &[Node]) -> MeasureResult<Option<PeriodFunction>> {
        let single = |unit_fn: fn(PeriodUnit) -> PeriodFunction, unit| -> MeasureResult<_> {
            arity(name, args, 1, 1)?;
            column_arg(name, &args[0])?;
            Ok(Some(unit_fn(unit)))
        };
        match name {
            "DATESMTD" => single(PeriodFunction::ToDate, PeriodUnit::Month),
            "DATESQTD" => single(PeriodFunction::ToDate, PeriodUnit::Quarter),
            "DATESYTD" => single(PeriodFunction::ToDate, PeriodUnit::Year),
            "PREVIOUSDAY" => single(PeriodFunction::Previous, PeriodUnit::Day),
            "PREVIOUSMONTH" => single(PeriodFunction::Previous, PeriodUnit::Month),
            "PREVIOUSQUARTER" => single(PeriodFunction::Previous, PeriodUnit::Quarter),
            "PREVIOUSYEAR" => single(PeriodFunction::Previous, PeriodUnit::Year),
            "SAMEPERIODLASTYEAR" => {
                arity(name, args, 1, 1)?;
                column_arg(name, &args[0])?;
                Ok(Some(PeriodFunction::same_period_last_year()))
            }
            "DATEADD" => {
                arity(name, args, 3, 3)?;
                column_arg(name, &args[0])?;
                let count = integer(&args[1])
                    .and_then(|n| i32::try_from(n).ok())
                    .ok_or_else(|| parse_error("DATEADD expects a whole number of intervals"))?;
                Ok(Some(PeriodFunction::Shift {
                    count,
                    unit: period_unit(&args[2])?,
                }))
            }
            "DATESINPERIOD" => {
                arity(name, args, 4, 4)?;
                let (table, column) = column_arg(name, &args[0])?;
                match &args[1] {
                    Node::Call { name: anchor, args: anchor_args }
                        if matches!(anchor.as_str(), "MAX" | "LASTDATE")
                            && anchor_args.len() == 1
                            && column_arg(anchor, &anchor_args[0])? == (table, column) => {}
                    other => {
                        return Err(parse_error(format!(
                            "DATESINPERIOD must end at MAX({table}[{column}]), got {other:?}"
                        )))
                    }
                }
                let count = integer(&args[2])
                    .filter(|n| *n <= 0)
                    .and_then(|n| u32::try_from(-n).ok())
                    .ok_or_else(|| {
                        parse_error("DATESINPERIOD expects a negative whole number of intervals")
                    })?;
                Ok(Some(PeriodFunction::Trailing {
                    count,
                    unit: period_unit(&args[3])?,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Lower one `CALCULATE` filter argument. A boolean condition the store cannot evaluate
    /// directly becomes a row filter over the whole table that replaces the referenced columns.
    fn modifier(&mut self, node: &Node) -> MeasureResult<Vec<FilterModifier>> {
        if let Node::Call { name, args } = node {
            if let Some(function) = self.period(name, args)? {
                return Ok(vec![FilterModifier::Period(function)]);
            }
            match name.as_str() {
                "ALL" | "REMOVEFILTERS" => return self.remove_filters(name, args),
                "ALLEXCEPT" => {
                    arity(name, args, 2, usize::MAX)?;
                    let table = table_name(name, &args[0])?;
                    let mut keep = Vec::new();
                    for arg in &args[1..] {
                        let (t, column) = column_arg(name, arg)?;
                        if t != table {
                            return Err(parse_error(format!(
                                "ALLEXCEPT columns must belong to {table}"
                            )));
                        }
                        keep.push(column.to_string());
                    }
                    return Ok(vec![FilterModifier::AllExcept {
                        table: table.to_string(),
                        keep,
                    }]);
                }
                "KEEPFILTERS" => {
                    arity(name, args, 1, 1)?;
                    let (table, predicate) = predicate(&args[0]).ok_or_else(|| {
                        parse_error("KEEPFILTERS expects column comparisons against constants")
                    })?;
                    return Ok(vec![FilterModifier::Restrict { table, predicate }]);
                }
                "USERELATIONSHIP" => {
                    arity(name, args, 1, 2)?;
                    if let [Node::Name(relationship) | Node::Text(relationship)] = args.as_slice() {
                        return Ok(vec![FilterModifier::UseRelationship(RelationshipRef::Named(
                            relationship.clone(),
                        ))]);
                    }
                    arity(name, args, 2, 2)?;
                    let (left_table, left_column) = column_arg(name, &args[0])?;
                    let (right_table, right_column) = column_arg(name, &args[1])?;
                    return Ok(vec![FilterModifier::UseRelationship(RelationshipRef::Columns {
                        left_table: left_table.to_string(),
                        left_column: left_column.to_string(),
                        right_table: right_table.to_string(),
                        right_column: right_column.to_string(),
                    })]);
                }
                "FILTER" => {
                    // A filter over ALL(table) replaces every restriction on that table.
                    let table = self.table(node)?;
                    let mut modifiers = Vec::with_capacity(2);
                    if let Some(cleared) = all_root(&table) {
                        modifiers.push(FilterModifier::All(vec![cleared.to_string()]));
                    }
                    modifiers.push(FilterModifier::Table(table));
                    return Ok(modifiers);
                }
                _ => {}
            }
        }
        if let Node::Name(_) = node {
            return Ok(vec![FilterModifier::Table(self.table(node)?)]);
        }

        if let Some((table, predicate)) = predicate(node) {
            return Ok(vec![FilterModifier::Override { table, predicate }]);
        }

        let mut referenced = BTreeSet::new();
        columns(node, &mut referenced);
        let tables: Vec<&str> = referenced
            .iter()
            .map(|(t, _)| *t)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let &[table] = tables.as_slice() else {
            return Err(parse_error(
                "a CALCULATE condition must reference columns of exactly one table",
            ));
        };
        let condition = self.scalar(node)?;
        Ok(vec![
            FilterModifier::AllColumns {
                table: table.to_string(),
                columns: referenced.iter().map(|(_, c)| c.to_string()).collect(),
            },
            FilterModifier::Table(TableExpr::Filter {
                source: Box::new(TableExpr::All(table.to_string())),
                predicate: Box::new(condition),
            }),
        ])
    }

    fn remove_filters(&mut self, name: &str, args: &[Node]) -> MeasureResult<Vec<FilterModifier>> {
        arity(name, args, 1, usize::MAX)?;
        if args.iter().all(|a| matches!(a, Node::Name(_))) {
            let tables = args
                .iter()
                .map(|a| table_name(name, a).map(String::from))
                .collect::<MeasureResult<Vec<_>>>()?;
            return Ok(vec![FilterModifier::All(tables)]);
        }
        let (table, _) = column_arg(name, &args[0])?;
        let mut cleared = Vec::with_capacity(args.len());
        for arg in args {
            let (t, column) = column_arg(name, arg)?;
            if t != table {
                return Err(parse_error(format!(
                    "{name} columns must all belong to one table"
                )));
            }
            cleared.push(column.to_string());
        }
        Ok(vec![FilterModifier::AllColumns {
            table: table.to_string(),
            columns: cleared,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_quoted_names_and_operators() {
        let mut lexer = Lexer::new("'Crime Type'[Primary Type] <> \"THEFT\" && x >= 1e3");
        let mut tokens = Vec::new();
        loop {
            let token = lexer.next_token().unwrap();
            if token == Token::Eof {
                break;
            }
            tokens.push(token);
        }
        assert_eq!(
            tokens,
            vec![
                Token::Identifier("Crime Type".into()),
                Token::BracketIdentifier("Primary Type".into()),
                Token::NotEquals,
                Token::String("THEFT".into()),
                Token::AndAnd,
                Token::Identifier("x".into()),
                Token::GreaterEquals,
                Token::Number(1000.0),
            ]
        );
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let expr = parse("1 + 2 * 3").unwrap();
        assert_eq!(
            expr,
            Expr::binary(
                BinaryOp::Add,
                Expr::number(1.0),
                Expr::binary(BinaryOp::Multiply, Expr::number(2.0), Expr::number(3.0)),
            )
        );
    }

    #[test]
    fn column_comparisons_become_store_predicates() {
        let node = Parser::new("2 < Crimes[Response Minutes]").unwrap().parse().unwrap();
        assert_eq!(
            predicate(&node),
            Some((
                "Crimes".to_string(),
                Predicate::compare("Response Minutes", CompareOp::Greater, 2.0)
            ))
        );
    }
}
