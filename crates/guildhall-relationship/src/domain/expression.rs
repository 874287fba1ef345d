//! A small sandboxed expression language for relationship rules.
//!
//! Supports number, string and boolean literals, dotted field lookups into
//! the event context, `current_strength`, the arithmetic operators
//! `+ - * / %`, comparisons, `&& || !` (or `and or not`) and the builtins
//! `min`, `max` and `abs`. Expressions are parsed once when a rule is
//! loaded and interpreted by walking the tree; there is no access to
//! anything outside the scope they are evaluated in.

use std::fmt;

use guildhall_core::error::DomainError;
use guildhall_core::ports::EventContext;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name bound to the record's strength before the change.
pub const CURRENT_STRENGTH: &str = "current_strength";

const MAX_DEPTH: usize = 64;

/// Errors from compiling or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    /// A character that starts no token.
    #[error("unexpected character {found:?} at {position}")]
    UnexpectedChar {
        /// The character.
        found: char,
        /// Byte offset.
        position: usize,
    },

    /// A string literal without its closing quote.
    #[error("unterminated string starting at {0}")]
    UnterminatedString(usize),

    /// A token where another was expected.
    #[error("unexpected {found} at {position}")]
    UnexpectedToken {
        /// The token, as text.
        found: String,
        /// Byte offset.
        position: usize,
    },

    /// The expression stopped early.
    #[error("unexpected end of expression")]
    UnexpectedEnd,

    /// Nesting beyond the supported depth.
    #[error("expression nested deeper than {MAX_DEPTH} levels")]
    TooDeep,

    /// A call to a function that is not a builtin.
    #[error("unknown function {0}")]
    UnknownFunction(String),

    /// A builtin called with the wrong number of arguments.
    #[error("{function} takes {expected} argument(s), got {found}")]
    Arity {
        /// Function name.
        function: &'static str,
        /// What it accepts.
        expected: &'static str,
        /// What it received.
        found: usize,
    },

    /// A field that is not in scope.
    #[error("unknown field {0}")]
    UnknownField(String),

    /// An operator applied to the wrong kind of value.
    #[error("type error: {0}")]
    Type(String),

    /// Division or remainder by zero.
    #[error("division by zero")]
    DivisionByZero,
}

impl From<ExpressionError> for DomainError {
    fn from(error: ExpressionError) -> Self {
        DomainError::Validation(format!("expression error: {error}"))
    }
}

/// A value produced while evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    /// Any number.
    Number(f64),
    /// A string.
    Text(String),
    /// A boolean.
    Bool(bool),
    /// JSON `null`.
    Null,
}

impl ExprValue {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::Text(_) => "string",
            Self::Bool(_) => "bool",
            Self::Null => "null",
        }
    }

    fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_f64().map(Self::Number),
            serde_json::Value::String(s) => Some(Self::Text(s.clone())),
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Null => Some(Self::Null),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }
}

/// Where field lookups are resolved.
pub trait Scope {
    /// Resolves a dotted path such as `player.level`.
    fn lookup(&self, path: &str) -> Option<ExprValue>;
}

/// The scope rules are evaluated in: the event context plus the strength
/// of the record being changed.
#[derive(Debug, Clone, Copy)]
pub struct EventScope<'a> {
    context: &'a EventContext,
    current_strength: f64,
}

impl<'a> EventScope<'a> {
    /// Creates a scope over `context`.
    #[must_use]
    pub fn new(context: &'a EventContext, current_strength: f64) -> Self {
        Self {
            context,
            current_strength,
        }
    }
}

impl Scope for EventScope<'_> {
    fn lookup(&self, path: &str) -> Option<ExprValue> {
        if path == CURRENT_STRENGTH {
            return Some(ExprValue::Number(self.current_strength));
        }
        let mut segments = path.split('.');
        let mut value = self.context.get(segments.next()?)?;
        for segment in segments {
            value = value.get(segment)?;
        }
        ExprValue::from_json(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Text(String),
    Bool(bool),
    Ident(String),
    Op(Op),
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "number {n}"),
            Self::Text(s) => write!(f, "string {s:?}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Ident(name) => write!(f, "identifier {name}"),
            Self::Op(op) => write!(f, "operator {op:?}"),
            Self::LParen => f.write_str("'('"),
            Self::RParen => f.write_str("')'"),
            Self::Comma => f.write_str("','"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(position, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c.is_ascii_digit() || c == '.' {
            let mut end = position;
            let mut seen_dot = false;
            while let Some(&(i, d)) = chars.peek() {
                if d.is_ascii_digit() || (d == '.' && !seen_dot) {
                    seen_dot |= d == '.';
                    end = i + d.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let literal = &source[position..end];
            let number = literal
                .parse::<f64>()
                .map_err(|_| ExpressionError::UnexpectedToken {
                    found: literal.to_owned(),
                    position,
                })?;
            tokens.push((Token::Number(number), position));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let mut end = position;
            while let Some(&(i, d)) = chars.peek() {
                if d.is_alphanumeric() || d == '_' || d == '.' {
                    end = i + d.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let word = &source[position..end];
            let token = match word {
                "true" => Token::Bool(true),
                "false" => Token::Bool(false),
                "and" => Token::Op(Op::And),
                "or" => Token::Op(Op::Or),
                "not" => Token::Op(Op::Not),
                _ => Token::Ident(word.to_owned()),
            };
            tokens.push((token, position));
            continue;
        }

        if c == '\'' || c == '"' {
            chars.next();
            let mut text = String::new();
            let mut closed = false;
            while let Some((_, d)) = chars.next() {
                match d {
                    '\\' => match chars.next() {
                        Some((_, escaped)) => text.push(escaped),
                        None => break,
                    },
                    d if d == c => {
                        closed = true;
                        break;
                    }
                    d => text.push(d),
                }
            }
            if !closed {
                return Err(ExpressionError::UnterminatedString(position));
            }
            tokens.push((Token::Text(text), position));
            continue;
        }

        chars.next();
        let next = chars.peek().map(|&(_, d)| d);
        let (token, double) = match (c, next) {
            ('<', Some('=')) => (Token::Op(Op::Le), true),
            ('>', Some('=')) => (Token::Op(Op::Ge), true),
            ('=', Some('=')) => (Token::Op(Op::Eq), true),
            ('!', Some('=')) => (Token::Op(Op::Ne), true),
            ('&', Some('&')) => (Token::Op(Op::And), true),
            ('|', Some('|')) => (Token::Op(Op::Or), true),
            ('<', _) => (Token::Op(Op::Lt), false),
            ('>', _) => (Token::Op(Op::Gt), false),
            ('!', _) => (Token::Op(Op::Not), false),
            ('+', _) => (Token::Op(Op::Add), false),
            ('-', _) => (Token::Op(Op::Sub), false),
            ('*', _) => (Token::Op(Op::Mul), false),
            ('/', _) => (Token::Op(Op::Div), false),
            ('%', _) => (Token::Op(Op::Rem), false),
            ('(', _) => (Token::LParen, false),
            (')', _) => (Token::RParen, false),
            (',', _) => (Token::Comma, false),
            (found, _) => return Err(ExpressionError::UnexpectedChar { found, position }),
        };
        if double {
            chars.next();
        }
        tokens.push((token, position));
    }

    Ok(tokens)
}

/// A binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `&&`, `and`
    And,
    /// `||`, `or`
    Or,
}

/// A unary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-`
    Neg,
    /// `!`, `not`
    Not,
}

/// A builtin function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// Smallest argument.
    Min,
    /// Largest argument.
    Max,
    /// Absolute value.
    Abs,
}

impl Builtin {
    fn resolve(name: &str, args: usize) -> Result<Self, ExpressionError> {
        let builtin = match name {
            "min" => Self::Min,
            "max" => Self::Max,
            "abs" => Self::Abs,
            other => return Err(ExpressionError::UnknownFunction(other.to_owned())),
        };
        let (ok, expected) = match builtin {
            Self::Min | Self::Max => (args >= 1, "at least 1"),
            Self::Abs => (args == 1, "exactly 1"),
        };
        if !ok {
            return Err(ExpressionError::Arity {
                function: builtin.name(),
                expected,
                found: args,
            });
        }
        Ok(builtin)
    }

    fn name(self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Abs => "abs",
        }
    }
}

/// The parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal value.
    Literal(ExprValue),
    /// A dotted field lookup.
    Field(String),
    /// A unary operation.
    Unary(UnaryOp, Box<Expr>),
    /// A binary operation.
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// A builtin call.
    Call(Builtin, Vec<Expr>),
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(token, _)| token)
    }

    fn next(&mut self) -> Option<(Token, usize)> {
        let item = self.tokens.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ExpressionError> {
        match self.next() {
            Some((token, _)) if &token == expected => Ok(()),
            Some((token, position)) => Err(ExpressionError::UnexpectedToken {
                found: token.to_string(),
                position,
            }),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }

    fn descend(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExpressionError::TooDeep);
        }
        Ok(())
    }

    fn binary_level(
        &mut self,
        ops: &[(Op, BinaryOp)],
        operand: fn(&mut Self) -> Result<Expr, ExpressionError>,
    ) -> Result<Expr, ExpressionError> {
        let mut left = operand(self)?;
        let mut folded = 0;
        while let Some(Token::Op(op)) = self.peek() {
            let Some(&(_, binary)) = ops.iter().find(|(candidate, _)| candidate == op) else {
                break;
            };
            self.pos += 1;
            // Each fold nests the tree one level deeper on the left.
            self.descend()?;
            folded += 1;
            let right = operand(self)?;
            left = Expr::Binary(binary, Box::new(left), Box::new(right));
        }
        self.depth -= folded;
        Ok(left)
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(&[(Op::Or, BinaryOp::Or)], Self::and)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(&[(Op::And, BinaryOp::And)], Self::equality)
    }

    fn equality(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(
            &[(Op::Eq, BinaryOp::Eq), (Op::Ne, BinaryOp::Ne)],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(
            &[
                (Op::Lt, BinaryOp::Lt),
                (Op::Le, BinaryOp::Le),
                (Op::Gt, BinaryOp::Gt),
                (Op::Ge, BinaryOp::Ge),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(
            &[(Op::Add, BinaryOp::Add), (Op::Sub, BinaryOp::Sub)],
            Self::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        self.binary_level(
            &[
                (Op::Mul, BinaryOp::Mul),
                (Op::Div, BinaryOp::Div),
                (Op::Rem, BinaryOp::Rem),
            ],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        let op = match self.peek() {
            Some(Token::Op(Op::Sub)) => UnaryOp::Neg,
            Some(Token::Op(Op::Not)) => UnaryOp::Not,
            _ => return self.primary(),
        };
        self.pos += 1;
        self.descend()?;
        let operand = self.unary()?;
        self.depth -= 1;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let (token, position) = self.next().ok_or(ExpressionError::UnexpectedEnd)?;
        match token {
            Token::Number(n) => Ok(Expr::Literal(ExprValue::Number(n))),
            Token::Text(s) => Ok(Expr::Literal(ExprValue::Text(s))),
            Token::Bool(b) => Ok(Expr::Literal(ExprValue::Bool(b))),
            Token::Ident(name) if self.peek() == Some(&Token::LParen) => {
                self.pos += 1;
                self.descend()?;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.or()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Token::RParen)?;
                self.depth -= 1;
                let builtin = Builtin::resolve(&name, args.len())?;
                Ok(Expr::Call(builtin, args))
            }
            Token::Ident(name) => Ok(Expr::Field(name)),
            Token::LParen => {
                self.descend()?;
                let inner = self.or()?;
                self.expect(&Token::RParen)?;
                self.depth -= 1;
                Ok(inner)
            }
            other => Err(ExpressionError::UnexpectedToken {
                found: other.to_string(),
                position,
            }),
        }
    }
}

fn number(value: &ExprValue, context: &str) -> Result<f64, ExpressionError> {
    match value {
        ExprValue::Number(n) => Ok(*n),
        other => Err(ExpressionError::Type(format!(
            "{context} expects a number, got {}",
            other.type_name()
        ))),
    }
}

fn boolean(value: &ExprValue, context: &str) -> Result<bool, ExpressionError> {
    match value {
        ExprValue::Bool(b) => Ok(*b),
        other => Err(ExpressionError::Type(format!(
            "{context} expects a bool, got {}",
            other.type_name()
        ))),
    }
}

fn numeric(op: BinaryOp, a: f64, b: f64) -> Result<ExprValue, ExpressionError> {
    let value = match op {
        BinaryOp::Add => ExprValue::Number(a + b),
        BinaryOp::Sub => ExprValue::Number(a - b),
        BinaryOp::Mul => ExprValue::Number(a * b),
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return Err(ExpressionError::DivisionByZero),
        BinaryOp::Div => ExprValue::Number(a / b),
        BinaryOp::Rem => ExprValue::Number(a % b),
        BinaryOp::Lt => ExprValue::Bool(a < b),
        BinaryOp::Le => ExprValue::Bool(a <= b),
        BinaryOp::Gt => ExprValue::Bool(a > b),
        BinaryOp::Ge => ExprValue::Bool(a >= b),
        BinaryOp::And | BinaryOp::Or | BinaryOp::Eq | BinaryOp::Ne => {
            return Err(ExpressionError::Type(format!("{op:?} is not a numeric operator")));
        }
    };
    Ok(value)
}

impl Expr {
    fn mentions(&self, path: &str) -> bool {
        match self {
            Self::Literal(_) => false,
            Self::Field(name) => name == path,
            Self::Unary(_, operand) => operand.mentions(path),
            Self::Binary(_, left, right) => left.mentions(path) || right.mentions(path),
            Self::Call(_, args) => args.iter().any(|arg| arg.mentions(path)),
        }
    }

    fn evaluate(&self, scope: &dyn Scope) -> Result<ExprValue, ExpressionError> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Field(path) => scope
                .lookup(path)
                .ok_or_else(|| ExpressionError::UnknownField(path.clone())),
            Self::Unary(UnaryOp::Neg, operand) => {
                Ok(ExprValue::Number(-number(&operand.evaluate(scope)?, "-")?))
            }
            Self::Unary(UnaryOp::Not, operand) => {
                Ok(ExprValue::Bool(!boolean(&operand.evaluate(scope)?, "!")?))
            }
            Self::Binary(BinaryOp::And, left, right) => {
                if !boolean(&left.evaluate(scope)?, "&&")? {
                    return Ok(ExprValue::Bool(false));
                }
                Ok(ExprValue::Bool(boolean(&right.evaluate(scope)?, "&&")?))
            }
            Self::Binary(BinaryOp::Or, left, right) => {
                if boolean(&left.evaluate(scope)?, "||")? {
                    return Ok(ExprValue::Bool(true));
                }
                Ok(ExprValue::Bool(boolean(&right.evaluate(scope)?, "||")?))
            }
            Self::Binary(BinaryOp::Eq, left, right) => {
                Ok(ExprValue::Bool(left.evaluate(scope)? == right.evaluate(scope)?))
            }
            Self::Binary(BinaryOp::Ne, left, right) => {
                Ok(ExprValue::Bool(left.evaluate(scope)? != right.evaluate(scope)?))
            }
            Self::Binary(op, left, right) => {
                let symbol = format!("{op:?}");
                let a = number(&left.evaluate(scope)?, &symbol)?;
                let b = number(&right.evaluate(scope)?, &symbol)?;
                numeric(*op, a, b)
            }
            Self::Call(builtin, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(number(&arg.evaluate(scope)?, builtin.name())?);
                }
                let result = match builtin {
                    Builtin::Abs => values[0].abs(),
                    Builtin::Min => values.into_iter().fold(f64::INFINITY, f64::min),
                    Builtin::Max => values.into_iter().fold(f64::NEG_INFINITY, f64::max),
                };
                Ok(ExprValue::Number(result))
            }
        }
    }
}

/// A compiled expression, serialized as its source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    /// Parses `source`.
    ///
    /// # Errors
    ///
    /// Returns an `ExpressionError` describing the first syntax error,
    /// unknown builtin or wrong argument count.
    pub fn compile(source: &str) -> Result<Self, ExpressionError> {
        let mut parser = Parser {
            tokens: tokenize(source)?,
            pos: 0,
            depth: 0,
        };
        let root = parser.or()?;
        if let Some((token, position)) = parser.next() {
            return Err(ExpressionError::UnexpectedToken {
                found: token.to_string(),
                position,
            });
        }
        Ok(Self {
            source: source.to_owned(),
            root,
        })
    }

    /// The source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the expression reads the field `path`.
    #[must_use]
    pub fn references(&self, path: &str) -> bool {
        self.root.mentions(path)
    }

    /// Evaluates to any value.
    ///
    /// # Errors
    ///
    /// Returns an `ExpressionError` for unknown fields, type mismatches and
    /// division by zero.
    pub fn evaluate(&self, scope: &dyn Scope) -> Result<ExprValue, ExpressionError> {
        self.root.evaluate(scope)
    }

    /// Evaluates to a finite number.
    ///
    /// # Errors
    ///
    /// As [`Expression::evaluate`], plus a type error for non-numeric or
    /// non-finite results.
    pub fn evaluate_number(&self, scope: &dyn Scope) -> Result<f64, ExpressionError> {
        let value = number(&self.evaluate(scope)?, "formula")?;
        if !value.is_finite() {
            return Err(ExpressionError::Type("formula result is not finite".into()));
        }
        Ok(value)
    }

    /// Evaluates to a boolean.
    ///
    /// # Errors
    ///
    /// As [`Expression::evaluate`], plus a type error for non-boolean
    /// results.
    pub fn evaluate_bool(&self, scope: &dyn Scope) -> Result<bool, ExpressionError> {
        boolean(&self.evaluate(scope)?, "condition")
    }
}

impl TryFrom<String> for Expression {
    type Error = ExpressionError;

    fn try_from(source: String) -> Result<Self, Self::Error> {
        Self::compile(&source)
    }
}

impl From<Expression> for String {
    fn from(expression: Expression) -> Self {
        expression.source
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
