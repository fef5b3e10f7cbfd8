//! Condition Expressions
//!
//! Boolean expressions over process variables, used by conditional start
//! triggers and by conditional sequence flows. Parsed once at definition load
//! with nom; evaluation is a pure walk of the AST against `variables`.
//!
//! ```text
//! order.total > 1000 && (customer.tier == "gold" || !approved)
//! retries >= 3 or status == 'failed'
//! ```

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char, digit1, multispace0, satisfy},
    combinator::{all_consuming, map, map_res, not, opt, peek, recognize},
    multi::{many0, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// A parsed condition together with its source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ConditionParseError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(ConditionParseError {
                expression: source.to_string(),
                message: "expression is empty".to_string(),
            });
        }
        match all_consuming(ws(or_expr))(trimmed) {
            Ok((_, expr)) => Ok(Self {
                source: source.to_string(),
                expr,
            }),
            Err(e) => Err(ConditionParseError {
                expression: source.to_string(),
                message: e.to_string(),
            }),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Evaluate against process variables. Missing variables read as `null`.
    pub fn evaluate(&self, variables: &BTreeMap<String, Value>) -> bool {
        is_truthy(&self.expr.eval(variables))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid condition '{expression}': {message}")]
pub struct ConditionParseError {
    pub expression: String,
    pub message: String,
}

// ─── AST ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Dotted variable path, e.g. `order.items.0.sku`.
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Expr {
    fn eval(&self, vars: &BTreeMap<String, Value>) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Path(segments) => resolve_path(vars, segments),
            Expr::Not(inner) => Value::Bool(!is_truthy(&inner.eval(vars))),
            Expr::And(l, r) => Value::Bool(is_truthy(&l.eval(vars)) && is_truthy(&r.eval(vars))),
            Expr::Or(l, r) => Value::Bool(is_truthy(&l.eval(vars)) || is_truthy(&r.eval(vars))),
            Expr::Compare(l, op, r) => Value::Bool(compare(&l.eval(vars), *op, &r.eval(vars))),
        }
    }
}

fn resolve_path(vars: &BTreeMap<String, Value>, segments: &[String]) -> Value {
    let Some((first, rest)) = segments.split_first() else {
        return Value::Null;
    };
    let mut current = match vars.get(first) {
        Some(v) => v,
        None => return Value::Null,
    };
    for segment in rest {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// JSON truthiness: null, false, 0, "" and [] are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    match ordering(left, right) {
        Some(ord) => match op {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
        },
        // Values of different kinds are only ever unequal.
        None => match op {
            CompareOp::Eq => left == right,
            CompareOp::Ne => left != right,
            _ => false,
        },
    }
}

fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

// ─── Parser ───────────────────────────────────────────────────

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// A bare keyword such as `and` that is not the prefix of a longer identifier.
fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag(word), peek(not(satisfy(is_ident_char))))
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(ws(alt((tag("||"), keyword("or")))), and_expr))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, e| Expr::Or(Box::new(acc), Box::new(e))),
    ))
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = unary(input)?;
    let (input, rest) = many0(preceded(ws(alt((tag("&&"), keyword("and")))), unary))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, e| Expr::And(Box::new(acc), Box::new(e))),
    ))
}

fn unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(
            preceded(
                ws(alt((terminated(tag("!"), peek(not(char('=')))), keyword("not")))),
                unary,
            ),
            |e| Expr::Not(Box::new(e)),
        ),
        comparison,
    ))(input)
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    let (input, left) = ws(operand)(input)?;
    let (input, tail) = opt(pair(ws(compare_op), ws(operand)))(input)?;
    Ok(match tail {
        Some((op, right)) => (input, Expr::Compare(Box::new(left), op, Box::new(right))),
        None => (input, left),
    })
}

fn compare_op(input: &str) -> IResult<&str, CompareOp> {
    alt((
        map(tag("=="), |_| CompareOp::Eq),
        map(tag("!="), |_| CompareOp::Ne),
        map(tag("<="), |_| CompareOp::Le),
        map(tag(">="), |_| CompareOp::Ge),
        map(tag("<"), |_| CompareOp::Lt),
        map(tag(">"), |_| CompareOp::Gt),
    ))(input)
}

fn operand(input: &str) -> IResult<&str, Expr> {
    alt((
        delimited(char('('), ws(or_expr), char(')')),
        number,
        string_literal,
        path_or_keyword,
    ))(input)
}

fn number(input: &str) -> IResult<&str, Expr> {
    map_res(
        recognize(tuple((opt(char('-')), digit1, opt(pair(char('.'), digit1))))),
        |s: &str| -> Result<Expr, std::num::ParseFloatError> {
            if let Ok(i) = s.parse::<i64>() {
                return Ok(Expr::Literal(Value::from(i)));
            }
            s.parse::<f64>().map(|f| Expr::Literal(Value::from(f)))
        },
    )(input)
}

fn string_literal(input: &str) -> IResult<&str, Expr> {
    map(
        alt((
            delimited(char('"'), take_while(|c| c != '"'), char('"')),
            delimited(char('\''), take_while(|c| c != '\''), char('\'')),
        )),
        |s: &str| Expr::Literal(Value::String(s.to_string())),
    )(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_alphabetic() || c == '_'),
        take_while(is_ident_char),
    ))(input)
}

fn path_segment(input: &str) -> IResult<&str, &str> {
    alt((identifier, digit1))(input)
}

fn path_or_keyword(input: &str) -> IResult<&str, Expr> {
    let (rest, head) = identifier(input)?;
    match head {
        "true" => return Ok((rest, Expr::Literal(Value::Bool(true)))),
        "false" => return Ok((rest, Expr::Literal(Value::Bool(false)))),
        "null" => return Ok((rest, Expr::Literal(Value::Null))),
        "and" | "or" | "not" => {
            return Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )))
        }
        _ => {}
    }
    map(
        separated_list1(char('.'), path_segment),
        |segments: Vec<&str>| Expr::Path(segments.into_iter().map(str::to_string).collect()),
    )(input)
}
