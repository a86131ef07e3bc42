//! Expression language for guards, actions and query filters
//!
//! Expressions are JSON values. Strings starting with `$` read the context
//! (`"$count"`, `"$user.name"`), strings starting with `$$` read the event
//! payload (`"$$amount"`, or `"$$"` for the whole payload), and single-key
//! objects whose key starts with `$` are operators:
//!
//! ```json
//! { "$and": [ { "$gt": ["$$amount", 0] }, { "$not": "$locked" } ] }
//! ```
//!
//! Definitions are parsed into `Expr` once, when a machine is loaded, so
//! dispatch never re-interprets raw JSON.

use cadence_types::{compare_values, Map, Value};
use serde_json::Number;
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExprError {
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("'{op}' expects {expected}")]
    Arity { op: String, expected: String },

    #[error("invalid operand for '{op}': {reason}")]
    InvalidOperand { op: String, reason: String },

    #[error("empty reference '{0}'")]
    EmptyReference(String),

    #[error("type error in '{op}': {reason}")]
    Type { op: String, reason: String },
}

pub type ExprResult<T> = Result<T, ExprError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CmpOp {
    fn name(&self) -> &'static str {
        match self {
            CmpOp::Eq => "$eq",
            CmpOp::Ne => "$ne",
            CmpOp::Gt => "$gt",
            CmpOp::Gte => "$gte",
            CmpOp::Lt => "$lt",
            CmpOp::Lte => "$lte",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
}

/// A parsed expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Context lookup by dotted path
    Context(Vec<String>),
    /// Payload lookup by dotted path; empty path is the whole payload
    Payload(Vec<String>),
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Arith(Box<Expr>, ArithOp, Box<Expr>),
    If(Box<Expr>, Box<Expr>, Box<Expr>),
    Exists(Box<Expr>),
    /// True when the machine is in the named state
    InState(String),
}

/// Everything an expression can observe
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub context: &'a Map,
    pub payload: &'a Value,
    pub state: &'a str,
}

impl Expr {
    pub fn parse(value: &Value) -> ExprResult<Expr> {
        let expr = match value {
            Value::String(s) => parse_reference(s)?,
            Value::Array(items) => {
                Expr::Array(items.iter().map(Expr::parse).collect::<ExprResult<_>>()?)
            }
            Value::Object(obj) => {
                if let Some(op) = obj.keys().find(|k| k.starts_with('$')) {
                    if obj.len() != 1 {
                        return Err(ExprError::InvalidOperand {
                            op: op.clone(),
                            reason: "operator objects take exactly one key".to_string(),
                        });
                    }
                    parse_operator(op, &obj[op])?
                } else {
                    let mut fields = Vec::with_capacity(obj.len());
                    for (key, v) in obj {
                        fields.push((key.clone(), Expr::parse(v)?));
                    }
                    Expr::Object(fields)
                }
            }
            other => Expr::Literal(other.clone()),
        };
        Ok(expr.collapse())
    }

    /// The constant value if this expression reads nothing
    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Expr::Literal(v) => Some(v),
            _ => None,
        }
    }

    pub fn eval(&self, scope: &Scope<'_>) -> ExprResult<Value> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Context(path) => Ok(lookup_map(scope.context, path)),
            Expr::Payload(path) => Ok(lookup(scope.payload, path)),
            Expr::Object(fields) => {
                let mut out = Map::new();
                for (key, expr) in fields {
                    out.insert(key.clone(), expr.eval(scope)?);
                }
                Ok(Value::Object(out))
            }
            Expr::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|e| e.eval(scope))
                    .collect::<ExprResult<_>>()?,
            )),
            Expr::Compare(lhs, op, rhs) => {
                let a = lhs.eval(scope)?;
                let b = rhs.eval(scope)?;
                compare(&a, *op, &b).map(Value::Bool)
            }
            Expr::And(items) => {
                for item in items {
                    if !truthy(&item.eval(scope)?) {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Expr::Or(items) => {
                for item in items {
                    if truthy(&item.eval(scope)?) {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&inner.eval(scope)?))),
            Expr::Arith(lhs, op, rhs) => {
                let a = lhs.eval(scope)?;
                let b = rhs.eval(scope)?;
                arith(&a, *op, &b)
            }
            Expr::If(cond, then, otherwise) => {
                if truthy(&cond.eval(scope)?) {
                    then.eval(scope)
                } else {
                    otherwise.eval(scope)
                }
            }
            Expr::Exists(inner) => Ok(Value::Bool(!inner.eval(scope)?.is_null())),
            Expr::InState(state) => Ok(Value::Bool(scope.state == state)),
        }
    }

    /// Evaluate and interpret the result as a boolean
    pub fn test(&self, scope: &Scope<'_>) -> ExprResult<bool> {
        self.eval(scope).map(|v| truthy(&v))
    }

    fn collapse(self) -> Expr {
        match self {
            Expr::Array(items) if items.iter().all(|e| e.as_literal().is_some()) => {
                Expr::Literal(Value::Array(
                    items
                        .into_iter()
                        .filter_map(|e| match e {
                            Expr::Literal(v) => Some(v),
                            _ => None,
                        })
                        .collect(),
                ))
            }
            Expr::Object(fields) if fields.iter().all(|(_, e)| e.as_literal().is_some()) => {
                Expr::Literal(Value::Object(
                    fields
                        .into_iter()
                        .filter_map(|(k, e)| match e {
                            Expr::Literal(v) => Some((k, v)),
                            _ => None,
                        })
                        .collect(),
                ))
            }
            other => other,
        }
    }
}

fn parse_reference(s: &str) -> ExprResult<Expr> {
    if let Some(rest) = s.strip_prefix("$$") {
        return Ok(Expr::Payload(split_path(rest)));
    }
    if let Some(rest) = s.strip_prefix('$') {
        if rest.is_empty() {
            return Err(ExprError::EmptyReference(s.to_string()));
        }
        return Ok(Expr::Context(split_path(rest)));
    }
    Ok(Expr::Literal(Value::String(s.to_string())))
}

fn split_path(path: &str) -> Vec<String> {
    if path.is_empty() {
        return Vec::new();
    }
    path.split('.').map(str::to_string).collect()
}

fn operands(op: &str, operand: &Value, n: usize) -> ExprResult<Vec<Expr>> {
    match operand {
        Value::Array(items) if items.len() == n => items.iter().map(Expr::parse).collect(),
        _ => Err(ExprError::Arity {
            op: op.to_string(),
            expected: format!("an array of {} operands", n),
        }),
    }
}

fn pair(op: &str, operand: &Value) -> ExprResult<(Box<Expr>, Box<Expr>)> {
    let mut items = operands(op, operand, 2)?.into_iter();
    match (items.next(), items.next()) {
        (Some(a), Some(b)) => Ok((Box::new(a), Box::new(b))),
        _ => Err(ExprError::Arity {
            op: op.to_string(),
            expected: "two operands".to_string(),
        }),
    }
}

fn list(op: &str, operand: &Value) -> ExprResult<Vec<Expr>> {
    match operand {
        Value::Array(items) => items.iter().map(Expr::parse).collect(),
        _ => Err(ExprError::Arity {
            op: op.to_string(),
            expected: "an array".to_string(),
        }),
    }
}

fn parse_operator(op: &str, operand: &Value) -> ExprResult<Expr> {
    let cmp = |c: CmpOp| -> ExprResult<Expr> {
        let (a, b) = pair(op, operand)?;
        Ok(Expr::Compare(a, c, b))
    };
    let arith = |a_op: ArithOp| -> ExprResult<Expr> {
        let (a, b) = pair(op, operand)?;
        Ok(Expr::Arith(a, a_op, b))
    };

    match op {
        "$eq" => cmp(CmpOp::Eq),
        "$ne" => cmp(CmpOp::Ne),
        "$gt" => cmp(CmpOp::Gt),
        "$gte" => cmp(CmpOp::Gte),
        "$lt" => cmp(CmpOp::Lt),
        "$lte" => cmp(CmpOp::Lte),
        "$add" => arith(ArithOp::Add),
        "$sub" => arith(ArithOp::Sub),
        "$and" => Ok(Expr::And(list(op, operand)?)),
        "$or" => Ok(Expr::Or(list(op, operand)?)),
        "$not" => Ok(Expr::Not(Box::new(Expr::parse(operand)?))),
        "$exists" => Ok(Expr::Exists(Box::new(Expr::parse(operand)?))),
        "$if" => {
            let mut items = operands(op, operand, 3)?.into_iter();
            match (items.next(), items.next(), items.next()) {
                (Some(c), Some(t), Some(e)) => {
                    Ok(Expr::If(Box::new(c), Box::new(t), Box::new(e)))
                }
                _ => Err(ExprError::Arity {
                    op: op.to_string(),
                    expected: "three operands".to_string(),
                }),
            }
        }
        "$inState" => match operand {
            Value::String(state) => Ok(Expr::InState(state.clone())),
            _ => Err(ExprError::InvalidOperand {
                op: op.to_string(),
                reason: "expected a state name".to_string(),
            }),
        },
        other => Err(ExprError::UnknownOperator(other.to_string())),
    }
}

fn lookup(value: &Value, path: &[String]) -> Value {
    let mut current = value;
    for segment in path {
        current = match current {
            Value::Object(obj) => match obj.get(segment) {
                Some(v) => v,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current.clone()
}

fn lookup_map(map: &Map, path: &[String]) -> Value {
    match path.split_first() {
        None => Value::Object(map.clone()),
        Some((head, rest)) => match map.get(head) {
            Some(v) => lookup(v, rest),
            None => Value::Null,
        },
    }
}

/// JSON truthiness: null, false, zero and empty values are false
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(obj) => !obj.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn compare(a: &Value, op: CmpOp, b: &Value) -> ExprResult<bool> {
    match op {
        CmpOp::Eq => Ok(values_equal(a, b)),
        CmpOp::Ne => Ok(!values_equal(a, b)),
        _ => {
            let ordering = compare_values(a, b).ok_or_else(|| ExprError::Type {
                op: op.name().to_string(),
                reason: format!("cannot order {} and {}", a, b),
            })?;
            Ok(match op {
                CmpOp::Gt => ordering == Ordering::Greater,
                CmpOp::Gte => ordering != Ordering::Less,
                CmpOp::Lt => ordering == Ordering::Less,
                CmpOp::Lte => ordering != Ordering::Greater,
                CmpOp::Eq | CmpOp::Ne => false,
            })
        }
    }
}

fn arith(a: &Value, op: ArithOp, b: &Value) -> ExprResult<Value> {
    let name = match op {
        ArithOp::Add => "$add",
        ArithOp::Sub => "$sub",
    };
    let (Value::Number(x), Value::Number(y)) = (a, b) else {
        return Err(ExprError::Type {
            op: name.to_string(),
            reason: format!("expected numbers, got {} and {}", a, b),
        });
    };

    if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
        let result = match op {
            ArithOp::Add => x.checked_add(y),
            ArithOp::Sub => x.checked_sub(y),
        };
        if let Some(n) = result {
            return Ok(Value::Number(n.into()));
        }
    }

    let (x, y) = match (x.as_f64(), y.as_f64()) {
        (Some(x), Some(y)) => (x, y),
        _ => {
            return Err(ExprError::Type {
                op: name.to_string(),
                reason: "operands are not representable as numbers".to_string(),
            })
        }
    };
    let result = match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
    };
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| ExprError::Type {
            op: name.to_string(),
            reason: "result is not a finite number".to_string(),
        })
}

/// JSON pointer of the first unresolved expression in a value
///
/// A value is unresolved if any string in it, or any object key, starts
/// with `$`. Messages must be fully resolved before they are sent.
pub fn unresolved_path(value: &Value) -> Option<String> {
    fn walk(value: &Value, path: &mut Vec<String>) -> Option<String> {
        match value {
            Value::String(s) if s.starts_with('$') => Some(pointer(path)),
            Value::Array(items) => items.iter().enumerate().find_map(|(i, item)| {
                path.push(i.to_string());
                let found = walk(item, path);
                path.pop();
                found
            }),
            Value::Object(obj) => obj.iter().find_map(|(key, item)| {
                path.push(key.clone());
                let found = if key.starts_with('$') {
                    Some(pointer(path))
                } else {
                    walk(item, path)
                };
                path.pop();
                found
            }),
            _ => None,
        }
    }
    walk(value, &mut Vec::new())
}

fn pointer(path: &[String]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.iter()
        .map(|segment| format!("/{}", segment.replace('~', "~0").replace('/', "~1")))
        .collect()
}

/// Replace `$key` references with context values
///
/// Only string values are substituted; operator objects and other keys are
/// kept as they are. Returns `None` if any reference resolves to null or a
/// missing key.
pub fn substitute_context(value: &Value, context: &Map) -> Option<Value> {
    match value {
        Value::String(s) if s.starts_with('$') && !s.starts_with("$$") && s.len() > 1 => {
            let resolved = lookup_map(context, &split_path(&s[1..]));
            if resolved.is_null() {
                None
            } else {
                Some(resolved)
            }
        }
        Value::Array(items) => items
            .iter()
            .map(|v| substitute_context(v, context))
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        Value::Object(obj) => {
            let mut out = Map::new();
            for (key, v) in obj {
                out.insert(key.clone(), substitute_context(v, context)?);
            }
            Some(Value::Object(out))
        }
        other => Some(other.clone()),
    }
}
