//! Evaluation of parsed conditions over a flattened record.

use serde_json::{Map, Value};

use crate::parser::{CmpOp, Expr, Literal};

impl Expr {
    /// Eval evaluates the condition against a flattened record.
    ///
    /// Evaluation is total: a field that is missing, or whose value
    /// is JSON null, is treated as absent. Absent fields compare
    /// unequal to any literal and fail membership and pattern tests.
    pub fn eval(&self, env: &Map<String, Value>) -> bool {
        match self {
            Expr::Or(a, b) => a.eval(env) || b.eval(env),
            Expr::And(a, b) => a.eval(env) && b.eval(env),
            Expr::Not(e) => !e.eval(env),
            Expr::Cmp { field, op, value } => cmp(lookup(env, field), *op, value),
            Expr::Match { field, pattern } => lookup(env, field)
                .and_then(as_text)
                .is_some_and(|s| pattern.is_match(&s)),
            Expr::In { field, list } => lookup(env, field)
                .is_some_and(|v| list.iter().any(|l| eq(v, l))),
        }
    }
}

fn lookup<'e>(env: &'e Map<String, Value>, field: &str) -> Option<&'e Value> {
    match env.get(field) {
        Some(Value::Null) | None => None,
        some => some,
    }
}

fn cmp(value: Option<&Value>, op: CmpOp, lit: &Literal) -> bool {
    let Some(value) = value else {
        // Absent fields are unequal to everything and unordered.
        return op == CmpOp::Ne;
    };
    match op {
        CmpOp::Eq => eq(value, lit),
        CmpOp::Ne => !eq(value, lit),
        CmpOp::Gt => ordering(value, lit).is_some_and(|o| o.is_gt()),
        CmpOp::Ge => ordering(value, lit).is_some_and(|o| o.is_ge()),
        CmpOp::Lt => ordering(value, lit).is_some_and(|o| o.is_lt()),
        CmpOp::Le => ordering(value, lit).is_some_and(|o| o.is_le()),
    }
}

fn eq(value: &Value, lit: &Literal) -> bool {
    match (value, lit) {
        (Value::String(s), Literal::Str(l)) => s == l,
        (Value::Bool(b), Literal::Str(l)) => (l == "true") == *b,
        (Value::Number(_) | Value::String(_), Literal::Num(x)) => {
            as_number(value).is_some_and(|n| n == *x)
        }
        (Value::Number(n), Literal::Str(l)) => {
            l.parse::<f64>().ok().zip(n.as_f64()).is_some_and(|(a, b)| a == b)
        }
        // Arrays and objects never equal a scalar literal.
        _ => false,
    }
}

fn ordering(value: &Value, lit: &Literal) -> Option<std::cmp::Ordering> {
    match lit {
        Literal::Num(x) => as_number(value).and_then(|n| n.partial_cmp(x)),
        Literal::Str(l) => match value {
            Value::String(s) => Some(s.as_str().cmp(l.as_str())),
            _ => None,
        },
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
