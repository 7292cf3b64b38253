//! Condition evaluation over a context snapshot.
//!
//! Missing paths evaluate as `null`, which is falsy and compares unequal to
//! everything except `null`. Malformed paths and `expr` strings are errors;
//! `validate_condition` surfaces them at registration time.

use std::cmp::Ordering;

use serde_json::Value;
use thiserror::Error;
use weaver_types::condition::{CompareOp, Condition};

use super::path::ContextPath;

/// A condition that cannot be evaluated because it is malformed.
#[derive(Debug, Error)]
#[error("invalid condition '{expr}': {reason}")]
pub struct ConditionError {
    pub expr: String,
    pub reason: String,
}

/// Truthiness: `null`, `false`, `0`, `""`, `[]` and `{}` are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Evaluate a condition against a scope value.
pub fn evaluate(condition: &Condition, scope: &Value) -> Result<bool, ConditionError> {
    Ok(match condition {
        Condition::Always => true,
        Condition::Exists(path) => parse_path(path)?.select(scope).is_some(),
        Condition::Truthy(path) => lookup(path, scope)?.as_ref().is_some_and(is_truthy),
        Condition::Compare { path, op, value } => {
            let left = lookup(path, scope)?.unwrap_or(Value::Null);
            compare(&left, *op, value)
        }
        Condition::All(children) => {
            for child in children {
                if !evaluate(child, scope)? {
                    return Ok(false);
                }
            }
            true
        }
        Condition::Any(children) => {
            for child in children {
                if evaluate(child, scope)? {
                    return Ok(true);
                }
            }
            false
        }
        Condition::Not(inner) => !evaluate(inner, scope)?,
        Condition::Expr(expr) => {
            let (path, op, literal) = parse_expr(expr)?;
            let left = path.select(scope).unwrap_or(Value::Null);
            compare(&left, op, &literal)
        }
    })
}

/// Check that every path and `expr` inside the condition parses.
pub fn validate_condition(condition: &Condition) -> Result<(), ConditionError> {
    match condition {
        Condition::Always => Ok(()),
        Condition::Exists(path) | Condition::Truthy(path) | Condition::Compare { path, .. } => {
            parse_path(path).map(|_| ())
        }
        Condition::All(children) | Condition::Any(children) => {
            children.iter().try_for_each(validate_condition)
        }
        Condition::Not(inner) => validate_condition(inner),
        Condition::Expr(expr) => parse_expr(expr).map(|_| ()),
    }
}

/// Parse the `<path> <op> <literal>` shorthand.
///
/// The literal is read as JSON when possible (`8`, `true`, `"x"`, `[1,2]`),
/// as a single-quoted string (`'draft'`), and otherwise as a bare word.
pub fn parse_expr(expr: &str) -> Result<(ContextPath, CompareOp, Value), ConditionError> {
    const OPS: [(&str, CompareOp); 8] = [
        (">=", CompareOp::Gte),
        ("<=", CompareOp::Lte),
        ("==", CompareOp::Eq),
        ("!=", CompareOp::Ne),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
        (" contains ", CompareOp::Contains),
        (" in ", CompareOp::In),
    ];

    // Earliest operator wins; on a tie the longer (listed first) one does.
    let (pos, symbol, op) = OPS
        .iter()
        .filter_map(|(symbol, op)| expr.find(symbol).map(|pos| (pos, *symbol, *op)))
        .min_by_key(|(pos, _, _)| *pos)
        .ok_or_else(|| ConditionError {
            expr: expr.to_string(),
            reason: "no comparison operator".to_string(),
        })?;

    let path = parse_path(expr[..pos].trim()).map_err(|e| ConditionError {
        expr: expr.to_string(),
        reason: e.reason,
    })?;
    let literal = expr[pos + symbol.len()..].trim();
    if literal.is_empty() {
        return Err(ConditionError {
            expr: expr.to_string(),
            reason: "missing right-hand value".to_string(),
        });
    }

    Ok((path, op, parse_literal(literal)))
}

fn parse_literal(literal: &str) -> Value {
    if let Ok(value) = serde_json::from_str::<Value>(literal) {
        return value;
    }
    if let Some(inner) = literal
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
    {
        return Value::String(inner.to_string());
    }
    Value::String(literal.to_string())
}

fn parse_path(path: &str) -> Result<ContextPath, ConditionError> {
    ContextPath::parse(path).map_err(|e| ConditionError {
        expr: path.to_string(),
        reason: e.to_string(),
    })
}

fn lookup(path: &str, scope: &Value) -> Result<Option<Value>, ConditionError> {
    Ok(parse_path(path)?.select(scope))
}

/// Compare two values with the given operator.
pub fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    match op {
        CompareOp::Eq => values_equal(left, right),
        CompareOp::Ne => !values_equal(left, right),
        CompareOp::Gt => ordering(left, right) == Some(Ordering::Greater),
        CompareOp::Gte => matches!(
            ordering(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        CompareOp::Lt => ordering(left, right) == Some(Ordering::Less),
        CompareOp::Lte => matches!(ordering(left, right), Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Contains => match left {
            Value::String(s) => right.as_str().is_some_and(|needle| s.contains(needle)),
            Value::Array(items) => items.iter().any(|item| values_equal(item, right)),
            Value::Object(map) => right.as_str().is_some_and(|key| map.contains_key(key)),
            _ => false,
        },
        CompareOp::In => right
            .as_array()
            .is_some_and(|items| items.iter().any(|item| values_equal(left, item))),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "input": {"score": 5, "status": "draft", "tags": ["x", "y"], "empty": []},
            "steps": {},
            "variables": {"iterationCount": 4}
        })
    }

    fn eval(cond: Condition) -> bool {
        evaluate(&cond, &scope()).unwrap()
    }

    fn expr(s: &str) -> bool {
        eval(Condition::Expr(s.to_string()))
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(!is_truthy(&json!({})));
        assert!(is_truthy(&json!("no")));
        assert!(is_truthy(&json!(0.5)));
        assert!(is_truthy(&json!([0])));
    }

    #[test]
    fn test_expr_numeric_comparisons() {
        assert!(!expr("$.input.score >= 8"));
        assert!(expr("$.input.score < 8"));
        assert!(expr("$.input.score == 5.0"));
        assert!(expr("$.variables.iterationCount < 5"));
        assert!(expr("$.input.score != 6"));
    }

    #[test]
    fn test_expr_string_literals() {
        assert!(expr("$.input.status == 'draft'"));
        assert!(expr("$.input.status == \"draft\""));
        assert!(expr("$.input.status == draft"));
        assert!(expr("$.input.status in [\"draft\", \"review\"]"));
        assert!(expr("$.input.tags contains 'y'"));
    }

    #[test]
    fn test_missing_path_is_null() {
        assert!(!expr("$.input.nope >= 1"));
        assert!(expr("$.input.nope == null"));
        assert!(!eval(Condition::Truthy("$.input.nope".into())));
        assert!(!eval(Condition::Exists("$.input.nope".into())));
        assert!(eval(Condition::Exists("$.input.score".into())));
    }

    #[test]
    fn test_combinators() {
        let cond = Condition::All(vec![
            Condition::Truthy("$.input.tags".into()),
            Condition::Not(Box::new(Condition::Truthy("$.input.empty".into()))),
            Condition::Any(vec![
                Condition::Compare {
                    path: "$.input.score".into(),
                    op: CompareOp::Gt,
                    value: json!(100),
                },
                Condition::Always,
            ]),
        ]);
        assert!(eval(cond));
        assert!(eval(Condition::All(vec![])));
        assert!(!eval(Condition::Any(vec![])));
    }

    #[test]
    fn test_parse_expr_errors() {
        assert!(parse_expr("$.input.score").is_err());
        assert!(parse_expr("score >= 8").is_err());
        assert!(parse_expr("$.input.score >=").is_err());
    }

    #[test]
    fn test_parse_expr_prefers_longest_operator() {
        let (path, op, value) = parse_expr("$.input.score >= 8").unwrap();
        assert_eq!(path.as_str(), "$.input.score");
        assert_eq!(op, CompareOp::Gte);
        assert_eq!(value, json!(8));
    }

    #[test]
    fn test_validate_condition_walks_children() {
        let bad = Condition::Not(Box::new(Condition::Any(vec![Condition::Expr(
            "oops".to_string(),
        )])));
        assert!(validate_condition(&bad).is_err());
        assert!(validate_condition(&Condition::Truthy("$.input.x".into())).is_ok());
    }
}
