//! Named value transforms applied after variable navigation.
//!
//! The registry ships with a small builtin set; hosts can register their own
//! before handing the registry to the engine.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Number, Value};

use super::condition::is_truthy;
use super::resolver::ResolveError;

/// A transform function: value in, value out, or a message on failure.
pub type TransformFn = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

/// Name -> transform lookup table.
#[derive(Clone)]
pub struct TransformRegistry {
    transforms: HashMap<String, TransformFn>,
}

impl TransformRegistry {
    /// An empty registry with no transforms at all.
    pub fn empty() -> Self {
        Self {
            transforms: HashMap::new(),
        }
    }

    /// A registry preloaded with the builtin transforms.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("lower", |v| with_str(v, |s| s.to_lowercase()));
        registry.register("upper", |v| with_str(v, |s| s.to_uppercase()));
        registry.register("trim", |v| with_str(v, |s| s.trim().to_string()));
        registry.register("length", length);
        registry.register("string", |v| {
            Ok(match v {
                Value::String(s) => Value::String(s.clone()),
                other => Value::String(other.to_string()),
            })
        });
        registry.register("number", to_number);
        registry.register("boolean", |v| Ok(Value::Bool(is_truthy(v))));
        registry.register("not", |v| Ok(Value::Bool(!is_truthy(v))));
        registry.register("json", |v| match v {
            Value::String(s) => serde_json::from_str(s).map_err(|e| e.to_string()),
            other => Ok(other.clone()),
        });
        registry.register("keys", |v| match v {
            Value::Object(map) => Ok(Value::Array(
                map.keys().map(|k| Value::String(k.clone())).collect(),
            )),
            other => Err(format!("expected object, got {}", type_name(other))),
        });
        registry.register("values", |v| match v {
            Value::Object(map) => Ok(Value::Array(map.values().cloned().collect())),
            other => Err(format!("expected object, got {}", type_name(other))),
        });
        registry.register("first", |v| with_array(v, |items| items.first().cloned()));
        registry.register("last", |v| with_array(v, |items| items.last().cloned()));
        registry.register("flatten", |v| match v {
            Value::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .flat_map(|item| match item {
                        Value::Array(inner) => inner.clone(),
                        other => vec![other.clone()],
                    })
                    .collect(),
            )),
            other => Err(format!("expected array, got {}", type_name(other))),
        });
        registry.register("sum", |v| match v {
            Value::Array(items) => {
                let mut total = 0.0;
                for item in items {
                    total += item
                        .as_f64()
                        .ok_or_else(|| format!("cannot sum {}", type_name(item)))?;
                }
                Ok(number_value(total))
            }
            other => Err(format!("expected array, got {}", type_name(other))),
        });
        registry
    }

    /// Register (or replace) a transform.
    pub fn register<F>(&mut self, name: impl Into<String>, transform: F)
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.transforms.insert(name.into(), Arc::new(transform));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }

    /// Apply the named transform.
    pub fn apply(&self, name: &str, value: &Value) -> Result<Value, ResolveError> {
        let transform = self
            .transforms
            .get(name)
            .ok_or_else(|| ResolveError::UnknownTransform(name.to_string()))?;
        transform(value).map_err(|message| ResolveError::Transform {
            name: name.to_string(),
            message,
        })
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.transforms.keys().collect();
        names.sort();
        f.debug_struct("TransformRegistry")
            .field("transforms", &names)
            .finish()
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn with_str(value: &Value, f: impl Fn(&str) -> String) -> Result<Value, String> {
    value
        .as_str()
        .map(|s| Value::String(f(s)))
        .ok_or_else(|| format!("expected string, got {}", type_name(value)))
}

fn with_array(value: &Value, f: impl Fn(&[Value]) -> Option<Value>) -> Result<Value, String> {
    value
        .as_array()
        .map(|items| f(items).unwrap_or(Value::Null))
        .ok_or_else(|| format!("expected array, got {}", type_name(value)))
}

fn length(value: &Value) -> Result<Value, String> {
    let len = match value {
        Value::Null => 0,
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => return Err(format!("{} has no length", type_name(other))),
    };
    Ok(Value::from(len))
}

fn to_number(value: &Value) -> Result<Value, String> {
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::Bool(b) => Ok(Value::from(u8::from(*b))),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(number_value)
            .map_err(|_| format!("'{s}' is not a number")),
        other => Err(format!("cannot convert {} to number", type_name(other))),
    }
}

/// Integral floats become JSON integers so `3.0` compares equal to `3`.
pub(crate) fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}
