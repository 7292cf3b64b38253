//! Variable resolution against a context snapshot.
//!
//! Resolution is pure: it reads a `serde_json::Value` scope built from the
//! `WorkflowContext` and never mutates it, so parallel steps can resolve
//! their inputs from the same snapshot without locking.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use weaver_types::variable::VariableRef;

use super::path::ContextPath;
use super::transform::TransformRegistry;

/// Errors raised while resolving a variable reference.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("missing variable: {0}")]
    MissingVariable(String),

    #[error("unknown transform '{0}'")]
    UnknownTransform(String),

    #[error("transform '{name}' failed: {message}")]
    Transform { name: String, message: String },
}

/// Resolves `VariableRef`s and renders `{{ $.path }}` templates.
#[derive(Debug, Clone, Default)]
pub struct VariableResolver {
    transforms: Arc<TransformRegistry>,
}

impl VariableResolver {
    pub fn new(transforms: TransformRegistry) -> Self {
        Self {
            transforms: Arc::new(transforms),
        }
    }

    pub fn transforms(&self) -> &TransformRegistry {
        &self.transforms
    }

    /// Resolve a single reference.
    ///
    /// A missing path falls back to the default, then to `null` for optional
    /// references, and otherwise fails with `MissingVariable`. The transform
    /// (if any) applies to whichever value was chosen, except the implicit
    /// `null` of an optional reference.
    pub fn resolve(&self, var: &VariableRef, scope: &Value) -> Result<Value, ResolveError> {
        let path = ContextPath::parse(&var.path)?;
        let value = match path.select(scope) {
            Some(value) => value,
            None => match &var.default {
                Some(default) => default.clone(),
                None if var.optional => return Ok(Value::Null),
                None => return Err(ResolveError::MissingVariable(var.path.clone())),
            },
        };

        match &var.transform {
            Some(name) => self.transforms.apply(name, &value),
            None => Ok(value),
        }
    }

    /// Resolve every entry of a variable map, failing on the first error.
    pub fn resolve_all(
        &self,
        vars: &BTreeMap<String, VariableRef>,
        scope: &Value,
    ) -> Result<Map<String, Value>, ResolveError> {
        vars.iter()
            .map(|(name, var)| Ok((name.clone(), self.resolve(var, scope)?)))
            .collect()
    }

    /// Render `{{ $.path }}` placeholders.
    ///
    /// Strings are inserted raw, other values as compact JSON. Placeholders
    /// that do not parse or do not resolve are left in place.
    pub fn render(&self, template: &str, scope: &Value) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start..].find("}}") else {
                break;
            };
            let end = start + len + 2;
            let expr = rest[start + 2..end - 2].trim();
            out.push_str(&rest[..start]);

            match ContextPath::parse(expr).ok().and_then(|p| p.select(scope)) {
                Some(Value::String(s)) => out.push_str(&s),
                Some(other) => out.push_str(&other.to_string()),
                None => {
                    tracing::debug!(placeholder = expr, "unresolved template placeholder");
                    out.push_str(&rest[start..end]);
                }
            }
            rest = &rest[end..];
        }

        out.push_str(rest);
        out
    }
}
