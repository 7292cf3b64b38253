//! Structured predicates over the workflow context.
//!
//! Conditions gate step dispatch, choose conditional branches and drive loop
//! iteration. They are deliberately small: path lookups, comparisons and
//! boolean combinators. The `expr` form is shorthand for a single comparison:
//!
//! ```yaml
//! condition:
//!   expr: "$.steps.score.output.score >= 8"
//! ```
//!
//! Every form is a single-key map except `always`, which is a bare string.
//! YAML tags (`!truthy $.input.enabled`) are accepted too. Conditions always
//! serialize as maps so a saved definition reads back in any position.

use std::fmt;

use serde::de::{self, EnumAccess, MapAccess, VariantAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A predicate evaluated against the run context.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Condition {
    /// Always true.
    #[default]
    Always,
    /// True when the path resolves to any value (including `null`).
    Exists(String),
    /// True when the path resolves to a truthy value.
    Truthy(String),
    /// Compare the value at `path` with a literal.
    Compare {
        path: String,
        op: CompareOp,
        value: serde_json::Value,
    },
    /// True when every child is true (vacuously true when empty).
    All(Vec<Condition>),
    /// True when any child is true.
    Any(Vec<Condition>),
    /// Negation.
    Not(Box<Condition>),
    /// Shorthand `<path> <op> <literal>`.
    Expr(String),
}

const VARIANTS: &[&str] = &[
    "always", "exists", "truthy", "compare", "all", "any", "not", "expr",
];

#[derive(Serialize)]
struct CompareRef<'a> {
    path: &'a str,
    op: CompareOp,
    value: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct CompareArgs {
    path: String,
    op: CompareOp,
    value: serde_json::Value,
}

impl From<CompareArgs> for Condition {
    fn from(args: CompareArgs) -> Self {
        Condition::Compare {
            path: args.path,
            op: args.op,
            value: args.value,
        }
    }
}

fn single_key<S, T>(serializer: S, key: &str, value: &T) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Serialize + ?Sized,
{
    let mut map = serializer.serialize_map(Some(1))?;
    map.serialize_entry(key, value)?;
    map.end()
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Condition::Always => serializer.serialize_str("always"),
            Condition::Exists(path) => single_key(serializer, "exists", path),
            Condition::Truthy(path) => single_key(serializer, "truthy", path),
            Condition::Compare { path, op, value } => single_key(
                serializer,
                "compare",
                &CompareRef {
                    path,
                    op: *op,
                    value,
                },
            ),
            Condition::All(children) => single_key(serializer, "all", children),
            Condition::Any(children) => single_key(serializer, "any", children),
            Condition::Not(inner) => single_key(serializer, "not", inner.as_ref()),
            Condition::Expr(expr) => single_key(serializer, "expr", expr),
        }
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ConditionVisitor)
    }
}

struct ConditionVisitor;

impl<'de> Visitor<'de> for ConditionVisitor {
    type Value = Condition;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"always\" or a single-key condition map")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Condition, E> {
        match v {
            "always" => Ok(Condition::Always),
            other => Err(E::unknown_variant(other, &["always"])),
        }
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Condition, A::Error> {
        let Some(key) = map.next_key::<String>()? else {
            return Err(de::Error::invalid_length(0, &self));
        };
        let condition = match key.as_str() {
            "always" => {
                map.next_value::<de::IgnoredAny>()?;
                Condition::Always
            }
            "exists" => Condition::Exists(map.next_value()?),
            "truthy" => Condition::Truthy(map.next_value()?),
            "compare" => map.next_value::<CompareArgs>()?.into(),
            "all" => Condition::All(map.next_value()?),
            "any" => Condition::Any(map.next_value()?),
            "not" => Condition::Not(Box::new(map.next_value()?)),
            "expr" => Condition::Expr(map.next_value()?),
            other => return Err(de::Error::unknown_variant(other, VARIANTS)),
        };
        if let Some(extra) = map.next_key::<String>()? {
            return Err(de::Error::custom(format!(
                "condition '{key}' has an extra key '{extra}'"
            )));
        }
        Ok(condition)
    }

    fn visit_enum<A: EnumAccess<'de>>(self, data: A) -> Result<Condition, A::Error> {
        let (key, variant) = data.variant::<String>()?;
        Ok(match key.as_str() {
            "always" => {
                variant.unit_variant()?;
                Condition::Always
            }
            "exists" => Condition::Exists(variant.newtype_variant()?),
            "truthy" => Condition::Truthy(variant.newtype_variant()?),
            "compare" => variant.newtype_variant::<CompareArgs>()?.into(),
            "all" => Condition::All(variant.newtype_variant()?),
            "any" => Condition::Any(variant.newtype_variant()?),
            "not" => Condition::Not(Box::new(variant.newtype_variant()?)),
            "expr" => Condition::Expr(variant.newtype_variant()?),
            other => return Err(de::Error::unknown_variant(other, VARIANTS)),
        })
    }
}

/// Comparison operator for [`Condition::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// String contains substring, array contains element, object has key.
    Contains,
    /// Value is an element of the literal array.
    In,
}

impl CompareOp {
    /// The symbol used by the `expr` shorthand.
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Contains => "contains",
            CompareOp::In => "in",
        }
    }
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_condition_yaml_forms() {
        let yaml = r#"
all:
  - truthy: $.input.enabled
  - compare:
      path: $.variables.count
      op: lt
      value: 5
  - not:
      exists: $.steps.skip.output
  - expr: "$.input.score >= 8"
"#;
        let cond: Condition = serde_yaml_ng::from_str(yaml).unwrap();
        let Condition::All(children) = cond else {
            panic!("expected all");
        };
        assert_eq!(children.len(), 4);
        assert!(matches!(
            &children[1],
            Condition::Compare { op: CompareOp::Lt, value, .. } if *value == json!(5)
        ));
        assert!(matches!(&children[2], Condition::Not(_)));
    }

    #[test]
    fn test_always_is_bare_string() {
        let cond: Condition = serde_json::from_value(json!("always")).unwrap();
        assert_eq!(cond, Condition::Always);
        assert_eq!(Condition::default(), Condition::Always);
    }

    #[test]
    fn test_tag_and_map_forms_agree() {
        let tagged: Condition = serde_yaml_ng::from_str("!truthy $.input.enabled").unwrap();
        let mapped: Condition = serde_yaml_ng::from_str("truthy: $.input.enabled").unwrap();
        assert_eq!(tagged, mapped);
        assert_eq!(tagged, Condition::Truthy("$.input.enabled".to_string()));
    }

    #[test]
    fn test_serializes_as_single_key_maps() {
        let cond = Condition::Any(vec![
            Condition::Always,
            Condition::Not(Box::new(Condition::Exists("$.steps.a.output".to_string()))),
            Condition::Compare {
                path: "$.input.n".to_string(),
                op: CompareOp::Gt,
                value: json!(2),
            },
        ]);
        assert_eq!(
            serde_json::to_value(&cond).unwrap(),
            json!({ "any": [
                "always",
                { "not": { "exists": "$.steps.a.output" } },
                { "compare": { "path": "$.input.n", "op": "gt", "value": 2 } },
            ] })
        );

        let yaml = serde_yaml_ng::to_string(&cond).unwrap();
        assert!(!yaml.contains('!'));
        let again: Condition = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(again, cond);
    }

    #[test]
    fn test_rejects_unknown_and_extra_keys() {
        assert!(serde_json::from_value::<Condition>(json!({ "maybe": "$.x" })).is_err());
        assert!(serde_json::from_value::<Condition>(json!("never")).is_err());
        let err = serde_json::from_value::<Condition>(json!({
            "truthy": "$.a",
            "exists": "$.b",
        }))
        .unwrap_err();
        assert!(err.to_string().contains("extra key"));
    }

    #[test]
    fn test_compare_op_symbols() {
        assert_eq!(CompareOp::Gte.to_string(), ">=");
        assert_eq!(CompareOp::In.symbol(), "in");
    }
}
