//! Context path mini-language.
//!
//! Paths are rooted at `$` and made of four segment kinds:
//!
//! | Syntax              | Segment                                   |
//! |---------------------|-------------------------------------------|
//! | `.name`, `['name']` | object field                              |
//! | `[2]`, `[-1]`       | array index (negative counts from the end)|
//! | `[*]`, `.*`         | wildcard projection over array/object     |
//! | `..name`            | recursive descent for `name`              |
//!
//! A wildcard or descent turns the result into a projected list; segments
//! after it map over every element and drop elements that do not match.

use serde_json::Value;

use super::resolver::ResolveError;

/// One navigation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Index(i64),
    Wildcard,
    Descend(String),
}

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextPath {
    raw: String,
    segments: Vec<Segment>,
}

impl ContextPath {
    /// Parse a path such as `$.steps.fetch.output.items[*].id`.
    pub fn parse(raw: &str) -> Result<Self, ResolveError> {
        let trimmed = raw.trim();
        let invalid = |reason: &str| ResolveError::InvalidPath {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        let rest = trimmed
            .strip_prefix('$')
            .ok_or_else(|| invalid("path must start with '$'"))?;
        let chars: Vec<char> = rest.chars().collect();
        let mut segments = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '.' => {
                    if chars.get(i + 1) == Some(&'.') {
                        let (name, next) = read_name(&chars, i + 2);
                        if name.is_empty() || name == "*" {
                            return Err(invalid("'..' must be followed by a field name"));
                        }
                        segments.push(Segment::Descend(name));
                        i = next;
                    } else {
                        let (name, next) = read_name(&chars, i + 1);
                        if name.is_empty() {
                            return Err(invalid("empty field name"));
                        }
                        segments.push(if name == "*" {
                            Segment::Wildcard
                        } else {
                            Segment::Field(name)
                        });
                        i = next;
                    }
                }
                '[' => {
                    let close = chars[i..]
                        .iter()
                        .position(|c| *c == ']')
                        .map(|p| p + i)
                        .ok_or_else(|| invalid("unclosed '['"))?;
                    let inner: String = chars[i + 1..close].iter().collect();
                    let inner = inner.trim();
                    segments.push(parse_bracket(inner).ok_or_else(|| {
                        invalid(&format!("invalid bracket segment '[{inner}]'"))
                    })?);
                    i = close + 1;
                }
                c => return Err(invalid(&format!("unexpected character '{c}'"))),
            }
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The step a `$.steps.<id>...` path reads from, if any.
    pub fn referenced_step(&self) -> Option<&str> {
        match self.segments.as_slice() {
            [Segment::Field(root), Segment::Field(id), ..] if root == "steps" => Some(id),
            _ => None,
        }
    }

    /// Navigate `root`. `None` means the path does not exist in `root`.
    pub fn select(&self, root: &Value) -> Option<Value> {
        let mut current: Vec<&Value> = vec![root];
        let mut projected = false;

        for segment in &self.segments {
            let mut next = Vec::new();
            for value in &current {
                match segment {
                    Segment::Field(key) => {
                        if let Some(v) = value.as_object().and_then(|m| m.get(key)) {
                            next.push(v);
                        }
                    }
                    Segment::Index(index) => {
                        if let Some(v) = value.as_array().and_then(|items| at_index(items, *index)) {
                            next.push(v);
                        }
                    }
                    Segment::Wildcard => match value {
                        Value::Array(items) => next.extend(items.iter()),
                        Value::Object(map) => next.extend(map.values()),
                        _ => {}
                    },
                    Segment::Descend(key) => collect_descendants(value, key, &mut next),
                }
            }

            if matches!(segment, Segment::Wildcard | Segment::Descend(_)) {
                projected = true;
            } else if !projected && next.is_empty() {
                return None;
            }
            current = next;
        }

        if projected {
            Some(Value::Array(current.into_iter().cloned().collect()))
        } else {
            current.into_iter().next().cloned()
        }
    }
}

impl std::fmt::Display for ContextPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

fn read_name(chars: &[char], start: usize) -> (String, usize) {
    let mut end = start;
    while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
        end += 1;
    }
    (chars[start..end].iter().collect::<String>().trim().to_string(), end)
}

fn parse_bracket(inner: &str) -> Option<Segment> {
    if inner == "*" {
        return Some(Segment::Wildcard);
    }
    for quote in ['\'', '"'] {
        if let Some(key) = inner
            .strip_prefix(quote)
            .and_then(|s| s.strip_suffix(quote))
        {
            return Some(Segment::Field(key.to_string()));
        }
    }
    inner.parse::<i64>().ok().map(Segment::Index)
}

fn at_index(items: &[Value], index: i64) -> Option<&Value> {
    let len = items.len() as i64;
    let idx = if index < 0 { len + index } else { index };
    if idx < 0 {
        return None;
    }
    items.get(idx as usize)
}

fn collect_descendants<'a>(value: &'a Value, key: &str, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => {
            if let Some(v) = map.get(key) {
                out.push(v);
            }
            for child in map.values() {
                collect_descendants(child, key, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                collect_descendants(child, key, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "input": {"user": {"name": "ada", "tags": ["a", "b", "c"]}},
            "steps": {
                "fetch-docs": {
                    "status": "success",
                    "output": {
                        "items": [
                            {"id": 1, "meta": {"lang": "en"}},
                            {"id": 2, "meta": {"lang": "fr"}},
                            {"id": 3}
                        ]
                    }
                }
            },
            "variables": {"odd key": 7}
        })
    }

    fn select(path: &str) -> Option<Value> {
        ContextPath::parse(path).unwrap().select(&scope())
    }

    #[test]
    fn test_parse_segments() {
        let path = ContextPath::parse("$.steps.fetch-docs.output.items[0]['x y']..lang[*]").unwrap();
        assert_eq!(
            path.segments(),
            &[
                Segment::Field("steps".into()),
                Segment::Field("fetch-docs".into()),
                Segment::Field("output".into()),
                Segment::Field("items".into()),
                Segment::Index(0),
                Segment::Field("x y".into()),
                Segment::Descend("lang".into()),
                Segment::Wildcard,
            ]
        );
        assert_eq!(path.referenced_step(), Some("fetch-docs"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ContextPath::parse("input.name").is_err());
        assert!(ContextPath::parse("$.items[0").is_err());
        assert!(ContextPath::parse("$.items[abc]").is_err());
        assert!(ContextPath::parse("$..").is_err());
        assert!(ContextPath::parse("$.a..").is_err());
    }

    #[test]
    fn test_root_selects_everything() {
        assert_eq!(select("$"), Some(scope()));
    }

    #[test]
    fn test_field_and_index() {
        assert_eq!(select("$.input.user.name"), Some(json!("ada")));
        assert_eq!(select("$.input.user.tags[1]"), Some(json!("b")));
        assert_eq!(select("$.input.user.tags[-1]"), Some(json!("c")));
        assert_eq!(select("$.variables['odd key']"), Some(json!(7)));
    }

    #[test]
    fn test_missing_navigation_is_none() {
        assert_eq!(select("$.input.user.age"), None);
        assert_eq!(select("$.input.user.tags[9]"), None);
        assert_eq!(select("$.input.user.tags[-9]"), None);
        // type mismatch: indexing an object, field on a string
        assert_eq!(select("$.input.user[0]"), None);
        assert_eq!(select("$.input.user.name.first"), None);
    }

    #[test]
    fn test_wildcard_projection() {
        assert_eq!(
            select("$.steps.fetch-docs.output.items[*].id"),
            Some(json!([1, 2, 3]))
        );
        // elements without the field are dropped
        assert_eq!(
            select("$.steps.fetch-docs.output.items.*.meta.lang"),
            Some(json!(["en", "fr"]))
        );
    }

    #[test]
    fn test_recursive_descent() {
        assert_eq!(select("$..lang"), Some(json!(["en", "fr"])));
        assert_eq!(select("$..id"), Some(json!([1, 2, 3])));
        assert_eq!(select("$..nope"), Some(json!([])));
    }

    #[test]
    fn test_display_roundtrip() {
        let path = ContextPath::parse("  $.input.user ").unwrap();
        assert_eq!(path.to_string(), "$.input.user");
    }
}
