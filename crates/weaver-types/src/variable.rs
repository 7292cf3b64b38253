//! Variable references: a path into the run context plus default/transform.
//!
//! In definition files a reference is either a bare path string
//! (`"$.steps.fetch.output.items[0]"`) or a map with the optional extras:
//!
//! ```yaml
//! variables:
//!   title:
//!     path: $.input.title
//!     default: untitled
//!     transform: upper
//! ```

use serde::{Deserialize, Deserializer, Serialize};

/// A path expression evaluated against the workflow context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableRef {
    /// Path rooted at `$` (e.g. `$.input.name`, `$.steps.a.output`).
    pub path: String,
    /// Value used when navigation fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Named transform applied to the navigated (or default) value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
    /// Resolve a missing path to `null` instead of failing.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

impl VariableRef {
    /// A plain reference with no default and no transform.
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            default: None,
            transform: None,
            optional: false,
        }
    }

    /// Attach a default value.
    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Attach a named transform.
    pub fn with_transform(mut self, transform: impl Into<String>) -> Self {
        self.transform = Some(transform.into());
        self
    }

    /// Mark the reference optional (missing resolves to `null`).
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawVariableRef {
    Path(String),
    Full {
        path: String,
        #[serde(default)]
        default: Option<serde_json::Value>,
        #[serde(default)]
        transform: Option<String>,
        #[serde(default)]
        optional: bool,
    },
}

impl<'de> Deserialize<'de> for VariableRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawVariableRef::deserialize(deserializer)? {
            RawVariableRef::Path(path) => VariableRef::path(path),
            RawVariableRef::Full {
                path,
                default,
                transform,
                optional,
            } => VariableRef {
                path,
                default,
                transform,
                optional,
            },
        })
    }
}
