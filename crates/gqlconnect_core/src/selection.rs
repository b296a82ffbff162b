//! Selection sets, returning specs and aggregate blocks.

use indexmap::IndexMap;
use std::fmt;

/// What to select from a table.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// `id name email`
    Fields(Vec<String>),
    /// A selection set body written by hand, without the outer braces.
    Raw(String),
    /// `{ id posts { title } }` built from a tree.
    Nested(IndexMap<String, SelectionNode>),
}

/// A node in a nested selection.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionNode {
    /// Bare field.
    Include,
    /// Field with its own selection.
    Nested(IndexMap<String, SelectionNode>),
}

impl Selection {
    /// Selects a flat list of fields.
    pub fn fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Fields(fields.into_iter().map(Into::into).collect())
    }

    /// Selects a hand-written selection set body.
    pub fn raw(body: impl Into<String>) -> Self {
        Self::Raw(body.into())
    }

    /// Returns true when nothing would be selected.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Fields(fields) => fields.is_empty(),
            Self::Raw(body) => body.trim().is_empty(),
            Self::Nested(tree) => tree.is_empty(),
        }
    }
}

impl Default for Selection {
    fn default() -> Self {
        Self::Fields(vec!["id".to_string()])
    }
}

/// Renders the selection body without the enclosing braces.
impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fields(fields) => f.write_str(&fields.join(" ")),
            Self::Raw(body) => f.write_str(body.trim()),
            Self::Nested(tree) => write_tree(f, tree),
        }
    }
}

fn write_tree(f: &mut fmt::Formatter<'_>, tree: &IndexMap<String, SelectionNode>) -> fmt::Result {
    for (i, (name, node)) in tree.iter().enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        f.write_str(name)?;
        if let SelectionNode::Nested(children) = node {
            f.write_str(" { ")?;
            write_tree(f, children)?;
            f.write_str(" }")?;
        }
    }
    Ok(())
}

/// Arrays become field lists, strings raw bodies, objects trees in which
/// `true` includes a field and `false` / `null` drop it.
impl From<serde_json::Value> for Selection {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(body) => Self::Raw(body),
            serde_json::Value::Array(items) => Self::Fields(
                items
                    .into_iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect(),
            ),
            serde_json::Value::Object(fields) => Self::Nested(tree_from_json(fields)),
            _ => Self::default(),
        }
    }
}

fn tree_from_json(
    fields: serde_json::Map<String, serde_json::Value>,
) -> IndexMap<String, SelectionNode> {
    fields
        .into_iter()
        .filter_map(|(name, value)| match value {
            serde_json::Value::Bool(true) => Some((name, SelectionNode::Include)),
            serde_json::Value::Object(children) => {
                Some((name, SelectionNode::Nested(tree_from_json(children))))
            }
            _ => None,
        })
        .collect()
}

impl From<Vec<&str>> for Selection {
    fn from(fields: Vec<&str>) -> Self {
        Self::fields(fields)
    }
}

impl From<Vec<String>> for Selection {
    fn from(fields: Vec<String>) -> Self {
        Self::Fields(fields)
    }
}

impl From<&str> for Selection {
    fn from(body: &str) -> Self {
        Self::raw(body)
    }
}

/// Fields returned by a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Returning {
    Field(String),
    Fields(Vec<String>),
    Raw(String),
}

impl Returning {
    pub fn fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Fields(fields.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Field(field) | Self::Raw(field) => field.trim().is_empty(),
            Self::Fields(fields) => fields.is_empty(),
        }
    }
}

impl fmt::Display for Returning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(field) => f.write_str(field.trim()),
            Self::Fields(fields) => f.write_str(&fields.join(" ")),
            Self::Raw(body) => f.write_str(body.trim()),
        }
    }
}

impl From<&str> for Returning {
    fn from(text: &str) -> Self {
        if text.trim().contains(char::is_whitespace) {
            Self::Raw(text.to_string())
        } else {
            Self::Field(text.to_string())
        }
    }
}

impl From<Vec<&str>> for Returning {
    fn from(fields: Vec<&str>) -> Self {
        Self::fields(fields)
    }
}

impl From<Vec<String>> for Returning {
    fn from(fields: Vec<String>) -> Self {
        Self::Fields(fields)
    }
}

/// Aggregate block appended to a query as `{table}_aggregate`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Aggregate {
    pub count: bool,
    /// Aggregate function name (`sum`, `avg`, `max`, ...) to column list.
    pub functions: IndexMap<String, Vec<String>>,
}

impl Aggregate {
    /// Aggregate with `count` only.
    pub fn count() -> Self {
        Self {
            count: true,
            functions: IndexMap::new(),
        }
    }

    /// Adds an aggregate function over columns.
    pub fn function<I, S>(mut self, name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.functions
            .insert(name.into(), columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_empty(&self) -> bool {
        !self.count && self.functions.is_empty()
    }
}

/// Renders the inner `aggregate { ... }` body.
impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.count {
            parts.push("count".to_string());
        }
        for (function, columns) in &self.functions {
            parts.push(format!("{} {{ {} }}", function, columns.join(" ")));
        }
        write!(f, "aggregate {{ {} }}", parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flat_fields() {
        assert_eq!(Selection::fields(["id", "name"]).to_string(), "id name");
    }

    #[test]
    fn test_nested_tree() {
        let selection = Selection::from(json!({
            "id": true,
            "secret": false,
            "posts": {"title": true, "author": {"name": true}}
        }));
        assert_eq!(
            selection.to_string(),
            "id posts { title author { name } }"
        );
    }

    #[test]
    fn test_raw_is_trimmed() {
        assert_eq!(Selection::from("  id  name ").to_string(), "id  name");
    }

    #[test]
    fn test_returning_normalisation() {
        assert_eq!(Returning::from("id").to_string(), "id");
        assert_eq!(Returning::from(vec!["id", "name"]).to_string(), "id name");
        assert!(matches!(Returning::from("id name"), Returning::Raw(_)));
    }

    #[test]
    fn test_aggregate_body() {
        let aggregate = Aggregate::count().function("sum", ["amount"]);
        assert_eq!(
            aggregate.to_string(),
            "aggregate { count sum { amount } }"
        );
        assert!(Aggregate::default().is_empty());
    }
}
