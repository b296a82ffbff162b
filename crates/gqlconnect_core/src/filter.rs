//! Where clauses, ordering and upsert conflicts.

use crate::value::{Object, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A boolean expression over table columns, e.g. `{role: {_eq: "admin"}}`.
///
/// Field comparisons and `_and` / `_or` / `_not` groups may be mixed at the
/// same level.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter(Object);

impl Filter {
    /// Creates an empty filter.
    pub fn new() -> Self {
        Self(Object::new())
    }

    /// Adds a condition for a field.
    ///
    /// ```
    /// use gqlconnect_core::{Filter, Value};
    ///
    /// let filter = Filter::new().field("role", Value::object([("_eq", "admin")]));
    /// assert_eq!(filter.to_string(), r#"{role: {_eq: "admin"}}"#);
    /// ```
    pub fn field(mut self, name: impl Into<String>, condition: impl Into<Value>) -> Self {
        self.0.insert(name.into(), condition.into());
        self
    }

    /// Shorthand for `{field: {_eq: value}}`.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new().field(field, Value::object([("_eq", value.into())]))
    }

    /// `{_and: [...]}`
    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::group("_and", filters)
    }

    /// `{_or: [...]}`
    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::group("_or", filters)
    }

    /// `{_not: {...}}`
    pub fn not(filter: Filter) -> Self {
        Self::new().field("_not", Value::Object(filter.0))
    }

    fn group(key: &str, filters: impl IntoIterator<Item = Filter>) -> Self {
        let list = filters.into_iter().map(|f| Value::Object(f.0)).collect();
        Self::new().field(key, Value::List(list))
    }

    /// Merges another filter's top-level conditions into this one.
    pub fn merge(mut self, other: Filter) -> Self {
        self.0.extend(other.0);
        self
    }

    /// Returns true when the filter has no conditions.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the underlying object.
    pub fn as_object(&self) -> &Object {
        &self.0
    }

    /// Converts the filter into an argument value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}

impl From<Object> for Filter {
    fn from(fields: Object) -> Self {
        Self(fields)
    }
}

/// Non-object JSON yields an empty filter, which destructive builders reject.
impl From<serde_json::Value> for Filter {
    fn from(value: serde_json::Value) -> Self {
        match Value::from(value) {
            Value::Object(fields) => Self(fields),
            _ => Self::new(),
        }
    }
}

impl From<Filter> for Value {
    fn from(filter: Filter) -> Self {
        filter.into_value()
    }
}

/// Sort direction, printed as the Hasura `order_by` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
    AscNullsFirst,
    AscNullsLast,
    DescNullsFirst,
    DescNullsLast,
}

impl OrderDirection {
    /// Returns the enum literal.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
            Self::AscNullsFirst => "asc_nulls_first",
            Self::AscNullsLast => "asc_nulls_last",
            Self::DescNullsFirst => "desc_nulls_first",
            Self::DescNullsLast => "desc_nulls_last",
        }
    }
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            "asc_nulls_first" => Ok(Self::AscNullsFirst),
            "asc_nulls_last" => Ok(Self::AscNullsLast),
            "desc_nulls_first" => Ok(Self::DescNullsFirst),
            "desc_nulls_last" => Ok(Self::DescNullsLast),
            other => Err(format!("unknown sort direction `{}`", other)),
        }
    }
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: OrderDirection,
}

impl OrderBy {
    /// Creates a sort key on `field`.
    pub fn new(field: impl Into<String>, direction: OrderDirection) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    /// Ascending sort on `field`.
    pub fn asc(field: impl Into<String>) -> Self {
        Self::new(field, OrderDirection::Asc)
    }

    /// Descending sort on `field`.
    pub fn desc(field: impl Into<String>) -> Self {
        Self::new(field, OrderDirection::Desc)
    }

    /// Renders a sort sequence; a single key prints as an object, more as a list.
    pub fn to_value(order: &[OrderBy]) -> Value {
        let mut items: Vec<Value> = order
            .iter()
            .map(|o| Value::object([(o.field.clone(), Value::enum_value(o.direction.as_str()))]))
            .collect();
        if items.len() == 1 {
            items.remove(0)
        } else {
            Value::List(items)
        }
    }
}

/// Parses `field` or `field:direction`.
impl FromStr for OrderBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((field, direction)) => Ok(Self::new(field.trim(), direction.trim().parse()?)),
            None => Ok(Self::asc(s.trim())),
        }
    }
}

/// Upsert configuration for inserts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OnConflict {
    pub constraint: Option<String>,
    pub update_columns: Vec<String>,
    pub filter: Option<Filter>,
}

impl OnConflict {
    /// Upsert on the named constraint.
    pub fn new(constraint: impl Into<String>) -> Self {
        Self {
            constraint: Some(constraint.into()),
            ..Default::default()
        }
    }

    /// Columns overwritten when the constraint conflicts.
    pub fn update_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.update_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Only rows matching `filter` are updated on conflict.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Renders the `on_conflict` argument object.
    pub fn to_value(&self) -> Value {
        let mut fields = Object::new();
        if let Some(constraint) = &self.constraint {
            fields.insert("constraint".into(), Value::enum_value(constraint));
        }
        fields.insert(
            "update_columns".into(),
            Value::List(
                self.update_columns
                    .iter()
                    .map(|c| Value::enum_value(c.as_str()))
                    .collect(),
            ),
        );
        if let Some(filter) = self.filter.as_ref().filter(|f| !f.is_empty()) {
            fields.insert("where".into(), filter.clone().into_value());
        }
        Value::Object(fields)
    }
}
