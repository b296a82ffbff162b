//! Multi-operation mutation documents.
//!
//! A batch becomes one `mutation { ... }` with an aliased root field per
//! operation, so N heterogeneous writes travel in one request.

use crate::document::{
    delete_field, insert_field, mutation, update_field, DeleteArgs, InsertArgs, UpdateArgs,
};
use crate::error::{DocumentError, DocumentResult};
use crate::filter::Filter;
use crate::selection::Returning;
use crate::value::Value;
use std::collections::HashSet;

/// Kind tag of a batch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchOperationKind {
    Insert,
    Update,
    Delete,
}

impl BatchOperationKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// One write in a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOperation {
    Insert {
        table: String,
        args: InsertArgs,
        alias: Option<String>,
    },
    Update {
        table: String,
        args: UpdateArgs,
        alias: Option<String>,
    },
    Delete {
        table: String,
        args: DeleteArgs,
        alias: Option<String>,
    },
}

impl BatchOperation {
    pub fn insert(table: impl Into<String>, args: InsertArgs) -> Self {
        Self::Insert {
            table: table.into(),
            args,
            alias: None,
        }
    }

    pub fn update(table: impl Into<String>, args: UpdateArgs) -> Self {
        Self::Update {
            table: table.into(),
            args,
            alias: None,
        }
    }

    pub fn delete(table: impl Into<String>, args: DeleteArgs) -> Self {
        Self::Delete {
            table: table.into(),
            args,
            alias: None,
        }
    }

    /// Sets the result alias for this operation.
    pub fn alias(mut self, name: impl Into<String>) -> Self {
        match &mut self {
            Self::Insert { alias, .. } | Self::Update { alias, .. } | Self::Delete { alias, .. } => {
                *alias = Some(name.into());
            }
        }
        self
    }

    pub fn kind(&self) -> BatchOperationKind {
        match self {
            Self::Insert { .. } => BatchOperationKind::Insert,
            Self::Update { .. } => BatchOperationKind::Update,
            Self::Delete { .. } => BatchOperationKind::Delete,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. } | Self::Update { table, .. } | Self::Delete { table, .. } => {
                table
            }
        }
    }

    fn explicit_alias(&self) -> Option<&str> {
        match self {
            Self::Insert { alias, .. } | Self::Update { alias, .. } | Self::Delete { alias, .. } => {
                alias.as_deref()
            }
        }
    }

    fn render(&self, alias: &str) -> DocumentResult<String> {
        match self {
            Self::Insert { table, args, .. } => insert_field(table, args, Some(alias)),
            Self::Update { table, args, .. } => update_field(table, args, Some(alias)),
            Self::Delete { table, args, .. } => delete_field(table, args, Some(alias)),
        }
    }
}

/// Decodes `{"type": "insert" | "update" | "delete", "table": ..., ...}`.
///
/// Payload keys: `data` for inserts, `data` + `where` for updates, `where`
/// for deletes; `returning` and `alias` are optional on all three.
impl TryFrom<serde_json::Value> for BatchOperation {
    type Error = DocumentError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        let serde_json::Value::Object(mut fields) = value else {
            return Err(DocumentError::InvalidOperation(
                "batch operation must be an object".into(),
            ));
        };

        let kind = match fields.remove("type") {
            Some(serde_json::Value::String(kind)) => kind,
            _ => {
                return Err(DocumentError::InvalidOperation(
                    "missing `type` tag".into(),
                ))
            }
        };
        let table = match fields.remove("table") {
            Some(serde_json::Value::String(table)) if !table.is_empty() => table,
            _ => {
                return Err(DocumentError::InvalidOperation(format!(
                    "{} operation is missing `table`",
                    kind
                )))
            }
        };
        let returning = fields.remove("returning").and_then(returning_from_json);
        let alias = fields
            .remove("alias")
            .and_then(|a| a.as_str().map(str::to_string));
        let data = fields.remove("data").map(Value::from).unwrap_or_default();
        let filter = fields.remove("where").map(Filter::from).unwrap_or_default();

        let operation = match kind.as_str() {
            "insert" => {
                let mut args = InsertArgs::from_value(data);
                args.returning = returning;
                Self::insert(table, args)
            }
            "update" => Self::update(
                table,
                UpdateArgs {
                    patch: data,
                    filter,
                    returning,
                },
            ),
            "delete" => Self::delete(table, DeleteArgs { filter, returning }),
            _ => return Err(DocumentError::UnknownOperation(kind)),
        };

        Ok(match alias {
            Some(alias) => operation.alias(alias),
            None => operation,
        })
    }
}

fn returning_from_json(value: serde_json::Value) -> Option<Returning> {
    match value {
        serde_json::Value::String(raw) => Some(Returning::from(raw.as_str())),
        serde_json::Value::Array(items) => Some(Returning::Fields(
            items
                .into_iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
        )),
        _ => None,
    }
}

/// A rendered batch and the alias each operation's result is found under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDocument {
    pub document: String,
    pub aliases: Vec<String>,
}

/// Builds one mutation document holding every operation.
///
/// Explicit aliases are used verbatim. Otherwise the alias is
/// `{type}_{table}`, or `{type}_{table}_{index}` when that name was already
/// taken earlier in the batch.
pub fn batch_document(operations: &[BatchOperation]) -> DocumentResult<BatchDocument> {
    if operations.is_empty() {
        return Err(DocumentError::EmptyBatch("batch"));
    }

    let mut taken = HashSet::new();
    let mut aliases = Vec::with_capacity(operations.len());
    let mut fields = Vec::with_capacity(operations.len());

    for (index, operation) in operations.iter().enumerate() {
        let alias = match operation.explicit_alias() {
            Some(alias) => alias.to_string(),
            None => {
                let base = format!("{}_{}", operation.kind().as_str(), operation.table());
                if taken.contains(&base) {
                    format!("{}_{}", base, index)
                } else {
                    base
                }
            }
        };
        fields.push(operation.render(&alias)?);
        taken.insert(alias.clone());
        aliases.push(alias);
    }

    Ok(BatchDocument {
        document: mutation(&fields.join(" ")),
        aliases,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rejects_empty_batch() {
        assert!(matches!(
            batch_document(&[]),
            Err(DocumentError::EmptyBatch("batch"))
        ));
    }

    #[test]
    fn test_default_aliases_are_unique() {
        let ops = [
            BatchOperation::delete("sessions", DeleteArgs::new(Filter::eq("user_id", 1))),
            BatchOperation::delete("sessions", DeleteArgs::new(Filter::eq("user_id", 2))),
            BatchOperation::delete("tokens", DeleteArgs::new(Filter::eq("user_id", 1)))
                .alias("revoked"),
        ];
        let batch = batch_document(&ops).unwrap();
        assert_eq!(
            batch.aliases,
            vec!["delete_sessions", "delete_sessions_1", "revoked"]
        );
    }

    #[test]
    fn test_invalid_member_fails_whole_batch() {
        let ops = [
            BatchOperation::insert("users", InsertArgs::one(json!({"name": "a"}))),
            BatchOperation::delete("users", DeleteArgs::new(Filter::new())),
        ];
        assert!(matches!(
            batch_document(&ops),
            Err(DocumentError::MissingFilter { .. })
        ));
    }

    #[test]
    fn test_decode_from_json() {
        let op = BatchOperation::try_from(json!({
            "type": "update",
            "table": "users",
            "data": {"name": "b"},
            "where": {"id": {"_eq": 1}},
            "returning": ["id"],
            "alias": "renamed"
        }))
        .unwrap();
        assert_eq!(op.kind(), BatchOperationKind::Update);
        assert_eq!(op.table(), "users");
        let batch = batch_document(&[op]).unwrap();
        assert_eq!(
            batch.document,
            r#"mutation { renamed: update_users(where: {id: {_eq: 1}}, _set: {name: "b"}) { affected_rows returning { id } } }"#
        );
    }

    #[test]
    fn test_unknown_tag() {
        let err = BatchOperation::try_from(json!({"type": "upsert", "table": "users"}))
            .unwrap_err();
        assert_eq!(err, DocumentError::UnknownOperation("upsert".into()));
    }

    #[test]
    fn test_missing_table() {
        let err = BatchOperation::try_from(json!({"type": "delete"})).unwrap_err();
        assert!(matches!(err, DocumentError::InvalidOperation(_)));
    }
}
