//! Precondition failures raised while building documents.

use thiserror::Error;

/// An error raised before any document text is produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    /// Insert called without any records.
    #[error("insert into `{table}` requires at least one record")]
    EmptyData { table: String },

    /// Update called with nothing to set.
    #[error("update of `{table}` requires a non-empty patch")]
    EmptyPatch { table: String },

    /// Destructive operation called without a where clause.
    #[error("{operation} on `{table}` requires a non-empty filter")]
    MissingFilter { operation: &'static str, table: String },

    /// Batch or update-many called with nothing to do.
    #[error("{0} requires at least one operation")]
    EmptyBatch(&'static str),

    /// Batch operation with a tag other than insert, update or delete.
    #[error("unknown batch operation type `{0}`")]
    UnknownOperation(String),

    /// Batch operation description that could not be decoded.
    #[error("invalid batch operation: {0}")]
    InvalidOperation(String),
}

/// Result alias for document builders.
pub type DocumentResult<T> = std::result::Result<T, DocumentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_table() {
        let err = DocumentError::MissingFilter {
            operation: "delete",
            table: "users".into(),
        };
        assert_eq!(err.to_string(), "delete on `users` requires a non-empty filter");

        let err = DocumentError::EmptyData {
            table: "posts".into(),
        };
        assert!(err.to_string().contains("posts"));
    }
}
