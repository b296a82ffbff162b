//! Typed error system for the gqlconnect SDK.
//!
//! Every failure carries an [`ErrorCode`] so callers can branch on the kind
//! (re-authenticate, retry, fix a bug) without matching on messages.

use gqlconnect_core::DocumentError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Extension codes that mark a GraphQL error as an authorization failure.
const PERMISSION_CODES: &[&str] = &[
    "access-denied",
    "permission-denied",
    "permission-error",
    "invalid-jwt",
    "invalid-headers",
    "jwt-invalid-claims",
    "UNAUTHENTICATED",
    "FORBIDDEN",
];

/// Error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    /// Precondition failed before any I/O.
    Validation,
    /// Transport could not reach the endpoint or got a non-GraphQL failure.
    Network,
    /// The endpoint returned GraphQL errors.
    #[serde(rename = "GRAPHQL")]
    GraphQL,
    /// GraphQL or HTTP error classified as an auth failure.
    PermissionDenied,
    /// A capability was used without being configured.
    NotConfigured,
    SerializeError,
    DeserializeError,
    /// The token refresh endpoint failed.
    TokenRefresh,
    /// Anything not classified above.
    Unexpected,
}

impl ErrorCode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::Network => "NETWORK",
            Self::GraphQL => "GRAPHQL",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::NotConfigured => "NOT_CONFIGURED",
            Self::SerializeError => "SERIALIZE_ERROR",
            Self::DeserializeError => "DESERIALIZE_ERROR",
            Self::TokenRefresh => "TOKEN_REFRESH",
            Self::Unexpected => "UNEXPECTED",
        }
    }

    /// Only transport failures are worth retrying unchanged.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A GraphQL error as returned by the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<HashMap<String, serde_json::Value>>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }

    /// Returns `extensions.code`, if any.
    pub fn code(&self) -> Option<&str> {
        self.extensions
            .as_ref()
            .and_then(|ext| ext.get("code"))
            .and_then(serde_json::Value::as_str)
    }

    pub fn is_permission_denied(&self) -> bool {
        self.code()
            .map(|code| PERMISSION_CODES.contains(&code))
            .unwrap_or(false)
    }
}

/// SDK error.
#[derive(Error, Debug, Clone)]
#[error("[{code}] {message}")]
pub struct ConnectError {
    pub code: ErrorCode,
    pub message: String,
    /// Raw errors returned by the endpoint, first one first.
    pub graphql_errors: Vec<GraphQLError>,
    /// HTTP status, when the failure came with one.
    pub status: Option<u16>,
    pub extensions: Option<HashMap<String, serde_json::Value>>,
}

impl ConnectError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            graphql_errors: Vec::new(),
            status: None,
            extensions: None,
        }
    }

    /// Classifies a non-empty list of GraphQL errors.
    ///
    /// The first error supplies the message; an auth extension code on any
    /// of them promotes the result to [`ErrorCode::PermissionDenied`].
    pub fn from_graphql(errors: Vec<GraphQLError>) -> Self {
        let message = errors
            .first()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "GraphQL error".to_string());
        let code = if errors.iter().any(GraphQLError::is_permission_denied) {
            ErrorCode::PermissionDenied
        } else {
            ErrorCode::GraphQL
        };
        Self {
            graphql_errors: errors,
            ..Self::new(code, message)
        }
    }

    /// Classifies a non-success HTTP status without a GraphQL body.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let code = match status {
            401 | 403 => ErrorCode::PermissionDenied,
            _ => ErrorCode::Network,
        };
        Self {
            status: Some(status),
            ..Self::new(code, format!("HTTP {}: {}", status, body.into()))
        }
    }

    /// Attaches an extension entry; values that fail to serialize are skipped.
    pub fn with_extension(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let extensions = self.extensions.get_or_insert_with(HashMap::new);
        if let Ok(v) = serde_json::to_value(value) {
            extensions.insert(key.into(), v);
        }
        self
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Network, message)
    }

    /// Creates a not-configured error.
    pub fn not_configured(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotConfigured, message)
    }

    /// Creates a permission-denied error.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    /// Creates a token refresh error.
    pub fn token_refresh(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TokenRefresh, message)
    }

    /// Creates a serialization error.
    pub fn serialize(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SerializeError, message)
    }

    /// Creates a deserialization error.
    pub fn deserialize(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeserializeError, message)
    }

    /// Creates an unexpected error.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unexpected, message)
    }

    /// Whether the request may succeed if sent again.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn is_permission_denied(&self) -> bool {
        self.code == ErrorCode::PermissionDenied
    }

    pub fn is_validation(&self) -> bool {
        self.code == ErrorCode::Validation
    }
}

impl Serialize for ConnectError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("ConnectError", 4)?;
        state.serialize_field("code", &self.code)?;
        state.serialize_field("message", &self.message)?;
        if !self.graphql_errors.is_empty() {
            state.serialize_field("errors", &self.graphql_errors)?;
        }
        if let Some(ref ext) = self.extensions {
            state.serialize_field("extensions", ext)?;
        }
        state.end()
    }
}

impl From<DocumentError> for ConnectError {
    fn from(err: DocumentError) -> Self {
        Self::validation(err.to_string())
    }
}

impl From<reqwest::Error> for ConnectError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        let code = if err.is_decode() {
            ErrorCode::DeserializeError
        } else if err.is_builder() {
            ErrorCode::Unexpected
        } else {
            ErrorCode::Network
        };
        Self {
            status,
            ..Self::new(code, err.to_string())
        }
    }
}

impl From<serde_json::Error> for ConnectError {
    fn from(err: serde_json::Error) -> Self {
        Self::deserialize(err.to_string())
    }
}

/// Type alias for SDK results.
pub type ConnectResult<T> = std::result::Result<T, ConnectError>;

/// Result extension for mapping foreign errors into a code.
pub trait ResultExt<T> {
    fn map_connect_err(self, code: ErrorCode) -> ConnectResult<T>;

    fn map_connect_err_with(self, code: ErrorCode, message: impl Into<String>) -> ConnectResult<T>;
}

impl<T, E: std::error::Error> ResultExt<T> for std::result::Result<T, E> {
    fn map_connect_err(self, code: ErrorCode) -> ConnectResult<T> {
        self.map_err(|e| ConnectError::new(code, e.to_string()))
    }

    fn map_connect_err_with(self, code: ErrorCode, message: impl Into<String>) -> ConnectResult<T> {
        self.map_err(|e| {
            ConnectError::new(code, message).with_extension("original_error", e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn error_with_code(message: &str, code: &str) -> GraphQLError {
        serde_json::from_value(json!({
            "message": message,
            "extensions": {"code": code, "path": "$"}
        }))
        .unwrap()
    }

    #[test]
    fn test_first_error_supplies_message() {
        let err = ConnectError::from_graphql(vec![
            error_with_code("field not found", "validation-failed"),
            GraphQLError::new("second"),
        ]);
        assert_eq!(err.code, ErrorCode::GraphQL);
        assert_eq!(err.message, "field not found");
        assert_eq!(err.graphql_errors.len(), 2);
    }

    #[test]
    fn test_permission_codes_are_promoted() {
        let err = ConnectError::from_graphql(vec![error_with_code(
            "Could not verify JWT",
            "invalid-jwt",
        )]);
        assert!(err.is_permission_denied());

        let err = ConnectError::from_graphql(vec![error_with_code("nope", "access-denied")]);
        assert_eq!(err.code, ErrorCode::PermissionDenied);
    }

    #[test]
    fn test_status_classification() {
        assert!(ConnectError::from_status(401, "").is_permission_denied());
        assert_eq!(ConnectError::from_status(502, "bad gateway").code, ErrorCode::Network);
        assert!(ConnectError::from_status(503, "").is_retryable());
    }

    #[test]
    fn test_document_errors_are_validation() {
        let err: ConnectError = gqlconnect_core::DocumentError::EmptyBatch("batch").into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_serialization() {
        let err = ConnectError::network("Connection failed");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("NETWORK"));
        assert!(json.contains("Connection failed"));
    }

    #[test]
    fn test_result_ext() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));
        let err = result
            .map_connect_err_with(ErrorCode::NotConfigured, "config missing")
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotConfigured);
        assert!(err.extensions.is_some());
    }
}
