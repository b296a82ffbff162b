//! GraphQL transport client.
//!
//! Sends documents to an HTTP GraphQL endpoint and classifies failures:
//! - Layered, case-insensitive headers
//! - Bearer tokens from a [`TokenManager`]
//! - Optional debug logging of every exchange
//!
//! # Example
//!
//! ```ignore
//! use gqlconnect_sdk::client::GraphQLClient;
//!
//! let client = GraphQLClient::new("http://localhost:8080/v1/graphql")?;
//! client.set_header("X-Hasura-Role", "user");
//!
//! let users: Vec<User> = client
//!     .request::<UsersData>("query { users { id name } }")
//!     .header("x-request-id", "abc")
//!     .execute()
//!     .await?
//!     .users;
//! ```

use crate::error::{ConnectError, ConnectResult, GraphQLError};
use crate::token::TokenManager;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const MAX_ERROR_BODY: usize = 512;

/// Client configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// URL of the GraphQL endpoint.
    pub endpoint: String,
    /// Default headers, lowest precedence.
    pub headers: HashMap<String, String>,
    /// Request timeout; the HTTP client's default when unset.
    pub timeout: Option<Duration>,
    /// Log documents, variables and results.
    pub debug: bool,
}

impl ClientConfig {
    /// Creates a new config with an endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Adds a default header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enables debug logging.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// A GraphQL request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Request {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<serde_json::Value>,
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    /// Per-call headers, highest precedence.
    #[serde(skip)]
    pub headers: HashMap<String, String>,
}

impl Request {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn variables(mut self, variables: serde_json::Value) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A GraphQL response envelope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub errors: Option<Vec<GraphQLError>>,
    #[serde(default)]
    pub extensions: Option<serde_json::Value>,
}

impl Response {
    /// Returns `data`, or the classified error when `errors` is non-empty.
    pub fn into_data(self) -> ConnectResult<serde_json::Value> {
        if let Some(errors) = self.errors.filter(|e| !e.is_empty()) {
            return Err(ConnectError::from_graphql(errors));
        }
        self.data
            .ok_or_else(|| ConnectError::unexpected("response contained neither data nor errors"))
    }
}

/// Merges header layers; later layers win and keys are lowercased first.
pub fn merge_headers<'a, I>(layers: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = &'a HashMap<String, String>>,
{
    let mut merged = HashMap::new();
    for layer in layers {
        for (key, value) in layer {
            merged.insert(key.to_ascii_lowercase(), value.clone());
        }
    }
    merged
}

/// HTTP GraphQL client.
#[derive(Clone)]
pub struct GraphQLClient {
    config: Arc<ClientConfig>,
    http: reqwest::Client,
    instance_headers: Arc<RwLock<HashMap<String, String>>>,
    tokens: Option<TokenManager>,
}

impl std::fmt::Debug for GraphQLClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphQLClient")
            .field("endpoint", &self.config.endpoint)
            .field("debug", &self.config.debug)
            .finish_non_exhaustive()
    }
}

impl GraphQLClient {
    /// Creates a client for the given endpoint.
    pub fn new(endpoint: impl Into<String>) -> ConnectResult<Self> {
        Self::with_config(ClientConfig::new(endpoint))
    }

    /// Creates a client with configuration.
    pub fn with_config(config: ClientConfig) -> ConnectResult<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            config: Arc::new(config),
            http: builder.build()?,
            instance_headers: Arc::new(RwLock::new(HashMap::new())),
            tokens: None,
        })
    }

    /// Attaches bearer tokens from a token manager to every request.
    pub fn with_token_manager(mut self, tokens: TokenManager) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn token_manager(&self) -> Option<&TokenManager> {
        self.tokens.as_ref()
    }

    /// Replaces the instance headers.
    pub fn set_headers(&self, headers: HashMap<String, String>) {
        *self.instance_headers.write() = merge_headers([&headers]);
    }

    /// Adds or replaces one instance header.
    pub fn set_header(&self, key: impl Into<String>, value: impl Into<String>) {
        self.instance_headers
            .write()
            .insert(key.into().to_ascii_lowercase(), value.into());
    }

    /// Headers a request would be sent with.
    ///
    /// Precedence: defaults < instance headers < bearer token < per-call.
    pub async fn effective_headers(
        &self,
        per_call: &HashMap<String, String>,
    ) -> ConnectResult<HashMap<String, String>> {
        let instance = self.instance_headers.read().clone();
        let mut auth = HashMap::new();
        if let Some(tokens) = &self.tokens {
            if let Some(token) = tokens.get_valid_token().await? {
                auth.insert("authorization".to_string(), format!("Bearer {}", token));
            }
        }
        Ok(merge_headers([&self.config.headers, &instance, &auth, per_call]))
    }

    /// Runs a query document and returns its `data`.
    pub async fn query(
        &self,
        document: impl Into<String>,
        variables: Option<serde_json::Value>,
    ) -> ConnectResult<serde_json::Value> {
        let mut request = Request::new(document);
        request.variables = variables;
        self.execute(request).await?.into_data()
    }

    /// Runs a mutation document and returns its `data`.
    pub async fn mutate(
        &self,
        document: impl Into<String>,
        variables: Option<serde_json::Value>,
    ) -> ConnectResult<serde_json::Value> {
        self.query(document, variables).await
    }

    /// Creates a typed request builder.
    pub fn request<T: DeserializeOwned>(&self, document: impl Into<String>) -> QueryBuilder<T> {
        QueryBuilder {
            client: self.clone(),
            request: Request::new(document),
            _phantom: PhantomData,
        }
    }

    /// Sends a request and returns the raw envelope.
    ///
    /// Transport and HTTP failures are errors; GraphQL errors inside a
    /// successful response are left in the envelope.
    pub async fn execute(&self, request: Request) -> ConnectResult<Response> {
        let headers = self.effective_headers(&request.headers).await?;
        let header_map = to_header_map(&headers)?;

        if self.config.debug {
            debug!(
                endpoint = %self.config.endpoint,
                document = %request.query,
                variables = ?request.variables,
                "sending GraphQL document"
            );
        }

        let result = self.send(&request, header_map).await;

        if self.config.debug {
            match &result {
                Ok(response) => debug!(
                    data = ?response.data,
                    errors = ?response.errors,
                    "GraphQL response"
                ),
                Err(err) => debug!(error = %err, "GraphQL request failed"),
            }
        }

        result
    }

    async fn send(&self, request: &Request, headers: HeaderMap) -> ConnectResult<Response> {
        let response = self
            .http
            .post(&self.config.endpoint)
            .headers(headers)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            // Some endpoints put GraphQL errors in non-2xx bodies.
            if let Ok(Response {
                errors: Some(errors),
                ..
            }) = serde_json::from_slice::<Response>(&bytes)
            {
                if !errors.is_empty() {
                    let mut err = ConnectError::from_graphql(errors);
                    err.status = Some(status.as_u16());
                    return Err(err);
                }
            }
            return Err(ConnectError::from_status(
                status.as_u16(),
                truncate_body(&bytes),
            ));
        }

        serde_json::from_slice(&bytes).map_err(|e| {
            ConnectError::deserialize(format!(
                "failed to parse response: {}. Body: {}",
                e,
                truncate_body(&bytes)
            ))
        })
    }
}

fn to_header_map(headers: &HashMap<String, String>) -> ConnectResult<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len() + 1);
    map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| ConnectError::validation(format!("invalid header name `{}`", key)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ConnectError::validation(format!("invalid value for header `{}`", key)))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn truncate_body(bytes: &[u8]) -> String {
    let body = String::from_utf8_lossy(bytes);
    body.chars().take(MAX_ERROR_BODY).collect()
}

/// A typed request builder.
pub struct QueryBuilder<T> {
    client: GraphQLClient,
    request: Request,
    _phantom: PhantomData<T>,
}

impl<T: DeserializeOwned> QueryBuilder<T> {
    /// Sets the variables.
    pub fn variables<V: Serialize>(mut self, variables: V) -> ConnectResult<Self> {
        let value = serde_json::to_value(variables)
            .map_err(|e| ConnectError::serialize(e.to_string()))?;
        self.request.variables = Some(value);
        Ok(self)
    }

    /// Sets the operation name.
    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.request.operation_name = Some(name.into());
        self
    }

    /// Adds a per-call header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.headers.insert(key.into(), value.into());
        self
    }

    /// Executes the request and decodes `data` into `T`.
    pub async fn execute(self) -> ConnectResult<T> {
        let data = self.client.execute(self.request).await?.into_data()?;
        serde_json::from_value(data).map_err(|e| ConnectError::deserialize(e.to_string()))
    }

    /// Executes the request and returns the raw envelope.
    pub async fn execute_raw(self) -> ConnectResult<Response> {
        self.client.execute(self.request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    #[test]
    fn test_client_config() {
        let config = ClientConfig::new("http://localhost:8080/v1/graphql")
            .timeout(Duration::from_secs(10))
            .header("X-Hasura-Role", "user");

        assert_eq!(config.endpoint, "http://localhost:8080/v1/graphql");
        assert_eq!(config.timeout, Some(Duration::from_secs(10)));
        assert!(!config.debug);
    }

    #[test]
    fn test_merge_headers_is_case_insensitive() {
        let defaults = HashMap::from([
            ("X-Hasura-Role".to_string(), "anonymous".to_string()),
            ("Accept".to_string(), "application/json".to_string()),
        ]);
        let per_call = HashMap::from([("x-hasura-role".to_string(), "admin".to_string())]);

        let merged = merge_headers([&defaults, &per_call]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["x-hasura-role"], "admin");
        assert_eq!(merged["accept"], "application/json");
    }

    #[tokio::test]
    async fn test_instance_headers_sit_between_defaults_and_per_call() {
        let client = GraphQLClient::with_config(
            ClientConfig::new("http://localhost:8080/v1/graphql")
                .header("X-Role", "default")
                .header("X-Tenant", "acme"),
        )
        .unwrap();
        client.set_header("x-role", "instance");
        client.set_header("X-Trace", "instance");

        let per_call = HashMap::from([("X-TRACE".to_string(), "call".to_string())]);
        let headers = client.effective_headers(&per_call).await.unwrap();

        assert_eq!(headers["x-role"], "instance");
        assert_eq!(headers["x-tenant"], "acme");
        assert_eq!(headers["x-trace"], "call");
    }

    #[test]
    fn test_set_headers_replaces() {
        let client = GraphQLClient::new("http://localhost:8080/v1/graphql").unwrap();
        client.set_header("a", "1");
        client.set_headers(HashMap::from([("B".to_string(), "2".to_string())]));
        let instance = client.instance_headers.read().clone();
        assert_eq!(instance, HashMap::from([("b".to_string(), "2".to_string())]));
    }

    #[test]
    fn test_request_serialization() {
        let request = Request::new("query { hello }").variables(json!({"id": 1}));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value, json!({"query": "query { hello }", "variables": {"id": 1}}));
    }

    #[test]
    fn test_into_data_prefers_errors() {
        let response: Response = serde_json::from_value(json!({
            "data": {"users": []},
            "errors": [{"message": "partial failure"}]
        }))
        .unwrap();
        let err = response.into_data().unwrap_err();
        assert_eq!(err.code, ErrorCode::GraphQL);
        assert_eq!(err.message, "partial failure");
    }

    #[test]
    fn test_invalid_header_name() {
        let headers = HashMap::from([("bad header".to_string(), "x".to_string())]);
        let err = to_header_map(&headers).unwrap_err();
        assert!(err.is_validation());
    }
}
