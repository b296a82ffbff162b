//! Connector abstraction and factory.
//!
//! A [`Connector`] is the uniform capability surface handed to callers.
//! [`create_connector`] picks the implementation from
//! [`ConnectorConfig::origin`]:
//! - `hasura`: [`HasuraConnector`], documents built by `gqlconnect_core`
//! - `placeholder`: [`PlaceholderConnector`], every operation fails
//!
//! # Example
//!
//! ```ignore
//! use gqlconnect_sdk::{create_connector, ConnectorConfig, OriginSettings};
//! use gqlconnect_core::{Filter, QueryArgs};
//!
//! let connector = create_connector(ConnectorConfig::hasura(
//!     OriginSettings::new("http://localhost:8080/v1/graphql"),
//! ))?;
//! let users = connector
//!     .get("users", &QueryArgs::new(vec!["id", "name"]).filter(Filter::eq("active", true)))
//!     .await?;
//! ```

use crate::client::{ClientConfig, GraphQLClient};
use crate::config::{ConnectorConfig, DataOrigin};
use crate::error::{ConnectError, ConnectResult};
use crate::subscription::{SubscriptionClient, SubscriptionHandle, SubscriptionHandlers};
use crate::token::TokenManager;
use async_trait::async_trait;
use gqlconnect_core::{
    batch_document, delete_document, insert_document, query_document, update_document,
    update_many_document, BatchOperation, DeleteArgs, InsertArgs, QueryArgs, Returning,
    UpdateArgs, UpdateManyEntry,
};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Rows returned by [`Connector::get`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Json>,
    /// The `aggregate` object of `{table}_aggregate`, when one was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<Json>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Decodes the rows into a typed collection.
    pub fn rows_as<T: DeserializeOwned>(&self) -> ConnectResult<Vec<T>> {
        serde_json::from_value(Json::Array(self.rows.clone()))
            .map_err(|e| ConnectError::deserialize(e.to_string()))
    }
}

/// Hasura mutation response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    #[serde(default)]
    pub affected_rows: u64,
    #[serde(default)]
    pub returning: Vec<Json>,
}

/// Per-alias results of a batch, in operation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub results: IndexMap<String, MutationResult>,
}

impl BatchResult {
    pub fn get(&self, alias: &str) -> Option<&MutationResult> {
        self.results.get(alias)
    }

    pub fn total_affected_rows(&self) -> u64 {
        self.results.values().map(|r| r.affected_rows).sum()
    }
}

/// Uniform data access surface.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    fn origin(&self) -> DataOrigin;

    /// Runs a raw query document and returns `data`.
    async fn query(&self, document: &str, variables: Option<Json>) -> ConnectResult<Json>;

    /// Runs a raw mutation document and returns `data`.
    async fn mutate(&self, document: &str, variables: Option<Json>) -> ConnectResult<Json>;

    async fn subscribe(
        &self,
        document: &str,
        variables: Option<Json>,
        handlers: SubscriptionHandlers,
    ) -> ConnectResult<SubscriptionHandle>;

    async fn get(&self, table: &str, args: &QueryArgs) -> ConnectResult<QueryResult>;

    async fn insert(&self, table: &str, args: &InsertArgs) -> ConnectResult<MutationResult>;

    async fn update(&self, table: &str, args: &UpdateArgs) -> ConnectResult<MutationResult>;

    /// One result per entry, in entry order.
    async fn update_many(
        &self,
        table: &str,
        entries: &[UpdateManyEntry],
        returning: Option<&Returning>,
    ) -> ConnectResult<Vec<MutationResult>>;

    async fn delete(&self, table: &str, args: &DeleteArgs) -> ConnectResult<MutationResult>;

    /// Runs every operation in one mutation document.
    async fn batch(&self, operations: &[BatchOperation]) -> ConnectResult<BatchResult>;

    fn set_headers(&self, headers: HashMap<String, String>) -> ConnectResult<()>;

    fn set_header(&self, key: &str, value: &str) -> ConnectResult<()>;

    fn client(&self) -> ConnectResult<&GraphQLClient>;

    fn token_manager(&self) -> Option<&TokenManager>;
}

/// Builds the connector selected by `config.origin`.
pub fn create_connector(config: ConnectorConfig) -> ConnectResult<Arc<dyn Connector>> {
    match config.origin {
        DataOrigin::Hasura => Ok(Arc::new(HasuraConnector::new(config)?)),
        DataOrigin::Placeholder => Ok(Arc::new(PlaceholderConnector)),
    }
}

/// Connector for a Hasura GraphQL endpoint.
#[derive(Debug)]
pub struct HasuraConnector {
    config: ConnectorConfig,
    client: GraphQLClient,
    tokens: TokenManager,
    subscriptions: Option<SubscriptionClient>,
}

impl HasuraConnector {
    pub fn new(config: ConnectorConfig) -> ConnectResult<Self> {
        config.validate()?;
        let settings = config
            .settings()
            .cloned()
            .ok_or_else(|| ConnectError::not_configured("hasura origin has no settings"))?;

        let tokens = TokenManager::from_settings(
            &config.token,
            settings.refresh_endpoint.as_deref(),
            settings.timeout_duration(),
        )?;

        let mut client_config = ClientConfig::new(settings.endpoint.clone()).debug(config.debug);
        client_config.headers = settings.headers.clone();
        client_config.timeout = settings.timeout_duration();
        let client = GraphQLClient::with_config(client_config)?.with_token_manager(tokens.clone());

        let subscriptions = settings
            .streaming_endpoint
            .as_ref()
            .map(|url| SubscriptionClient::new(url.clone(), client.clone(), config.reconnect))
            .transpose()?;

        info!(
            endpoint = %settings.endpoint,
            streaming = subscriptions.is_some(),
            refresh = tokens.can_refresh(),
            "hasura connector ready"
        );

        Ok(Self {
            config,
            client,
            tokens,
            subscriptions,
        })
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    async fn run_mutation<T: DeserializeOwned>(
        &self,
        document: String,
        field: &str,
    ) -> ConnectResult<T> {
        let mut data = self.client.mutate(document, None).await?;
        take_field(&mut data, field)
    }
}

/// Removes `field` from a `data` object and decodes it.
fn take_field<T: DeserializeOwned>(data: &mut Json, field: &str) -> ConnectResult<T> {
    let value = data.get_mut(field).map(Json::take).unwrap_or(Json::Null);
    if value.is_null() {
        return Err(ConnectError::deserialize(format!(
            "response has no `{}` field",
            field
        )));
    }
    serde_json::from_value(value)
        .map_err(|e| ConnectError::deserialize(format!("invalid `{}` field: {}", field, e)))
}

#[async_trait]
impl Connector for HasuraConnector {
    fn origin(&self) -> DataOrigin {
        DataOrigin::Hasura
    }

    async fn query(&self, document: &str, variables: Option<Json>) -> ConnectResult<Json> {
        self.client.query(document, variables).await
    }

    async fn mutate(&self, document: &str, variables: Option<Json>) -> ConnectResult<Json> {
        self.client.mutate(document, variables).await
    }

    async fn subscribe(
        &self,
        document: &str,
        variables: Option<Json>,
        handlers: SubscriptionHandlers,
    ) -> ConnectResult<SubscriptionHandle> {
        let subscriptions = self.subscriptions.as_ref().ok_or_else(|| {
            ConnectError::not_configured("subscriptions require a streaming endpoint")
        })?;
        subscriptions.subscribe(document, variables, handlers).await
    }

    async fn get(&self, table: &str, args: &QueryArgs) -> ConnectResult<QueryResult> {
        let document = query_document(table, args);
        let mut data = self.client.query(document, None).await?;

        let rows = take_field(&mut data, table)?;
        let aggregate = if args.requested_aggregate().is_some() {
            let mut block: Json = take_field(&mut data, &format!("{}_aggregate", table))?;
            Some(block.get_mut("aggregate").map(Json::take).unwrap_or_default())
        } else {
            None
        };
        Ok(QueryResult { rows, aggregate })
    }

    async fn insert(&self, table: &str, args: &InsertArgs) -> ConnectResult<MutationResult> {
        let document = insert_document(table, args)?;
        self.run_mutation(document, &format!("insert_{}", table))
            .await
    }

    async fn update(&self, table: &str, args: &UpdateArgs) -> ConnectResult<MutationResult> {
        let document = update_document(table, args)?;
        self.run_mutation(document, &format!("update_{}", table))
            .await
    }

    async fn update_many(
        &self,
        table: &str,
        entries: &[UpdateManyEntry],
        returning: Option<&Returning>,
    ) -> ConnectResult<Vec<MutationResult>> {
        let document = update_many_document(table, entries, returning)?;
        self.run_mutation(document, &format!("update_{}_many", table))
            .await
    }

    async fn delete(&self, table: &str, args: &DeleteArgs) -> ConnectResult<MutationResult> {
        let document = delete_document(table, args)?;
        self.run_mutation(document, &format!("delete_{}", table))
            .await
    }

    async fn batch(&self, operations: &[BatchOperation]) -> ConnectResult<BatchResult> {
        let batch = batch_document(operations)?;
        debug!(operations = batch.aliases.len(), "running batch");
        let mut data = self.client.mutate(batch.document, None).await?;

        let mut results = IndexMap::with_capacity(batch.aliases.len());
        for alias in batch.aliases {
            let result = take_field(&mut data, &alias)?;
            results.insert(alias, result);
        }
        Ok(BatchResult { results })
    }

    fn set_headers(&self, headers: HashMap<String, String>) -> ConnectResult<()> {
        self.client.set_headers(headers);
        Ok(())
    }

    fn set_header(&self, key: &str, value: &str) -> ConnectResult<()> {
        self.client.set_header(key, value);
        Ok(())
    }

    fn client(&self) -> ConnectResult<&GraphQLClient> {
        Ok(&self.client)
    }

    fn token_manager(&self) -> Option<&TokenManager> {
        Some(&self.tokens)
    }
}

/// Stand-in for an unimplemented backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderConnector;

impl PlaceholderConnector {
    fn unavailable<T>() -> ConnectResult<T> {
        Err(ConnectError::not_configured(
            "the placeholder data origin is not implemented",
        ))
    }
}

#[async_trait]
impl Connector for PlaceholderConnector {
    fn origin(&self) -> DataOrigin {
        DataOrigin::Placeholder
    }

    async fn query(&self, _document: &str, _variables: Option<Json>) -> ConnectResult<Json> {
        Self::unavailable()
    }

    async fn mutate(&self, _document: &str, _variables: Option<Json>) -> ConnectResult<Json> {
        Self::unavailable()
    }

    async fn subscribe(
        &self,
        _document: &str,
        _variables: Option<Json>,
        _handlers: SubscriptionHandlers,
    ) -> ConnectResult<SubscriptionHandle> {
        Self::unavailable()
    }

    async fn get(&self, _table: &str, _args: &QueryArgs) -> ConnectResult<QueryResult> {
        Self::unavailable()
    }

    async fn insert(&self, _table: &str, _args: &InsertArgs) -> ConnectResult<MutationResult> {
        Self::unavailable()
    }

    async fn update(&self, _table: &str, _args: &UpdateArgs) -> ConnectResult<MutationResult> {
        Self::unavailable()
    }

    async fn update_many(
        &self,
        _table: &str,
        _entries: &[UpdateManyEntry],
        _returning: Option<&Returning>,
    ) -> ConnectResult<Vec<MutationResult>> {
        Self::unavailable()
    }

    async fn delete(&self, _table: &str, _args: &DeleteArgs) -> ConnectResult<MutationResult> {
        Self::unavailable()
    }

    async fn batch(&self, _operations: &[BatchOperation]) -> ConnectResult<BatchResult> {
        Self::unavailable()
    }

    fn set_headers(&self, _headers: HashMap<String, String>) -> ConnectResult<()> {
        Self::unavailable()
    }

    fn set_header(&self, _key: &str, _value: &str) -> ConnectResult<()> {
        Self::unavailable()
    }

    fn client(&self) -> ConnectResult<&GraphQLClient> {
        Self::unavailable()
    }

    fn token_manager(&self) -> Option<&TokenManager> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OriginSettings;
    use crate::error::ErrorCode;
    use serde_json::json;

    #[test]
    fn test_factory_selects_origin() {
        let hasura = create_connector(ConnectorConfig::hasura(OriginSettings::new(
            "http://localhost:8080/v1/graphql",
        )))
        .unwrap();
        assert_eq!(hasura.origin(), DataOrigin::Hasura);
        assert!(hasura.client().is_ok());

        let placeholder = create_connector(ConnectorConfig::placeholder()).unwrap();
        assert_eq!(placeholder.origin(), DataOrigin::Placeholder);
    }

    #[test]
    fn test_factory_rejects_missing_endpoint() {
        let err = create_connector(ConnectorConfig::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotConfigured);
    }

    #[tokio::test]
    async fn test_placeholder_is_not_configured() {
        let connector = PlaceholderConnector;
        let err = connector
            .get("users", &QueryArgs::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotConfigured);
        assert_eq!(
            connector.set_header("a", "b").unwrap_err().code,
            ErrorCode::NotConfigured
        );
        assert!(connector.token_manager().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_without_streaming_endpoint() {
        let connector = HasuraConnector::new(ConnectorConfig::hasura(OriginSettings::new(
            "http://localhost:8080/v1/graphql",
        )))
        .unwrap();
        let err = connector
            .subscribe("subscription { users { id } }", None, SubscriptionHandlers::new(|_| {}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotConfigured);
    }

    #[test]
    fn test_take_field() {
        let mut data = json!({"insert_users": {"affected_rows": 2, "returning": [{"id": 1}]}});
        let result: MutationResult = take_field(&mut data, "insert_users").unwrap();
        assert_eq!(result.affected_rows, 2);
        assert_eq!(result.returning, vec![json!({"id": 1})]);

        let err = take_field::<MutationResult>(&mut data, "delete_users").unwrap_err();
        assert_eq!(err.code, ErrorCode::DeserializeError);
    }

    #[test]
    fn test_batch_result_totals() {
        let mut results = IndexMap::new();
        results.insert("insert_users".to_string(), MutationResult { affected_rows: 2, returning: vec![] });
        results.insert("delete_posts".to_string(), MutationResult { affected_rows: 3, returning: vec![] });
        let batch = BatchResult { results };
        assert_eq!(batch.total_affected_rows(), 5);
        assert_eq!(batch.get("delete_posts").unwrap().affected_rows, 3);
    }
}
