//! gqlconnect SDK
//!
//! A connector layer between an application and a GraphQL backend:
//! - `client`: HTTP transport with layered headers and bearer tokens
//! - `subscription`: Shared `graphql-transport-ws` connection with reconnects
//! - `token`: Token lifecycle with single-flight refresh
//! - `connector`: Uniform capability surface and the origin factory
//!
//! # Connector
//!
//! ```ignore
//! use gqlconnect_sdk::{create_connector, ConnectorConfig};
//! use gqlconnect_core::{Filter, QueryArgs, OrderBy};
//!
//! let config = ConnectorConfig::from_file("gqlconnect.json")?;
//! let connector = create_connector(config)?;
//!
//! let args = QueryArgs::new(vec!["id", "name"])
//!     .filter(Filter::eq("status", "active"))
//!     .order_by(OrderBy::desc("created_at"))
//!     .limit(10);
//! let result = connector.get("users", &args).await?;
//! ```
//!
//! # Subscriptions
//!
//! ```ignore
//! use gqlconnect_sdk::SubscriptionHandlers;
//!
//! let handle = connector
//!     .subscribe(
//!         "subscription { messages { id body } }",
//!         None,
//!         SubscriptionHandlers::new(|data| println!("{}", data)),
//!     )
//!     .await?;
//! handle.unsubscribe();
//! ```

pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod refresh;
pub mod store;
pub mod subscription;
pub mod token;

pub use client::{merge_headers, ClientConfig, GraphQLClient, QueryBuilder, Request, Response};
pub use config::{ConnectorConfig, DataOrigin, OriginSettings, ReconnectPolicy, TokenSettings};
pub use connector::{
    create_connector, BatchResult, Connector, HasuraConnector, MutationResult,
    PlaceholderConnector, QueryResult,
};
pub use error::{ConnectError, ConnectResult, ErrorCode, GraphQLError, ResultExt};
pub use refresh::{HttpTokenRefresher, TokenRefresher};
pub use store::{FileTokenStore, MemoryTokenStore, TokenStore, TOKEN_KEY};
pub use subscription::{
    SubscriptionClient, SubscriptionEvent, SubscriptionHandle, SubscriptionHandlers,
};
pub use token::{TokenManager, TokenManagerBuilder, TokenState};
