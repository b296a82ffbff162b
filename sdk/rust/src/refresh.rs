//! Token refresh backends.

use crate::error::{ConnectError, ConnectResult};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;

/// Obtains a new bearer token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// `current` is the cached token, possibly expired, if one exists.
    async fn refresh(&self, current: Option<String>) -> ConnectResult<String>;
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(alias = "access_token", alias = "accessToken")]
    token: String,
}

/// POSTs to a refresh endpoint and reads the new token from the JSON body.
#[derive(Debug, Clone)]
pub struct HttpTokenRefresher {
    endpoint: String,
    http: reqwest::Client,
}

impl HttpTokenRefresher {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(endpoint, reqwest::Client::new())
    }

    pub fn with_client(endpoint: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            endpoint: endpoint.into(),
            http,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, current: Option<String>) -> ConnectResult<String> {
        let mut request = self.http.post(&self.endpoint);
        if let Some(token) = current {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request.send().await.map_err(|e| {
            let mut err = ConnectError::from(e);
            err.message = format!("token refresh failed: {}", err.message);
            err
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let mut err = ConnectError::from_status(status.as_u16(), body);
            if !err.is_permission_denied() {
                err.code = crate::error::ErrorCode::TokenRefresh;
            }
            return Err(err);
        }

        let body: RefreshResponse = response.json().await.map_err(|e| {
            ConnectError::token_refresh(format!("refresh response had no token: {}", e))
        })?;
        if body.token.trim().is_empty() {
            return Err(ConnectError::token_refresh("refresh endpoint returned an empty token"));
        }
        Ok(body.token)
    }
}
