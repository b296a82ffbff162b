//! Connector configuration.
//!
//! Configuration is built in code with the fluent setters or loaded from a
//! JSON file. The connector keeps its own copy, so changes after
//! construction have no effect.
//!
//! ```json
//! {
//!   "origin": "hasura",
//!   "debug": false,
//!   "hasura": {
//!     "endpoint": "http://localhost:8080/v1/graphql",
//!     "streaming_endpoint": "ws://localhost:8080/v1/graphql",
//!     "headers": { "x-hasura-role": "user" },
//!     "refresh_endpoint": "http://localhost:3000/auth/refresh"
//!   }
//! }
//! ```

use crate::error::{ConnectError, ConnectResult, ErrorCode, ResultExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which backend the connector talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataOrigin {
    #[default]
    Hasura,
    /// Reserved for a second backend; every operation fails.
    Placeholder,
}

/// Connection settings for one origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginSettings {
    /// Target for queries and mutations.
    pub endpoint: String,
    /// WebSocket endpoint; subscriptions are unavailable without it.
    pub streaming_endpoint: Option<String>,
    /// Headers sent with every request at the lowest precedence.
    pub headers: HashMap<String, String>,
    /// Enables automatic token refresh.
    pub refresh_endpoint: Option<String>,
    /// Per-request timeout in seconds, left to the HTTP client when unset.
    pub timeout_secs: Option<u64>,
}

impl OriginSettings {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn streaming_endpoint(mut self, url: impl Into<String>) -> Self {
        self.streaming_endpoint = Some(url.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn refresh_endpoint(mut self, url: impl Into<String>) -> Self {
        self.refresh_endpoint = Some(url.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Exponential reconnect delays for the streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay_ms: u64::try_from(base_delay.as_millis()).unwrap_or(u64::MAX),
            max_delay_ms: u64::try_from(max_delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Delay before reconnect attempt `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt);
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Token lifecycle settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    /// Refresh this long before the decoded expiry.
    pub look_ahead_secs: u64,
    /// Directory of the durable token file; memory only when unset.
    pub storage_dir: Option<PathBuf>,
    /// Lifetime of the short-lived cached copy.
    pub session_max_age_secs: Option<u64>,
    /// After a failed refresh, fail fast for this long instead of retrying.
    pub refresh_cooldown_secs: u64,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            look_ahead_secs: 60,
            storage_dir: None,
            session_max_age_secs: None,
            refresh_cooldown_secs: 0,
        }
    }
}

/// Top-level connector configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub origin: DataOrigin,
    pub hasura: Option<OriginSettings>,
    pub placeholder: Option<OriginSettings>,
    /// Logs documents, variables and results at debug level.
    pub debug: bool,
    pub reconnect: ReconnectPolicy,
    pub token: TokenSettings,
}

impl ConnectorConfig {
    /// Hasura origin at the given endpoint.
    pub fn hasura(settings: OriginSettings) -> Self {
        Self {
            origin: DataOrigin::Hasura,
            hasura: Some(settings),
            ..Default::default()
        }
    }

    pub fn placeholder() -> Self {
        Self {
            origin: DataOrigin::Placeholder,
            ..Default::default()
        }
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn token(mut self, settings: TokenSettings) -> Self {
        self.token = settings;
        self
    }

    pub fn from_json_str(json: &str) -> ConnectResult<Self> {
        serde_json::from_str(json).map_connect_err_with(
            ErrorCode::NotConfigured,
            "invalid connector configuration",
        )
    }

    pub fn from_file(path: impl AsRef<Path>) -> ConnectResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_connect_err_with(
            ErrorCode::NotConfigured,
            format!("cannot read config file {}", path.display()),
        )?;
        Self::from_json_str(&contents)
    }

    /// Settings of the selected origin.
    pub fn settings(&self) -> Option<&OriginSettings> {
        match self.origin {
            DataOrigin::Hasura => self.hasura.as_ref(),
            DataOrigin::Placeholder => self.placeholder.as_ref(),
        }
    }

    pub fn settings_mut(&mut self) -> Option<&mut OriginSettings> {
        match self.origin {
            DataOrigin::Hasura => self.hasura.as_mut(),
            DataOrigin::Placeholder => self.placeholder.as_mut(),
        }
    }

    /// Checks that the selected origin has an endpoint.
    pub fn validate(&self) -> ConnectResult<()> {
        if self.origin == DataOrigin::Placeholder {
            return Ok(());
        }
        match self.settings() {
            Some(settings) if !settings.endpoint.trim().is_empty() => Ok(()),
            _ => Err(ConnectError::not_configured(
                "hasura origin requires an endpoint URL",
            )),
        }
    }
}
