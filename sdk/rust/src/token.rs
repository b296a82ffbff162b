//! Bearer token lifecycle.
//!
//! [`TokenManager`] keeps one logical token slot backed by a short-lived
//! store and a durable store. A token inside the look-ahead window of its
//! `exp` claim is refreshed before use, and concurrent callers share a
//! single in-flight refresh: one request to the refresh endpoint, one
//! outcome delivered to every waiter.

use crate::config::TokenSettings;
use crate::error::{ConnectError, ConnectResult};
use crate::refresh::{HttpTokenRefresher, TokenRefresher};
use crate::store::{FileTokenStore, MemoryTokenStore, TokenStore};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use jsonwebtoken::{DecodingKey, Validation};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Default refresh look-ahead.
pub const DEFAULT_LOOK_AHEAD: Duration = Duration::from_secs(60);

type SharedRefresh = Shared<BoxFuture<'static, ConnectResult<String>>>;

/// Observable state of the token slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Absent,
    CachedValid,
    CachedExpiring,
    Refreshing,
    Failed,
}

#[derive(Deserialize)]
struct ExpiryClaim {
    #[serde(default)]
    exp: Option<f64>,
}

/// Reads the `exp` claim without verifying the signature.
///
/// Returns `None` for tokens that are not JWTs or carry no expiry.
pub fn decode_expiry(token: &str) -> Option<u64> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data =
        jsonwebtoken::decode::<ExpiryClaim>(token, &DecodingKey::from_secret(&[]), &validation)
            .ok()?;
    data.claims
        .exp
        .filter(|exp| exp.is_finite() && *exp >= 0.0)
        .map(|exp| exp as u64)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// True when the token expires within `look_ahead` from now.
pub fn is_expiring(token: &str, look_ahead: Duration) -> bool {
    match decode_expiry(token) {
        Some(exp) => exp <= unix_now().saturating_add(look_ahead.as_secs()),
        None => false,
    }
}

#[derive(Default)]
struct Slot {
    token: Option<String>,
    in_flight: Option<SharedRefresh>,
    failure: Option<(ConnectError, Instant)>,
    /// Bumped by `clear_token` so a refresh started earlier cannot repopulate the slot.
    generation: u64,
}

struct Inner {
    session: Arc<dyn TokenStore>,
    durable: Arc<dyn TokenStore>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    look_ahead: Duration,
    cooldown: Duration,
    slot: Mutex<Slot>,
    /// Held across store writes and clears so a logout cannot interleave with a save.
    stores: tokio::sync::Mutex<()>,
}

enum Decision {
    Ready(Option<String>),
    DropExpired,
    Wait(SharedRefresh),
    Fail(ConnectError),
}

/// Builder for [`TokenManager`].
pub struct TokenManagerBuilder {
    session: Arc<dyn TokenStore>,
    durable: Arc<dyn TokenStore>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    look_ahead: Duration,
    cooldown: Duration,
}

impl Default for TokenManagerBuilder {
    fn default() -> Self {
        Self {
            session: Arc::new(MemoryTokenStore::new()),
            durable: Arc::new(MemoryTokenStore::new()),
            refresher: None,
            look_ahead: DEFAULT_LOOK_AHEAD,
            cooldown: Duration::ZERO,
        }
    }
}

impl TokenManagerBuilder {
    /// Fast-path store, consulted first.
    pub fn session_store(mut self, store: impl TokenStore + 'static) -> Self {
        self.session = Arc::new(store);
        self
    }

    /// Fallback store that survives restarts.
    pub fn durable_store(mut self, store: impl TokenStore + 'static) -> Self {
        self.durable = Arc::new(store);
        self
    }

    /// Enables refreshing. Without a refresher the manager never fetches tokens.
    pub fn refresher(mut self, refresher: impl TokenRefresher + 'static) -> Self {
        self.refresher = Some(Arc::new(refresher));
        self
    }

    pub fn look_ahead(mut self, look_ahead: Duration) -> Self {
        self.look_ahead = look_ahead;
        self
    }

    /// After a failed refresh, return that failure without retrying for this long.
    pub fn refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn build(self) -> TokenManager {
        TokenManager {
            inner: Arc::new(Inner {
                session: self.session,
                durable: self.durable,
                refresher: self.refresher,
                look_ahead: self.look_ahead,
                cooldown: self.cooldown,
                slot: Mutex::new(Slot::default()),
                stores: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

/// Shared handle to the token slot. Clones refer to the same slot.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("state", &self.state())
            .field("refresh", &self.inner.refresher.is_some())
            .finish()
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl TokenManager {
    pub fn builder() -> TokenManagerBuilder {
        TokenManagerBuilder::default()
    }

    /// Builds a manager from configuration, refreshing through `refresh_endpoint` when given.
    ///
    /// `timeout` bounds each refresh request, matching the GraphQL client.
    pub fn from_settings(
        settings: &TokenSettings,
        refresh_endpoint: Option<&str>,
        timeout: Option<Duration>,
    ) -> ConnectResult<Self> {
        let session = match settings.session_max_age_secs {
            Some(secs) => MemoryTokenStore::with_max_age(Duration::from_secs(secs)),
            None => MemoryTokenStore::new(),
        };
        let mut builder = Self::builder()
            .session_store(session)
            .look_ahead(Duration::from_secs(settings.look_ahead_secs))
            .refresh_cooldown(Duration::from_secs(settings.refresh_cooldown_secs));
        if let Some(dir) = &settings.storage_dir {
            builder = builder.durable_store(FileTokenStore::new(dir));
        }
        if let Some(endpoint) = refresh_endpoint {
            let mut http = reqwest::Client::builder();
            if let Some(timeout) = timeout {
                http = http.timeout(timeout);
            }
            builder = builder.refresher(HttpTokenRefresher::with_client(endpoint, http.build()?));
        }
        Ok(builder.build())
    }

    pub fn can_refresh(&self) -> bool {
        self.inner.refresher.is_some()
    }

    /// State of the in-memory slot; stores are not consulted.
    pub fn state(&self) -> TokenState {
        let slot = self.inner.slot.lock();
        if slot.in_flight.is_some() {
            TokenState::Refreshing
        } else if slot.failure.is_some() {
            TokenState::Failed
        } else {
            match &slot.token {
                None => TokenState::Absent,
                Some(token) if is_expiring(token, self.inner.look_ahead) => {
                    TokenState::CachedExpiring
                }
                Some(_) => TokenState::CachedValid,
            }
        }
    }

    /// Returns a token that is valid beyond the look-ahead window.
    ///
    /// Returns `Ok(None)` when there is no token and nothing to refresh
    /// with, which callers treat as an anonymous request. Without a
    /// refresher an expiring token is still returned until it has actually
    /// expired.
    pub async fn get_valid_token(&self) -> ConnectResult<Option<String>> {
        let current = self.cached_token().await;

        let decision = {
            let mut slot = self.inner.slot.lock();
            if let Some(in_flight) = &slot.in_flight {
                Decision::Wait(in_flight.clone())
            } else {
                let current = slot.token.clone().or(current);
                let usable = current
                    .as_deref()
                    .is_some_and(|t| !is_expiring(t, self.inner.look_ahead));
                let expired = current
                    .as_deref()
                    .is_some_and(|t| is_expiring(t, Duration::ZERO));

                if usable {
                    Decision::Ready(current)
                } else if let Some(refresher) = self.inner.refresher.clone() {
                    match &slot.failure {
                        Some((err, at)) if at.elapsed() < self.inner.cooldown => {
                            Decision::Fail(err.clone())
                        }
                        _ => {
                            let task =
                                run_refresh(self.inner.clone(), refresher, current, slot.generation)
                                    .boxed()
                                    .shared();
                            slot.in_flight = Some(task.clone());
                            slot.failure = None;
                            Decision::Wait(task)
                        }
                    }
                } else if expired {
                    slot.token = None;
                    Decision::DropExpired
                } else {
                    Decision::Ready(current)
                }
            }
        };

        match decision {
            Decision::Ready(token) => Ok(token),
            Decision::Fail(err) => Err(err),
            Decision::Wait(task) => task.await.map(Some),
            Decision::DropExpired => {
                debug!("cached token expired and no refresh endpoint is configured");
                self.clear_stores().await;
                Ok(None)
            }
        }
    }

    /// Stores a token obtained elsewhere, e.g. from a login flow.
    pub async fn set_token(&self, token: impl Into<String>) {
        let token = token.into();
        let _stores = self.inner.stores.lock().await;
        persist(&self.inner, &token).await;
        let mut slot = self.inner.slot.lock();
        slot.token = Some(token);
        slot.failure = None;
    }

    /// Forgets the token in memory and in both stores. Never triggers a refresh.
    pub async fn clear_token(&self) {
        {
            let mut slot = self.inner.slot.lock();
            slot.generation = slot.generation.wrapping_add(1);
            slot.token = None;
            slot.in_flight = None;
            slot.failure = None;
        }
        self.clear_stores().await;
    }

    async fn cached_token(&self) -> Option<String> {
        if let Some(token) = self.inner.slot.lock().token.clone() {
            return Some(token);
        }
        for store in [&self.inner.session, &self.inner.durable] {
            match store.load().await {
                Ok(Some(token)) => return Some(token),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "failed to read stored token"),
            }
        }
        None
    }

    async fn clear_stores(&self) {
        let _stores = self.inner.stores.lock().await;
        for store in [&self.inner.session, &self.inner.durable] {
            if let Err(err) = store.clear().await {
                warn!(error = %err, "failed to clear stored token");
            }
        }
    }
}

async fn persist(inner: &Inner, token: &str) {
    for store in [&inner.session, &inner.durable] {
        if let Err(err) = store.save(token).await {
            warn!(error = %err, "failed to persist token");
        }
    }
}

async fn run_refresh(
    inner: Arc<Inner>,
    refresher: Arc<dyn TokenRefresher>,
    current: Option<String>,
    generation: u64,
) -> ConnectResult<String> {
    debug!("refreshing bearer token");
    let result = refresher.refresh(current).await;

    match &result {
        Ok(token) => {
            let token = token.clone();
            // `clear_token` bumps the generation before waiting on the store lock,
            // so a check made while holding the lock cannot be overtaken by a clear.
            let _stores = inner.stores.lock().await;
            if inner.slot.lock().generation != generation {
                return result;
            }
            persist(&inner, &token).await;
            let mut slot = inner.slot.lock();
            if slot.generation == generation {
                slot.token = Some(token);
                slot.in_flight = None;
                slot.failure = None;
            }
        }
        Err(_) if inner.slot.lock().generation != generation => {}
        Err(err) => {
            warn!(error = %err, "token refresh failed");
            let mut slot = inner.slot.lock();
            if slot.generation == generation {
                slot.in_flight = None;
                slot.failure = Some((err.clone(), Instant::now()));
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::json;

    fn jwt_expiring_in(secs: i64) -> String {
        let exp = unix_now() as i64 + secs;
        jsonwebtoken::encode(
            &Header::default(),
            &json!({"sub": "user-1", "exp": exp}),
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap()
    }

    #[test]
    fn test_decode_expiry() {
        let token = jwt_expiring_in(120);
        let exp = decode_expiry(&token).unwrap();
        assert!(exp > unix_now());
        assert_eq!(decode_expiry("not-a-jwt"), None);
    }

    #[test]
    fn test_token_without_exp_never_expires() {
        let token = jsonwebtoken::encode(
            &Header::default(),
            &json!({"sub": "user-1"}),
            &EncodingKey::from_secret(b"k"),
        )
        .unwrap();
        assert_eq!(decode_expiry(&token), None);
        assert!(!is_expiring(&token, Duration::from_secs(3600)));
    }

    #[test]
    fn test_look_ahead_window() {
        assert!(is_expiring(&jwt_expiring_in(30), DEFAULT_LOOK_AHEAD));
        assert!(!is_expiring(&jwt_expiring_in(120), DEFAULT_LOOK_AHEAD));
    }

    #[tokio::test]
    async fn test_public_mode_without_refresher() {
        let manager = TokenManager::default();
        assert_eq!(manager.get_valid_token().await.unwrap(), None);
        assert_eq!(manager.state(), TokenState::Absent);
    }

    #[tokio::test]
    async fn test_set_and_clear() {
        let manager = TokenManager::default();
        let token = jwt_expiring_in(600);
        manager.set_token(token.clone()).await;
        assert_eq!(manager.state(), TokenState::CachedValid);
        assert_eq!(manager.get_valid_token().await.unwrap(), Some(token));

        manager.clear_token().await;
        assert_eq!(manager.state(), TokenState::Absent);
        assert_eq!(manager.get_valid_token().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_token_without_refresher_is_dropped() {
        let manager = TokenManager::default();
        manager.set_token(jwt_expiring_in(-10)).await;
        assert_eq!(manager.get_valid_token().await.unwrap(), None);
        assert_eq!(manager.state(), TokenState::Absent);
    }

    struct CountingRefresher {
        calls: Arc<std::sync::atomic::AtomicUsize>,
        outcome: ConnectResult<String>,
    }

    #[async_trait::async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, _current: Option<String>) -> ConnectResult<String> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.outcome.clone()
        }
    }

    fn counting(outcome: ConnectResult<String>) -> (CountingRefresher, Arc<std::sync::atomic::AtomicUsize>) {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        (
            CountingRefresher {
                calls: calls.clone(),
                outcome,
            },
            calls,
        )
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let fresh = jwt_expiring_in(3600);
        let (refresher, calls) = counting(Ok(fresh.clone()));
        let manager = TokenManager::builder().refresher(refresher).build();
        manager.set_token(jwt_expiring_in(30)).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.get_valid_token().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), Some(fresh.clone()));
        }

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(manager.state(), TokenState::CachedValid);
    }

    #[tokio::test]
    async fn test_valid_token_skips_refresh() {
        let (refresher, calls) = counting(Ok(jwt_expiring_in(3600)));
        let manager = TokenManager::builder().refresher(refresher).build();
        let token = jwt_expiring_in(120);
        manager.set_token(token.clone()).await;

        assert_eq!(manager.get_valid_token().await.unwrap(), Some(token));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_failure_reaches_every_waiter() {
        let (refresher, calls) = counting(Err(ConnectError::token_refresh("refresh rejected")));
        let manager = TokenManager::builder().refresher(refresher).build();

        let (a, b) = tokio::join!(manager.get_valid_token(), manager.get_valid_token());
        assert_eq!(a.unwrap_err().code, crate::error::ErrorCode::TokenRefresh);
        assert_eq!(b.unwrap_err().code, crate::error::ErrorCode::TokenRefresh);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(manager.state(), TokenState::Failed);

        // No cooldown configured: the next call tries again.
        assert!(manager.get_valid_token().await.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cooldown_fails_fast() {
        let (refresher, calls) = counting(Err(ConnectError::token_refresh("down")));
        let manager = TokenManager::builder()
            .refresher(refresher)
            .refresh_cooldown(Duration::from_secs(60))
            .build();

        assert!(manager.get_valid_token().await.is_err());
        assert!(manager.get_valid_token().await.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_persists_to_durable_store() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = jwt_expiring_in(3600);
        let (refresher, _) = counting(Ok(fresh.clone()));
        let manager = TokenManager::builder()
            .durable_store(crate::store::FileTokenStore::new(dir.path()))
            .refresher(refresher)
            .build();

        manager.get_valid_token().await.unwrap();

        let reopened = TokenManager::builder()
            .durable_store(crate::store::FileTokenStore::new(dir.path()))
            .build();
        assert_eq!(reopened.get_valid_token().await.unwrap(), Some(fresh));
    }

    /// Durable store whose writes take a while to land.
    #[derive(Clone, Default)]
    struct SlowStore {
        value: Arc<Mutex<Option<String>>>,
    }

    #[async_trait::async_trait]
    impl TokenStore for SlowStore {
        async fn load(&self) -> ConnectResult<Option<String>> {
            Ok(self.value.lock().clone())
        }

        async fn save(&self, token: &str) -> ConnectResult<()> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            *self.value.lock() = Some(token.to_string());
            Ok(())
        }

        async fn clear(&self) -> ConnectResult<()> {
            *self.value.lock() = None;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_clear_during_refresh_write_leaves_stores_empty() {
        let durable = SlowStore::default();
        let (refresher, calls) = counting(Ok(jwt_expiring_in(3600)));
        let manager = TokenManager::builder()
            .durable_store(durable.clone())
            .refresher(refresher)
            .build();

        let pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.get_valid_token().await }
        });
        // The refresher answers after 50ms; the durable save is still running at 80ms.
        tokio::time::sleep(Duration::from_millis(80)).await;
        manager.clear_token().await;
        pending.await.unwrap().unwrap();

        assert_eq!(durable.load().await.unwrap(), None);
        assert_eq!(manager.state(), TokenState::Absent);
        assert_eq!(manager.cached_token().await, None);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_from_settings_applies_timeout_to_refresh() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"token": "late"}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let manager = TokenManager::from_settings(
            &TokenSettings::default(),
            Some(&server.uri()),
            Some(Duration::from_secs(1)),
        )
        .unwrap();
        let started = Instant::now();
        let err = manager.get_valid_token().await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::Network);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_expiring_token_without_refresher_is_still_used() {
        let manager = TokenManager::default();
        let token = jwt_expiring_in(30);
        manager.set_token(token.clone()).await;
        assert_eq!(manager.state(), TokenState::CachedExpiring);
        assert_eq!(manager.get_valid_token().await.unwrap(), Some(token));
    }
}
