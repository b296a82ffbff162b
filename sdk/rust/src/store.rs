//! Token persistence.
//!
//! The token manager keeps two copies: a short-lived in-memory one for the
//! fast path and a durable file for restarts. Both are addressed by
//! [`TOKEN_KEY`].

use crate::error::{ConnectResult, ErrorCode, ResultExt};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Well-known name under which tokens are stored.
pub const TOKEN_KEY: &str = "gqlconnect_auth_token";

/// A place a bearer token can be kept.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self) -> ConnectResult<Option<String>>;

    async fn save(&self, token: &str) -> ConnectResult<()>;

    async fn clear(&self) -> ConnectResult<()>;
}

/// In-process store; entries older than `max_age` read as absent.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    slot: Mutex<Option<(String, Instant)>>,
    max_age: Option<Duration>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            max_age: Some(max_age),
        }
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self) -> ConnectResult<Option<String>> {
        let mut slot = self.slot.lock();
        let expired = match (&*slot, self.max_age) {
            (Some((_, saved_at)), Some(max_age)) => saved_at.elapsed() > max_age,
            _ => false,
        };
        if expired {
            *slot = None;
        }
        Ok(slot.as_ref().map(|(token, _)| token.clone()))
    }

    async fn save(&self, token: &str) -> ConnectResult<()> {
        *self.slot.lock() = Some((token.to_string(), Instant::now()));
        Ok(())
    }

    async fn clear(&self) -> ConnectResult<()> {
        *self.slot.lock() = None;
        Ok(())
    }
}

/// Durable store: one file named [`TOKEN_KEY`] inside a directory.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(TOKEN_KEY),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> ConnectResult<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let token = contents.trim();
                Ok((!token.is_empty()).then(|| token.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).map_connect_err(ErrorCode::Unexpected),
        }
    }

    async fn save(&self, token: &str) -> ConnectResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_connect_err(ErrorCode::Unexpected)?;
        }
        tokio::fs::write(&self.path, token)
            .await
            .map_connect_err(ErrorCode::Unexpected)
    }

    async fn clear(&self) -> ConnectResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).map_connect_err(ErrorCode::Unexpected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryTokenStore::new();
        assert_eq!(store.load().await.unwrap(), None);
        store.save("abc").await.unwrap();
        assert_eq!(store.load().await.unwrap().as_deref(), Some("abc"));
        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store_max_age() {
        let store = MemoryTokenStore::with_max_age(Duration::from_millis(10));
        store.save("short").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("nested"));
        assert_eq!(store.load().await.unwrap(), None);

        store.save("durable").await.unwrap();
        assert!(store.path().ends_with(TOKEN_KEY));
        let reopened = FileTokenStore::new(dir.path().join("nested"));
        assert_eq!(reopened.load().await.unwrap().as_deref(), Some("durable"));

        reopened.clear().await.unwrap();
        reopened.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }
}
