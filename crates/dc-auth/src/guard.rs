//! Startup check of the persistent token cache.
//!
//! Nothing here ever fails: a broken medium turns into [`GuardStatus::Degraded`] and the
//! session runs with a per-process cache only.

use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::{AuthError, StorageError};
use crate::store::TokenStore;

/// Result of verifying the persistent cache
#[derive(Debug, Clone)]
pub enum GuardStatus {
    /// Store is readable and writable
    Ok(Arc<dyn TokenStore>),
    /// Store is unusable; persistence is disabled for this process
    Degraded(String),
}

impl GuardStatus {
    /// The verified store, if any
    pub fn store(&self) -> Option<Arc<dyn TokenStore>> {
        match self {
            Self::Ok(store) => Some(Arc::clone(store)),
            Self::Degraded(_) => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }
}

pub struct CacheGuard;

impl CacheGuard {
    /// Probe the store with a read followed by a write of the same contents
    pub async fn verify(store: Arc<dyn TokenStore>) -> GuardStatus {
        let probe = async {
            let current = store.load().await?;
            store.save(&current).await?;
            Ok::<usize, StorageError>(current.len())
        };

        match probe.await {
            Ok(entries) => {
                info!("Token cache persistence verified ({} cached entries)", entries);
                GuardStatus::Ok(store)
            }
            Err(e) => Self::degrade(e),
        }
    }

    /// Construct the store and verify it, degrading if either step fails
    pub async fn open<S, F>(construct: F) -> GuardStatus
    where
        S: TokenStore + 'static,
        F: Future<Output = Result<S, StorageError>>,
    {
        match construct.await {
            Ok(store) => Self::verify(Arc::new(store)).await,
            Err(e) => Self::degrade(e),
        }
    }

    fn degrade(e: StorageError) -> GuardStatus {
        let e = AuthError::StorageUnavailable(e);
        warn!(
            "Error while verifying token cache persistence, continuing with an in-memory cache: {}",
            e
        );
        GuardStatus::Degraded(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTokenStore;
    use crate::token::{TokenCacheData, tests::entry};

    #[derive(Debug)]
    struct ReadOnlyStore;

    #[async_trait::async_trait]
    impl TokenStore for ReadOnlyStore {
        async fn load(&self) -> Result<TokenCacheData, StorageError> {
            Ok(TokenCacheData::new())
        }

        async fn save(&self, _data: &TokenCacheData) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only medium",
            )))
        }
    }

    #[tokio::test]
    async fn test_healthy_store_verified_without_changes() {
        let mut data = TokenCacheData::new();
        data.upsert(entry("a", "s", 3600, Some("rt")));
        let store = MemoryTokenStore::with_data(data.clone());

        let status = CacheGuard::verify(Arc::new(store.clone())).await;

        assert!(!status.is_degraded());
        assert!(status.store().is_some());
        assert_eq!(store.snapshot(), data);
    }

    #[tokio::test]
    async fn test_unwritable_store_degrades() {
        let status = CacheGuard::verify(Arc::new(ReadOnlyStore)).await;

        assert!(status.is_degraded());
        assert!(status.store().is_none());
    }

    #[tokio::test]
    async fn test_failed_construction_degrades() {
        let status =
            CacheGuard::open(async { Err::<MemoryTokenStore, _>(StorageError::NoStorageDir) })
                .await;

        match status {
            GuardStatus::Degraded(reason) => {
                assert!(reason.starts_with("Token cache storage unavailable"));
                assert!(reason.contains("storage directory"));
            }
            GuardStatus::Ok(_) => panic!("Expected Degraded"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unwritable_directory_degrades() {
        use crate::file_store::FileTokenStore;
        use crate::key_manager::KeySource;
        use crate::secret::StaticSecretProvider;
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::TempDir::new().unwrap();
        let dir = temp.path().join("cache");
        let secret = Arc::new(StaticSecretProvider::new("pw"));
        let store =
            FileTokenStore::open_with_key_source(&dir, "token.cache", KeySource::PassphraseOnly, secret)
                .await
                .unwrap();

        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o500)).unwrap();
        // Root ignores directory permissions; only assert when the write really fails.
        let writable = std::fs::write(dir.join("probe"), b"x").is_ok();

        let status = CacheGuard::verify(Arc::new(store)).await;
        assert_eq!(status.is_degraded(), !writable);

        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).unwrap();
    }
}
