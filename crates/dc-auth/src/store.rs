use std::sync::{Arc, RwLock};

use crate::errors::StorageError;
use crate::token::TokenCacheData;

/// Durable medium for the whole token cache
///
/// `save` replaces the stored cache wholesale; implementations must never leave a
/// partially written cache behind.
#[async_trait::async_trait]
pub trait TokenStore: Send + Sync + std::fmt::Debug {
    /// Load the stored cache, empty when nothing has been stored yet
    async fn load(&self) -> Result<TokenCacheData, StorageError>;

    /// Overwrite the stored cache
    async fn save(&self, data: &TokenCacheData) -> Result<(), StorageError>;
}

/// In-memory token store for testing and non-persistent sessions
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenStore {
    data: Arc<RwLock<TokenCacheData>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with the given cache
    pub fn with_data(data: TokenCacheData) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Snapshot of what has been saved so far
    pub fn snapshot(&self) -> TokenCacheData {
        self.data
            .read()
            .map(|d| d.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self) -> Result<TokenCacheData, StorageError> {
        self.data
            .read()
            .map(|d| d.clone())
            .map_err(|_| StorageError::CorruptedStore)
    }

    async fn save(&self, data: &TokenCacheData) -> Result<(), StorageError> {
        *self
            .data
            .write()
            .map_err(|_| StorageError::CorruptedStore)? = data.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::tests::entry;

    #[tokio::test]
    async fn test_save_overwrites() {
        let store = MemoryTokenStore::new();
        assert!(store.load().await.unwrap().is_empty());

        let mut data = TokenCacheData::new();
        data.upsert(entry("a", "s", 3600, None));
        data.upsert(entry("b", "s", 3600, None));
        store.save(&data).await.unwrap();
        assert_eq!(store.load().await.unwrap().len(), 2);

        let mut smaller = TokenCacheData::new();
        smaller.upsert(entry("c", "s", 3600, None));
        store.save(&smaller).await.unwrap();
        assert_eq!(store.snapshot(), smaller);
    }
}
