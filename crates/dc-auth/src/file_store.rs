use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use tokio::fs;
use tracing::{debug, instrument};

use crate::crypto::{self, EncryptedBlob};
use crate::errors::StorageError;
use crate::key_manager::{self, KeyManager, KeySource};
use crate::secret::SecretProvider;
use crate::store::TokenStore;
use crate::token::TokenCacheData;

const LOCK_ATTEMPTS: u32 = 20;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// File-based encrypted token cache
///
/// The whole cache lives in one encrypted file, rewritten atomically on every save.
///
/// # Directory Structure
/// ```text
/// ~/.local/share/devicecode-console/
/// ├── token.cache              # Encrypted token cache
/// ├── token.cache.meta.json    # Key derivation metadata
/// └── token.cache.lock         # Advisory lock file
/// ```
#[derive(Debug)]
pub struct FileTokenStore {
    cache_path: PathBuf,
    lock_path: PathBuf,
    cache_name: String,
    key_manager: KeyManager,
}

impl FileTokenStore {
    /// Open (creating if needed) the cache file `cache_name` inside `storage_dir`
    ///
    /// The key comes from the OS keyring, or from the secret provider's passphrase when
    /// the keyring is unusable.
    pub async fn open(
        storage_dir: impl AsRef<Path>,
        cache_name: &str,
        secret_provider: Arc<dyn SecretProvider>,
    ) -> Result<Self, StorageError> {
        Self::open_with_key_source(
            storage_dir,
            cache_name,
            KeySource::KeyringOrPassphrase,
            secret_provider,
        )
        .await
    }

    pub async fn open_with_key_source(
        storage_dir: impl AsRef<Path>,
        cache_name: &str,
        key_source: KeySource,
        secret_provider: Arc<dyn SecretProvider>,
    ) -> Result<Self, StorageError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        let cache_path = storage_dir.join(cache_name);
        let lock_path = storage_dir.join(format!("{cache_name}.lock"));

        fs::create_dir_all(&storage_dir).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&storage_dir, std::fs::Permissions::from_mode(0o700)).await?;
        }

        let key_manager = KeyManager::open(
            &key_manager::meta_path_for(&cache_path),
            cache_name,
            key_source,
            secret_provider,
        )
        .await?;

        debug!("Opened token cache at {}", cache_path.display());

        Ok(Self {
            cache_path,
            lock_path,
            cache_name: cache_name.to_string(),
            key_manager,
        })
    }

    /// Per-user directory holding token caches
    pub fn default_storage_dir() -> Result<PathBuf, StorageError> {
        let project_dirs = directories::ProjectDirs::from("", "", "devicecode-console")
            .ok_or(StorageError::NoStorageDir)?;

        Ok(project_dirs.data_local_dir().to_path_buf())
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Take the exclusive advisory lock, retrying briefly while another writer holds it
    async fn acquire_lock(&self) -> Result<std::fs::File, StorageError> {
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;

        for _ in 0..LOCK_ATTEMPTS {
            if lock_file.try_lock_exclusive().is_ok() {
                return Ok(lock_file);
            }
            tokio::time::sleep(LOCK_RETRY_DELAY).await;
        }

        Err(StorageError::LockTimeout)
    }
}

#[async_trait::async_trait]
impl TokenStore for FileTokenStore {
    #[instrument(skip(self), fields(path = %self.cache_path.display()))]
    async fn load(&self) -> Result<TokenCacheData, StorageError> {
        let content = match fs::read_to_string(&self.cache_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Token cache file does not exist yet");
                return Ok(TokenCacheData::new());
            }
            Err(e) => return Err(e.into()),
        };

        let encrypted: EncryptedBlob =
            serde_json::from_str(&content).map_err(|_| StorageError::CorruptedStore)?;
        let plaintext = zeroize::Zeroizing::new(crypto::decrypt(
            self.key_manager.key(),
            &encrypted,
            &self.cache_name,
        )?);

        let data: TokenCacheData =
            serde_json::from_slice(&plaintext).map_err(|_| StorageError::CorruptedStore)?;
        debug!("Loaded {} token cache entries", data.len());

        Ok(data)
    }

    #[instrument(skip(self, data), fields(path = %self.cache_path.display(), entries = data.len()))]
    async fn save(&self, data: &TokenCacheData) -> Result<(), StorageError> {
        let _lock = self.acquire_lock().await?;

        let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(data)?);
        let encrypted = crypto::encrypt(self.key_manager.key(), &plaintext, &self.cache_name)?;
        let encrypted_json = serde_json::to_string_pretty(&encrypted)?;

        // Atomic write: temp file, sync, rename
        let temp_path = self.cache_path.with_extension("tmp");
        fs::write(&temp_path, encrypted_json).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        fs::File::open(&temp_path).await?.sync_all().await?;
        fs::rename(&temp_path, &self.cache_path).await?;

        debug!("Token cache persisted");
        Ok(())
    }
}
