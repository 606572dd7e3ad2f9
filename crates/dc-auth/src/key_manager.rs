use std::path::{Path, PathBuf};
use std::sync::Arc;

use argon2::{Argon2, Params};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::crypto::{self, EncryptionKey};
use crate::errors::StorageError;
use crate::secret::SecretProvider;

const SALT_LEN: usize = 32;

#[cfg(feature = "keyring-support")]
const KEYRING_SERVICE: &str = "devicecode-console";

/// Key derivation metadata stored next to the cache file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMeta {
    pub version: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Base64-encoded salt for Argon2id (if using passphrase)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase_salt: Option<String>,
}

impl Default for KeyMeta {
    fn default() -> Self {
        Self {
            version: 1,
            created_at: chrono::Utc::now(),
            passphrase_salt: None,
        }
    }
}

/// Where the cache key may come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// OS keyring first, passphrase when the keyring is unusable
    KeyringOrPassphrase,
    /// Passphrase only; the keyring is never touched
    PassphraseOnly,
}

/// Resolves the token cache encryption key from the OS keyring or a passphrase
pub struct KeyManager {
    meta: KeyMeta,
    key: EncryptionKey,
}

impl KeyManager {
    /// Load or create the key for `cache_name`, persisting metadata at `meta_path`
    ///
    /// With keyring support the key lives in the OS keyring and is created on first use.
    /// When the keyring is unusable the key is derived from the secret provider's passphrase.
    pub async fn open(
        meta_path: &Path,
        cache_name: &str,
        source: KeySource,
        secret_provider: Arc<dyn SecretProvider>,
    ) -> Result<Self, StorageError> {
        let mut meta = Self::load_meta(meta_path).await?;
        let key = match source {
            KeySource::KeyringOrPassphrase => {
                Self::resolve_key(&mut meta, cache_name, &secret_provider).await?
            }
            KeySource::PassphraseOnly => {
                Self::derive_from_passphrase(&mut meta, &secret_provider).await?
            }
        };
        Self::store_meta(meta_path, &meta).await?;

        Ok(Self { meta, key })
    }

    pub fn key(&self) -> &EncryptionKey {
        &self.key
    }

    async fn load_meta(meta_path: &Path) -> Result<KeyMeta, StorageError> {
        match fs::read_to_string(meta_path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|_| StorageError::CorruptedStore),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(KeyMeta::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store_meta(meta_path: &Path, meta: &KeyMeta) -> Result<(), StorageError> {
        let meta_json = serde_json::to_string_pretty(meta)?;
        fs::write(meta_path, meta_json).await?;
        Ok(())
    }

    #[cfg(feature = "keyring-support")]
    async fn resolve_key(
        meta: &mut KeyMeta,
        cache_name: &str,
        secret_provider: &Arc<dyn SecretProvider>,
    ) -> Result<EncryptionKey, StorageError> {
        let user = keyring_user(cache_name);

        match Self::load_from_keyring(user.clone()).await {
            Ok(key) => {
                tracing::debug!("Loaded token cache key from OS keyring");
                return Ok(key);
            }
            Err(e) => tracing::debug!("No usable keyring key ({}), trying passphrase", e),
        }

        if meta.passphrase_salt.is_none() {
            // Fresh cache: prefer a random keyring-held key over a passphrase.
            let key = EncryptionKey::generate()?;
            if Self::save_to_keyring(user.clone(), key.clone()).await.is_ok()
                && Self::load_from_keyring(user).await.is_ok()
            {
                tracing::debug!("Stored new token cache key in OS keyring");
                return Ok(key);
            }
        }

        Self::derive_from_passphrase(meta, secret_provider).await
    }

    #[cfg(not(feature = "keyring-support"))]
    async fn resolve_key(
        meta: &mut KeyMeta,
        _cache_name: &str,
        secret_provider: &Arc<dyn SecretProvider>,
    ) -> Result<EncryptionKey, StorageError> {
        Self::derive_from_passphrase(meta, secret_provider).await
    }

    #[cfg(feature = "keyring-support")]
    async fn load_from_keyring(user: String) -> Result<EncryptionKey, StorageError> {
        let key_b64 = blocking_keyring(move || {
            keyring::Entry::new(KEYRING_SERVICE, &user)
                .and_then(|entry| entry.get_password())
                .map_err(|e| StorageError::Keyring(format!("Failed to read from keyring: {e}")))
        })
        .await?;

        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_b64)
            .map_err(|_| StorageError::CorruptedStore)?;

        let key: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| StorageError::CorruptedStore)?;

        Ok(EncryptionKey::from_bytes(key))
    }

    #[cfg(feature = "keyring-support")]
    async fn save_to_keyring(user: String, key: EncryptionKey) -> Result<(), StorageError> {
        let key_b64 = zeroize::Zeroizing::new(
            base64::engine::general_purpose::STANDARD.encode(key.as_bytes()),
        );

        blocking_keyring(move || {
            keyring::Entry::new(KEYRING_SERVICE, &user)
                .and_then(|entry| entry.set_password(&key_b64))
                .map_err(|e| StorageError::Keyring(format!("Failed to write to keyring: {e}")))
        })
        .await
    }

    /// Derive key from passphrase using Argon2id (m=64MiB, t=3, p=1)
    async fn derive_from_passphrase(
        meta: &mut KeyMeta,
        secret_provider: &Arc<dyn SecretProvider>,
    ) -> Result<EncryptionKey, StorageError> {
        let salt = match meta.passphrase_salt {
            Some(ref salt_b64) => base64::engine::general_purpose::STANDARD
                .decode(salt_b64)
                .map_err(|_| StorageError::CorruptedStore)?,
            None => {
                let mut salt = vec![0u8; SALT_LEN];
                crypto::fill_random(&mut salt)?;
                meta.passphrase_salt =
                    Some(base64::engine::general_purpose::STANDARD.encode(&salt));
                salt
            }
        };

        let passphrase = secret_provider
            .get_passphrase("Enter passphrase for the token cache")
            .await
            .ok_or(StorageError::PassphraseUnavailable)?;

        let params = Params::new(65536, 3, 1, Some(32))
            .map_err(|e| StorageError::Crypto(format!("Invalid Argon2 params: {e}")))?;
        let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

        let mut key = [0u8; 32];
        argon2
            .hash_password_into(passphrase.as_bytes(), &salt, &mut key)
            .map_err(|e| StorageError::Crypto(format!("Key derivation failed: {e}")))?;

        Ok(EncryptionKey::from_bytes(key))
    }
}

/// Keyring account holding the key of the cache named `cache_name`
#[cfg(feature = "keyring-support")]
pub fn keyring_user(cache_name: &str) -> String {
    format!("dc-auth:v1:{cache_name}")
}

/// Platform keyring backends block on IPC, so they run on the blocking pool
#[cfg(feature = "keyring-support")]
async fn blocking_keyring<T, F>(f: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Keyring(format!("Keyring task failed: {e}")))?
}

/// Metadata path for a cache file: `<cache file>.meta.json`
pub fn meta_path_for(cache_path: &Path) -> PathBuf {
    let mut name = cache_path.as_os_str().to_owned();
    name.push(".meta.json");
    PathBuf::from(name)
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("meta", &self.meta)
            .field("key", &"[REDACTED]")
            .finish()
    }
}
