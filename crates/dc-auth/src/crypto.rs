use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use zeroize::ZeroizeOnDrop;

use crate::errors::StorageError;

const NONCE_LEN: usize = 12;
const AAD_VERSION: &str = "v1";

/// AES-256 key (32 bytes)
#[derive(Clone, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; 32],
}

impl EncryptionKey {
    /// Generate a new random encryption key
    pub fn generate() -> Result<Self, StorageError> {
        let mut key = [0u8; 32];
        fill_random(&mut key)?;
        Ok(Self { key })
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { key: bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// Encrypted token cache with nonce and authentication tag
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EncryptedBlob {
    /// Base64url-encoded nonce (12 bytes)
    pub nonce: String,
    /// Base64url-encoded ciphertext + tag
    pub ciphertext: String,
    pub aad_version: String,
}

pub(crate) fn fill_random(buf: &mut [u8]) -> Result<(), StorageError> {
    getrandom::fill(buf).map_err(|e| StorageError::Crypto(format!("OS RNG failure: {e}")))
}

fn aad(version: &str, cache_name: &str) -> String {
    format!("dc-auth|{version}|{cache_name}")
}

/// Encrypt plaintext using AES-256-GCM, binding it to the cache name
pub fn encrypt(
    key: &EncryptionKey,
    plaintext: &[u8],
    cache_name: &str,
) -> Result<EncryptedBlob, StorageError> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_LEN];
    fill_random(&mut nonce_bytes)?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let aad = aad(AAD_VERSION, cache_name);
    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|e| StorageError::Crypto(format!("Encryption failed: {e}")))?;

    Ok(EncryptedBlob {
        nonce: URL_SAFE_NO_PAD.encode(nonce_bytes),
        ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
        aad_version: AAD_VERSION.to_string(),
    })
}

/// Decrypt a blob produced by [`encrypt`] for the same cache name
pub fn decrypt(
    key: &EncryptionKey,
    blob: &EncryptedBlob,
    cache_name: &str,
) -> Result<Vec<u8>, StorageError> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let nonce_bytes = URL_SAFE_NO_PAD
        .decode(&blob.nonce)
        .map_err(|_| StorageError::CorruptedStore)?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(StorageError::CorruptedStore);
    }
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = URL_SAFE_NO_PAD
        .decode(&blob.ciphertext)
        .map_err(|_| StorageError::CorruptedStore)?;

    let aad = aad(&blob.aad_version, cache_name);
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &ciphertext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|_| StorageError::CorruptedStore)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = EncryptionKey::generate().unwrap();
        let plaintext = br#"{"version":1,"entries":{}}"#;

        let encrypted = encrypt(&key, plaintext, "token.cache").unwrap();
        let decrypted = decrypt(&key, &encrypted, "token.cache").unwrap();

        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = EncryptionKey::generate().unwrap();
        let key2 = EncryptionKey::generate().unwrap();

        let encrypted = encrypt(&key1, b"cache", "token.cache").unwrap();
        let result = decrypt(&key2, &encrypted, "token.cache");

        assert!(matches!(result, Err(StorageError::CorruptedStore)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = EncryptionKey::generate().unwrap();
        let mut encrypted = encrypt(&key, b"cache", "token.cache").unwrap();

        let mut ct_bytes = URL_SAFE_NO_PAD.decode(&encrypted.ciphertext).unwrap();
        ct_bytes[0] ^= 0xFF;
        encrypted.ciphertext = URL_SAFE_NO_PAD.encode(ct_bytes);

        let result = decrypt(&key, &encrypted, "token.cache");
        assert!(matches!(result, Err(StorageError::CorruptedStore)));
    }

    #[test]
    fn test_blob_bound_to_cache_name() {
        let key = EncryptionKey::generate().unwrap();
        let encrypted = encrypt(&key, b"cache", "work.cache").unwrap();

        let result = decrypt(&key, &encrypted, "personal.cache");
        assert!(matches!(result, Err(StorageError::CorruptedStore)));
    }
}
