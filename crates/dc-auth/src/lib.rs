//! Device-code authentication against the Microsoft identity platform
//!
//! This crate acquires OAuth 2.0 access tokens for a configured set of scopes, preferring
//! cached and refreshed tokens and falling back to the device authorization grant only
//! when the provider says interaction is required.
//!
//! # Acquisition Flow
//!
//! 1. List cached accounts and pick one according to [`AccountSelection`]
//! 2. Try a silent acquisition (valid cached token, or refresh-token redemption)
//! 3. On interaction required, request a device code and present the challenge once
//! 4. Poll the token endpoint until the user finishes, the code expires or the caller cancels
//!
//! # Example
//!
//! ```no_run
//! use dc_auth::{
//!     CacheGuard, DeviceCodeChallenge, EnvSecretProvider, FileTokenStore, IdentitySession,
//!     SessionConfig, TokenAcquirer,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> dc_auth::Result<()> {
//! let config = SessionConfig::new(
//!     "00000000-0000-0000-0000-000000000000",
//!     "organizations",
//!     vec!["api://weather/Access.Read".to_string()],
//! );
//!
//! // Falls back to an in-memory cache when the file store cannot be used
//! let storage_dir = FileTokenStore::default_storage_dir()?;
//! let cache = CacheGuard::open(FileTokenStore::open(
//!     storage_dir,
//!     &config.cache_file_name,
//!     Arc::new(EnvSecretProvider::default()),
//! ))
//! .await;
//!
//! let session = Arc::new(IdentitySession::create(config, cache).await?);
//! let acquirer = TokenAcquirer::for_session(
//!     session,
//!     Arc::new(|challenge: &DeviceCodeChallenge| println!("{}", challenge.message)),
//! );
//!
//! let token = acquirer.acquire_access_token().await?;
//! println!("Bearer {}", token.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Token Storage
//!
//! The persistent cache is a single AES-256-GCM encrypted file. The key lives in the OS
//! keyring when available, otherwise it is derived from a passphrase with Argon2id.
//! Tokens are never logged.

pub mod acquire;
pub mod client;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod file_store;
pub mod guard;
pub mod key_manager;
pub mod models;
pub mod provider;
pub mod secret;
pub mod session;
pub mod store;
pub mod token;

// Re-export main types
pub use acquire::{FlightGuards, TokenAcquirer};
pub use client::MsIdentityClient;
pub use config::{AccountSelection, HttpTimeouts, PollingPolicy, SessionConfig};
pub use errors::{AuthError, ProviderError, Result, StorageError};
pub use file_store::FileTokenStore;
pub use guard::{CacheGuard, GuardStatus};
pub use key_manager::KeySource;
pub use provider::{ChallengeHandler, DeviceCodeChallenge, IdentityProvider, Outcome};
pub use secret::{EnvSecretProvider, NoSecretProvider, SecretProvider, StaticSecretProvider};
pub use session::IdentitySession;
pub use store::{MemoryTokenStore, TokenStore};
pub use token::{CacheEntry, CachedAccount, TokenCacheData, TokenResult, TokenSource};
