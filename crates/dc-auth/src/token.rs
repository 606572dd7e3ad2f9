use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TOKEN_EXPIRY_SKEW;

/// Previously authenticated principal, as recorded in the token cache
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct CachedAccount {
    /// `<object id>.<home tenant id>`
    pub home_account_id: String,
    pub tenant_id: String,
    /// Authority host that issued the account's tokens
    pub environment: String,
}

/// Where a successful token came from; only used for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Cache,
    Refresh,
    DeviceCode,
}

impl std::fmt::Display for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Cache => "cache",
            Self::Refresh => "refresh",
            Self::DeviceCode => "device code",
        };
        f.write_str(name)
    }
}

/// Access token handed back by a successful acquisition
#[derive(Clone, PartialEq, Eq)]
pub struct TokenResult {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub account: CachedAccount,
    pub source: TokenSource,
}

impl std::fmt::Debug for TokenResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResult")
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("account", &self.account)
            .field("source", &self.source)
            .finish()
    }
}

/// Token material cached for one (account, scope set) pair
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub account: CachedAccount,
    /// Normalized scope set, see [`crate::config::scope_key`]
    pub scope_key: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn key(&self) -> String {
        entry_key(&self.account.home_account_id, &self.scope_key)
    }

    /// Expired, or expiring within [`TOKEN_EXPIRY_SKEW`]
    pub fn is_expired(&self) -> bool {
        let skew = chrono::Duration::from_std(TOKEN_EXPIRY_SKEW)
            .unwrap_or(chrono::Duration::seconds(300));
        Utc::now() + skew >= self.expires_at
    }

    pub fn to_result(&self, source: TokenSource) -> TokenResult {
        TokenResult {
            access_token: self.access_token.clone(),
            expires_at: self.expires_at,
            account: self.account.clone(),
            source,
        }
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("account", &self.account)
            .field("scope_key", &self.scope_key)
            .field("refresh_token_set", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

pub fn entry_key(home_account_id: &str, scope_key: &str) -> String {
    format!("{home_account_id}|{scope_key}")
}

/// Whole token cache as persisted by a [`crate::TokenStore`]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenCacheData {
    #[serde(default = "cache_format_version")]
    pub version: u32,
    #[serde(default)]
    pub entries: BTreeMap<String, CacheEntry>,
}

fn cache_format_version() -> u32 {
    1
}

impl TokenCacheData {
    pub fn new() -> Self {
        Self {
            version: cache_format_version(),
            entries: BTreeMap::new(),
        }
    }

    /// Distinct accounts, ascending by home account id
    pub fn accounts(&self) -> Vec<CachedAccount> {
        let mut accounts: Vec<CachedAccount> =
            self.entries.values().map(|e| e.account.clone()).collect();
        accounts.sort();
        accounts.dedup_by(|a, b| a.home_account_id == b.home_account_id);
        accounts
    }

    pub fn get(&self, home_account_id: &str, scope_key: &str) -> Option<&CacheEntry> {
        self.entries.get(&entry_key(home_account_id, scope_key))
    }

    /// Any refresh token held for the account, preferring the given scope set
    pub fn refresh_token_for(&self, home_account_id: &str, scope_key: &str) -> Option<String> {
        if let Some(rt) = self
            .get(home_account_id, scope_key)
            .and_then(|e| e.refresh_token.clone())
        {
            return Some(rt);
        }

        self.entries
            .values()
            .filter(|e| e.account.home_account_id == home_account_id)
            .find_map(|e| e.refresh_token.clone())
    }

    /// Insert or supersede the entry for the entry's (account, scope set)
    pub fn upsert(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
