use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::acquire::FlightGuards;
use crate::client::{MsIdentityClient, decode_client_info};
use crate::config::{MAX_TOKEN_LIFETIME, SessionConfig, scope_key};
use crate::errors::{AuthError, ProviderError, Result};
use crate::guard::GuardStatus;
use crate::models::TokenResponse;
use crate::provider::{ChallengeHandler, DeviceCodeChallenge, IdentityProvider, Outcome};
use crate::store::TokenStore;
use crate::token::{CacheEntry, CachedAccount, TokenCacheData, TokenResult, TokenSource};

/// Long-lived identity client bound to the token cache
///
/// Construct once per process and share it behind an `Arc`. Every token obtained through
/// the session is written to the in-memory cache and, unless the cache guard degraded,
/// through to the persistent store.
#[derive(Debug)]
pub struct IdentitySession {
    config: SessionConfig,
    client: MsIdentityClient,
    cache: RwLock<TokenCacheData>,
    persistent: Option<Arc<dyn TokenStore>>,
    /// Serializes cache mutation + persistence so saves land in order
    write_lock: Mutex<()>,
    flights: Arc<FlightGuards>,
}

impl IdentitySession {
    /// Validate the configuration and bind the (guarded) token cache
    ///
    /// Fails only with `ConfigInvalid`; storage problems degrade to an in-memory cache.
    pub async fn create(config: SessionConfig, cache: GuardStatus) -> Result<Self> {
        config.validate()?;
        let client = MsIdentityClient::new(config.clone())?;

        let (data, persistent) = match cache.store() {
            Some(store) => match store.load().await {
                Ok(data) => (data, Some(store)),
                Err(e) => {
                    let e = AuthError::StorageUnavailable(e);
                    warn!("Failed to load token cache, continuing without persistence: {}", e);
                    (TokenCacheData::new(), None)
                }
            },
            None => (TokenCacheData::new(), None),
        };

        info!(
            "Identity session ready for tenant '{}' ({} cached entries, persistence {})",
            config.tenant_id,
            data.len(),
            if persistent.is_some() { "enabled" } else { "disabled" }
        );

        Ok(Self {
            config,
            client,
            cache: RwLock::new(data),
            persistent,
            write_lock: Mutex::new(()),
            flights: Arc::new(FlightGuards::default()),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent.is_some()
    }

    /// Per-scope-set guards shared by every acquirer of this session
    pub fn flights(&self) -> Arc<FlightGuards> {
        Arc::clone(&self.flights)
    }

    /// Snapshot of the in-memory cache
    pub async fn cache_snapshot(&self) -> TokenCacheData {
        self.cache.read().await.clone()
    }

    /// Turn a token response into a cache entry, store it, and return the result
    async fn record(
        &self,
        response: TokenResponse,
        scopes: &[String],
        source: TokenSource,
        known: Option<(&CachedAccount, String)>,
    ) -> std::result::Result<TokenResult, ProviderError> {
        if response.access_token.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "Token response carried an empty access token".to_string(),
            ));
        }

        let account = match (&response.client_info, &known) {
            (Some(raw), _) => {
                let info = decode_client_info(raw)?;
                CachedAccount {
                    home_account_id: info.home_account_id(),
                    tenant_id: info.utid,
                    environment: self.client.environment(),
                }
            }
            (None, Some((account, _))) => (*account).clone(),
            (None, None) => {
                return Err(ProviderError::InvalidResponse(
                    "Token response is missing client_info".to_string(),
                ));
            }
        };

        let now = Utc::now();
        let entry = CacheEntry {
            account,
            scope_key: scope_key(scopes),
            access_token: response.access_token,
            refresh_token: response
                .refresh_token
                .or_else(|| known.map(|(_, rt)| rt)),
            expires_at: now + token_lifetime(response.expires_in),
            cached_at: now,
        };
        let result = entry.to_result(source);

        let _write = self.write_lock.lock().await;
        let snapshot = {
            let mut data = self.cache.write().await;
            data.upsert(entry);
            data.clone()
        };

        if let Some(store) = &self.persistent {
            match store.save(&snapshot).await {
                Ok(()) => debug!("Token cache written through to persistent store"),
                Err(e) => warn!(
                    "Failed to persist token cache, keeping it in memory: {}",
                    AuthError::StorageUnavailable(e)
                ),
            }
        }

        Ok(result)
    }
}

/// Provider-reported lifetime, capped so an absurd value can neither overflow nor wrap
fn token_lifetime(expires_in: u64) -> chrono::Duration {
    let secs = expires_in.min(MAX_TOKEN_LIFETIME.as_secs());
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

#[async_trait::async_trait]
impl IdentityProvider for IdentitySession {
    async fn list_accounts(&self) -> Vec<CachedAccount> {
        self.cache.read().await.accounts()
    }

    #[instrument(skip(self, account))]
    async fn acquire_token_silent(
        &self,
        account: Option<&CachedAccount>,
        scopes: &[String],
    ) -> Outcome {
        let Some(account) = account else {
            return Outcome::InteractionRequired(
                "no_account: no account hint and no default account context".to_string(),
            );
        };

        let key = scope_key(scopes);
        let (cached, refresh_token) = {
            let data = self.cache.read().await;
            (
                data.get(&account.home_account_id, &key).cloned(),
                data.refresh_token_for(&account.home_account_id, &key),
            )
        };

        if let Some(entry) = cached.filter(|e| !e.is_expired()) {
            debug!("Cached access token is still valid");
            return Outcome::Success(entry.to_result(TokenSource::Cache));
        }

        let Some(refresh_token) = refresh_token else {
            return Outcome::InteractionRequired(
                "no_tokens_found: no refresh token cached for the account".to_string(),
            );
        };

        debug!("Cached access token expired, redeeming refresh token");
        match self.client.redeem_refresh_token(&refresh_token, scopes).await {
            Ok(response) => {
                match self
                    .record(response, scopes, TokenSource::Refresh, Some((account, refresh_token)))
                    .await
                {
                    Ok(result) => Outcome::Success(result),
                    Err(e) => Outcome::Failure(e),
                }
            }
            Err(e) if e.requires_interaction() => Outcome::InteractionRequired(e.to_string()),
            Err(e) => Outcome::Failure(e),
        }
    }

    #[instrument(skip(self, on_challenge, cancel))]
    async fn acquire_token_by_device_code(
        &self,
        scopes: &[String],
        on_challenge: &dyn ChallengeHandler,
        cancel: &CancellationToken,
    ) -> Outcome {
        let device_code = match self.client.request_device_code(scopes).await {
            Ok(code) => code,
            Err(e) => return Outcome::Failure(e),
        };

        let message = device_code.message.clone().unwrap_or_else(|| {
            format!(
                "To sign in, use a web browser to open the page {} and enter the code {} to authenticate.",
                device_code.verification_uri, device_code.user_code
            )
        });
        on_challenge.on_challenge(&DeviceCodeChallenge {
            user_code: device_code.user_code.clone(),
            verification_uri: device_code.verification_uri.clone(),
            message,
            expires_in: device_code.expires_in,
        });

        let response = match self.client.poll_device_token(&device_code, cancel).await {
            Ok(response) => response,
            Err(e) => return Outcome::Failure(e),
        };

        match self
            .record(response, scopes, TokenSource::DeviceCode, None)
            .await
        {
            Ok(result) => Outcome::Success(result),
            Err(e) => Outcome::Failure(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::TokenAcquirer;
    use crate::client::tests::{device_code_body, test_config, token_body};
    use crate::store::MemoryTokenStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SCOPE_KEY: &str = "api://weather/access.read";

    fn counting_challenge() -> (Arc<AtomicUsize>, Arc<dyn ChallengeHandler>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let handler = move |challenge: &DeviceCodeChallenge| {
            assert_eq!(challenge.user_code, "ABCD-EFGH");
            seen.fetch_add(1, Ordering::SeqCst);
        };
        (count, Arc::new(handler))
    }

    fn cached_entry(expires_in: i64, refresh_token: Option<&str>) -> CacheEntry {
        CacheEntry {
            account: CachedAccount {
                home_account_id: "uid.utid".to_string(),
                tenant_id: "utid".to_string(),
                environment: "127.0.0.1".to_string(),
            },
            scope_key: SCOPE_KEY.to_string(),
            access_token: "cached-at".to_string(),
            refresh_token: refresh_token.map(str::to_string),
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
            cached_at: Utc::now(),
        }
    }

    async fn mount_device_flow(server: &MockServer, token_response: ResponseTemplate) {
        Mock::given(method("POST"))
            .and(path("/tenant-abc/oauth2/v2.0/devicecode"))
            .respond_with(ResponseTemplate::new(200).set_body_json(device_code_body(900)))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/tenant-abc/oauth2/v2.0/token"))
            .and(body_string_contains("device_code=dev-code"))
            .respond_with(token_response)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_invalid_config_aborts_creation() {
        let server = MockServer::start().await;
        let mut config = test_config(&server);
        config.scopes.clear();

        let result = IdentitySession::create(config, GuardStatus::Degraded("none".into())).await;
        assert!(matches!(result, Err(AuthError::ConfigInvalid(_))));
    }

    #[tokio::test]
    async fn test_accounts_loaded_from_store() {
        let server = MockServer::start().await;
        let mut data = TokenCacheData::new();
        data.upsert(cached_entry(3600, Some("rt")));
        let store = Arc::new(MemoryTokenStore::with_data(data));

        let session = IdentitySession::create(test_config(&server), GuardStatus::Ok(store))
            .await
            .unwrap();

        assert!(session.is_persistent());
        let accounts = session.list_accounts().await;
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].home_account_id, "uid.utid");
    }

    #[tokio::test]
    async fn test_empty_cache_device_code_success_is_persisted() {
        let server = MockServer::start().await;
        mount_device_flow(
            &server,
            ResponseTemplate::new(200).set_body_json(token_body("fresh-at", "fresh-rt")),
        )
        .await;

        let store = MemoryTokenStore::new();
        let session = Arc::new(
            IdentitySession::create(test_config(&server), GuardStatus::Ok(Arc::new(store.clone())))
                .await
                .unwrap(),
        );
        let (challenges, handler) = counting_challenge();
        let acquirer = TokenAcquirer::for_session(Arc::clone(&session), handler);

        let token = acquirer.acquire_access_token().await.unwrap();

        assert_eq!(token, "fresh-at");
        assert_eq!(challenges.load(Ordering::SeqCst), 1);
        let persisted = store.snapshot();
        assert_eq!(persisted.len(), 1);
        let entry = persisted.get("uid.utid", SCOPE_KEY).unwrap();
        assert_eq!(entry.refresh_token.as_deref(), Some("fresh-rt"));

        // Round trip: the next call is served from the cache without another challenge.
        let again = acquirer.acquire_token().await.unwrap();
        assert_eq!(again.account.home_account_id, "uid.utid");
        assert_eq!(again.source, TokenSource::Cache);
        assert_eq!(challenges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_token_refreshed_without_prompt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant-abc/oauth2/v2.0/token"))
            .and(body_string_contains("refresh_token=old-rt"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(token_body("refreshed-at", "new-rt")),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/tenant-abc/oauth2/v2.0/devicecode"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let mut data = TokenCacheData::new();
        data.upsert(cached_entry(-60, Some("old-rt")));
        let store = MemoryTokenStore::with_data(data);
        let session = Arc::new(
            IdentitySession::create(test_config(&server), GuardStatus::Ok(Arc::new(store.clone())))
                .await
                .unwrap(),
        );
        let (challenges, handler) = counting_challenge();
        let acquirer = TokenAcquirer::for_session(session, handler);

        let result = acquirer.acquire_token().await.unwrap();

        assert_eq!(result.access_token, "refreshed-at");
        assert_eq!(result.source, TokenSource::Refresh);
        assert_eq!(challenges.load(Ordering::SeqCst), 0);
        let entry = store.snapshot();
        let entry = entry.get("uid.utid", SCOPE_KEY).unwrap();
        assert_eq!(entry.refresh_token.as_deref(), Some("new-rt"));
        assert!(!entry.is_expired());
    }

    #[tokio::test]
    async fn test_valid_cached_token_needs_no_network() {
        let server = MockServer::start().await;
        let mut data = TokenCacheData::new();
        data.upsert(cached_entry(3600, Some("rt")));
        let store = Arc::new(MemoryTokenStore::with_data(data));
        let session = Arc::new(
            IdentitySession::create(test_config(&server), GuardStatus::Ok(store))
                .await
                .unwrap(),
        );
        let (challenges, handler) = counting_challenge();

        let token = TokenAcquirer::for_session(session, handler)
            .acquire_access_token()
            .await
            .unwrap();

        assert_eq!(token, "cached-at");
        assert_eq!(challenges.load(Ordering::SeqCst), 0);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_refresh_falls_back_to_device_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant-abc/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "AADSTS70008: The refresh token has expired",
            })))
            .mount(&server)
            .await;
        mount_device_flow(
            &server,
            ResponseTemplate::new(200).set_body_json(token_body("device-at", "device-rt")),
        )
        .await;

        let mut data = TokenCacheData::new();
        data.upsert(cached_entry(-60, Some("revoked-rt")));
        let session = Arc::new(
            IdentitySession::create(
                test_config(&server),
                GuardStatus::Ok(Arc::new(MemoryTokenStore::with_data(data))),
            )
            .await
            .unwrap(),
        );
        let (challenges, handler) = counting_challenge();

        let result = TokenAcquirer::for_session(Arc::clone(&session), handler)
            .acquire_token()
            .await
            .unwrap();

        assert_eq!(result.access_token, "device-at");
        assert_eq!(result.source, TokenSource::DeviceCode);
        assert_eq!(challenges.load(Ordering::SeqCst), 1);
        assert_eq!(session.cache_snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_device_code_expiry_leaves_cache_unchanged() {
        let server = MockServer::start().await;
        mount_device_flow(
            &server,
            ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "expired_token",
                "error_description": "AADSTS70019: Verification code expired",
            })),
        )
        .await;

        let store = MemoryTokenStore::new();
        let session = Arc::new(
            IdentitySession::create(test_config(&server), GuardStatus::Ok(Arc::new(store.clone())))
                .await
                .unwrap(),
        );
        let (_, handler) = counting_challenge();

        let result = TokenAcquirer::for_session(Arc::clone(&session), handler)
            .acquire_access_token()
            .await;

        assert!(matches!(
            result,
            Err(AuthError::DeviceFlowFailed(ProviderError::DeviceCodeExpired))
        ));
        assert!(store.snapshot().is_empty());
        assert!(session.cache_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_degraded_cache_still_acquires() {
        let server = MockServer::start().await;
        mount_device_flow(
            &server,
            ResponseTemplate::new(200).set_body_json(token_body("mem-at", "mem-rt")),
        )
        .await;

        let session = Arc::new(
            IdentitySession::create(
                test_config(&server),
                GuardStatus::Degraded("permission denied".to_string()),
            )
            .await
            .unwrap(),
        );
        assert!(!session.is_persistent());
        let (challenges, handler) = counting_challenge();
        let acquirer = TokenAcquirer::for_session(Arc::clone(&session), handler);

        assert_eq!(acquirer.acquire_access_token().await.unwrap(), "mem-at");
        // Per-process cache still prevents a second challenge.
        assert_eq!(acquirer.acquire_access_token().await.unwrap(), "mem-at");
        assert_eq!(challenges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_client_info_is_a_failure() {
        let server = MockServer::start().await;
        let mut body = token_body("at", "rt");
        body.as_object_mut().unwrap().remove("client_info");
        mount_device_flow(&server, ResponseTemplate::new(200).set_body_json(body)).await;

        let session = IdentitySession::create(
            test_config(&server),
            GuardStatus::Degraded("n/a".to_string()),
        )
        .await
        .unwrap();
        let (_, handler) = counting_challenge();

        let outcome = session
            .acquire_token_by_device_code(
                &session.config().scopes.clone(),
                handler.as_ref(),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            outcome,
            Outcome::Failure(ProviderError::InvalidResponse(_))
        ));
    }

    #[derive(Debug)]
    struct UnwritableStore;

    #[async_trait::async_trait]
    impl TokenStore for UnwritableStore {
        async fn load(&self) -> std::result::Result<TokenCacheData, crate::errors::StorageError> {
            Ok(TokenCacheData::new())
        }

        async fn save(
            &self,
            _data: &TokenCacheData,
        ) -> std::result::Result<(), crate::errors::StorageError> {
            Err(crate::errors::StorageError::LockTimeout)
        }
    }

    #[tokio::test]
    async fn test_failed_write_through_still_succeeds() {
        let server = MockServer::start().await;
        mount_device_flow(
            &server,
            ResponseTemplate::new(200).set_body_json(token_body("kept-at", "kept-rt")),
        )
        .await;

        let session = Arc::new(
            IdentitySession::create(test_config(&server), GuardStatus::Ok(Arc::new(UnwritableStore)))
                .await
                .unwrap(),
        );
        assert!(session.is_persistent());
        let (challenges, handler) = counting_challenge();
        let acquirer = TokenAcquirer::for_session(Arc::clone(&session), handler);

        let first = acquirer.acquire_token().await.unwrap();
        assert_eq!(first.access_token, "kept-at");
        assert_eq!(first.source, TokenSource::DeviceCode);

        let second = acquirer.acquire_token().await.unwrap();
        assert_eq!(second.source, TokenSource::Cache);
        assert_eq!(challenges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_huge_expires_in_is_capped_not_wrapped() {
        let server = MockServer::start().await;
        let mut body = token_body("long-at", "long-rt");
        body["expires_in"] = serde_json::json!(u64::MAX);
        mount_device_flow(&server, ResponseTemplate::new(200).set_body_json(body)).await;

        let session = Arc::new(
            IdentitySession::create(
                test_config(&server),
                GuardStatus::Degraded("n/a".to_string()),
            )
            .await
            .unwrap(),
        );
        let (challenges, handler) = counting_challenge();
        let acquirer = TokenAcquirer::for_session(Arc::clone(&session), handler);

        let token = acquirer.acquire_token().await.unwrap();
        let lifetime = token.expires_at - Utc::now();
        assert!(lifetime > chrono::Duration::days(6));
        assert!(lifetime <= chrono::Duration::days(7));

        let again = acquirer.acquire_token().await.unwrap();
        assert_eq!(again.source, TokenSource::Cache);
        assert_eq!(challenges.load(Ordering::SeqCst), 1);
    }
}
