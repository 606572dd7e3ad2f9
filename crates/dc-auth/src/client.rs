use std::time::{Duration, Instant};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use reqwest::{Client, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::{MAX_DEVICE_CODE_LIFETIME, SessionConfig, endpoints, request_scope};
use crate::errors::{AuthError, ProviderError};
use crate::models::*;

/// HTTP adapter for the Microsoft identity platform token endpoints
#[derive(Debug, Clone)]
pub struct MsIdentityClient {
    config: SessionConfig,
    http: Client,
    device_code_url: Url,
    token_url: Url,
}

impl MsIdentityClient {
    /// Create a client for a validated session configuration
    pub fn new(config: SessionConfig) -> Result<Self, AuthError> {
        let device_code_url = config
            .device_code_url()
            .map_err(|e| AuthError::ConfigInvalid(format!("device code endpoint: {e}")))?;
        let token_url = config
            .token_url()
            .map_err(|e| AuthError::ConfigInvalid(format!("token endpoint: {e}")))?;

        let http = Client::builder()
            .connect_timeout(config.http_timeouts.connect)
            .timeout(config.http_timeouts.request)
            .user_agent(config.user_agent.as_deref().unwrap_or("devicecode-console"))
            .build()
            .map_err(|e| AuthError::ConfigInvalid(format!("HTTP client: {e}")))?;

        Ok(Self {
            config,
            http,
            device_code_url,
            token_url,
        })
    }

    /// Host recorded as the environment of accounts issued through this client
    pub fn environment(&self) -> String {
        self.config
            .authority
            .host_str()
            .unwrap_or_default()
            .to_string()
    }

    /// Start a device authorization request
    #[instrument(skip(self))]
    pub async fn request_device_code(
        &self,
        scopes: &[String],
    ) -> Result<DeviceCodeResponse, ProviderError> {
        let scope = request_scope(scopes);
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("scope", scope.as_str()),
        ];

        debug!("Requesting device code");
        let response = self
            .http
            .post(self.device_code_url.clone())
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let device_code: DeviceCodeResponse = response.json().await?;
        debug!(
            "Device code issued, expires in {}s, interval {}s",
            device_code.expires_in, device_code.interval
        );
        Ok(device_code)
    }

    /// Poll the token endpoint until the user completes, declines, or the code expires
    #[instrument(skip(self, device_code, cancel))]
    pub async fn poll_device_token(
        &self,
        device_code: &DeviceCodeResponse,
        cancel: &CancellationToken,
    ) -> Result<TokenResponse, ProviderError> {
        let params = [
            ("grant_type", endpoints::DEVICE_CODE_GRANT),
            ("client_id", self.config.client_id.as_str()),
            ("device_code", device_code.device_code.as_str()),
            ("client_info", "1"),
        ];

        let policy = &self.config.polling;
        let lifetime = Duration::from_secs(device_code.expires_in).min(MAX_DEVICE_CODE_LIFETIME);
        let mut interval = Duration::from_secs(device_code.interval)
            .max(policy.min_interval)
            .min(lifetime);
        let deadline = Instant::now() + lifetime;

        loop {
            // Wait one interval before every poll, the first included.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }

            if Instant::now() >= deadline {
                return Err(ProviderError::DeviceCodeExpired);
            }

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                response = self.http.post(self.token_url.clone())
                    .header("Accept", "application/json")
                    .form(&params)
                    .send() => response?,
            };

            if response.status().is_success() {
                debug!("Device code redeemed");
                return Ok(response.json().await?);
            }

            match Self::error_from(response).await {
                ProviderError::OAuth { error, .. } if error == "authorization_pending" => {}
                ProviderError::OAuth { error, .. } if error == "slow_down" => {
                    interval = interval.saturating_add(policy.slow_down_increment);
                    warn!("Provider requested slower polling, interval now {:?}", interval);
                }
                ProviderError::OAuth { error, .. } if error == "expired_token" => {
                    return Err(ProviderError::DeviceCodeExpired);
                }
                ProviderError::OAuth { error, .. }
                    if error == "access_denied" || error == "authorization_declined" =>
                {
                    return Err(ProviderError::AuthorizationDeclined);
                }
                other => return Err(other),
            }
        }
    }

    /// Redeem a refresh token for a new access token
    #[instrument(skip(self, refresh_token))]
    pub async fn redeem_refresh_token(
        &self,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, ProviderError> {
        let scope = request_scope(scopes);
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", self.config.client_id.as_str()),
            ("refresh_token", refresh_token),
            ("scope", scope.as_str()),
            ("client_info", "1"),
        ];

        debug!("Refreshing access token");
        let response = self
            .http
            .post(self.token_url.clone())
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        Ok(response.json().await?)
    }

    /// Map a non-success response to an OAuth error when the body carries one
    async fn error_from(response: Response) -> ProviderError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        match serde_json::from_str::<OAuthErrorResponse>(&body) {
            Ok(oauth) => ProviderError::OAuth {
                error: oauth.error,
                description: oauth.error_description,
            },
            Err(_) => ProviderError::Http {
                status,
                body_snippet: body.chars().take(200).collect(),
            },
        }
    }
}

/// Decode the base64url JSON `client_info` returned alongside tokens
pub fn decode_client_info(raw: &str) -> Result<ClientInfo, ProviderError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(raw.trim_end_matches('='))
        .map_err(|e| ProviderError::InvalidResponse(format!("Invalid client_info: {e}")))?;

    Ok(serde_json::from_slice(&bytes)?)
}
