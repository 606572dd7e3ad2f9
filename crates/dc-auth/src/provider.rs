use tokio_util::sync::CancellationToken;

use crate::errors::ProviderError;
use crate::token::{CachedAccount, TokenResult};

/// Result of a single acquisition attempt against the identity provider
#[derive(Debug)]
pub enum Outcome {
    Success(TokenResult),
    /// Silent acquisition is impossible; the reason is the provider's classification
    InteractionRequired(String),
    Failure(ProviderError),
}

/// What the user must do to finish a device-code sign-in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCodeChallenge {
    pub user_code: String,
    pub verification_uri: String,
    /// Ready-to-display instructions
    pub message: String,
    pub expires_in: u64,
}

/// Presents a device-code challenge to the user
pub trait ChallengeHandler: Send + Sync {
    fn on_challenge(&self, challenge: &DeviceCodeChallenge);
}

impl<F> ChallengeHandler for F
where
    F: Fn(&DeviceCodeChallenge) + Send + Sync,
{
    fn on_challenge(&self, challenge: &DeviceCodeChallenge) {
        self(challenge)
    }
}

/// Identity provider operations the acquisition state machine depends on
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Snapshot of cached accounts, ascending by home account id
    async fn list_accounts(&self) -> Vec<CachedAccount>;

    /// Acquire from cache, refreshing transparently when a refresh credential allows it
    async fn acquire_token_silent(
        &self,
        account: Option<&CachedAccount>,
        scopes: &[String],
    ) -> Outcome;

    /// Run the device-code flow, calling `on_challenge` once before waiting for the user
    async fn acquire_token_by_device_code(
        &self,
        scopes: &[String],
        on_challenge: &dyn ChallengeHandler,
        cancel: &CancellationToken,
    ) -> Outcome;
}
