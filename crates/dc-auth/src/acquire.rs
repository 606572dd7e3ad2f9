//! Token acquisition state machine.
//!
//! ```text
//! Idle -> SilentAttempt -> Done
//!                       -> InteractivePending -> InteractiveAttempt -> Done | Failed
//!                       -> Failed
//! ```
//!
//! Only an explicit interaction-required outcome from the silent attempt escalates to the
//! device-code flow; every other silent failure is terminal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{AccountSelection, scope_key};
use crate::errors::{AuthError, ProviderError, Result};
use crate::provider::{ChallengeHandler, IdentityProvider, Outcome};
use crate::session::IdentitySession;
use crate::token::{CachedAccount, TokenResult};

/// One async mutex per scope set, so at most one acquisition runs per (account, scope set)
#[derive(Debug, Default)]
pub struct FlightGuards {
    guards: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl FlightGuards {
    /// Wait for any in-flight acquisition of `key` to finish, then claim it
    pub async fn enter(&self, key: &str) -> OwnedMutexGuard<()> {
        let guard = {
            let mut guards = self.guards.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(guards.entry(key.to_string()).or_default())
        };
        guard.lock_owned().await
    }
}

#[derive(Debug)]
enum State {
    Idle,
    SilentAttempt(Option<CachedAccount>),
    InteractivePending(String),
    InteractiveAttempt,
    Done(TokenResult),
    Failed(AuthError),
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::SilentAttempt(_) => "SilentAttempt",
            Self::InteractivePending(_) => "InteractivePending",
            Self::InteractiveAttempt => "InteractiveAttempt",
            Self::Done(_) => "Done",
            Self::Failed(_) => "Failed",
        }
    }
}

/// Cancels the interactive wait when the configured timeout elapses
struct TimeoutGuard(Option<JoinHandle<()>>);

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Obtains access tokens silently first and via device code only when required
#[derive(Clone)]
pub struct TokenAcquirer {
    provider: Arc<dyn IdentityProvider>,
    scopes: Vec<String>,
    selection: AccountSelection,
    challenge: Arc<dyn ChallengeHandler>,
    device_code_timeout: Option<Duration>,
    flights: Arc<FlightGuards>,
}

impl TokenAcquirer {
    /// Acquirer over an arbitrary provider with its own in-flight guards
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        scopes: Vec<String>,
        challenge: Arc<dyn ChallengeHandler>,
    ) -> Self {
        Self {
            provider,
            scopes,
            selection: AccountSelection::default(),
            challenge,
            device_code_timeout: None,
            flights: Arc::new(FlightGuards::default()),
        }
    }

    /// Acquirer for the session's configured scopes and account selection
    pub fn for_session(session: Arc<IdentitySession>, challenge: Arc<dyn ChallengeHandler>) -> Self {
        let scopes = session.config().scopes.clone();
        let selection = session.config().account_selection.clone();
        let flights = session.flights();

        Self {
            provider: session,
            scopes,
            selection,
            challenge,
            device_code_timeout: None,
            flights,
        }
    }

    pub fn with_account_selection(mut self, selection: AccountSelection) -> Self {
        self.selection = selection;
        self
    }

    /// Give up on the interactive wait after `timeout`
    pub fn with_device_code_timeout(mut self, timeout: Duration) -> Self {
        self.device_code_timeout = Some(timeout);
        self
    }

    /// Access token string for an `Authorization: Bearer` header
    pub async fn acquire_access_token(&self) -> Result<String> {
        self.acquire_access_token_with_cancel(CancellationToken::new())
            .await
    }

    pub async fn acquire_access_token_with_cancel(&self, cancel: CancellationToken) -> Result<String> {
        self.acquire_token_with_cancel(cancel)
            .await
            .map(|result| result.access_token)
    }

    pub async fn acquire_token(&self) -> Result<TokenResult> {
        self.acquire_token_with_cancel(CancellationToken::new()).await
    }

    /// Run the state machine to a terminal state
    #[instrument(skip(self, cancel), fields(scopes = %self.scopes.join(" ")))]
    pub async fn acquire_token_with_cancel(&self, cancel: CancellationToken) -> Result<TokenResult> {
        let _in_flight = self.flights.enter(&scope_key(&self.scopes)).await;

        let mut state = State::Idle;
        loop {
            state = match state {
                State::Idle => {
                    let accounts = self.provider.list_accounts().await;
                    State::SilentAttempt(self.select_account(accounts))
                }
                State::SilentAttempt(account) => {
                    match self
                        .provider
                        .acquire_token_silent(account.as_ref(), &self.scopes)
                        .await
                    {
                        Outcome::Success(result) => {
                            Self::checked(result, AuthError::UnknownAuthError)
                        }
                        Outcome::InteractionRequired(reason) => State::InteractivePending(reason),
                        Outcome::Failure(e) => State::Failed(AuthError::UnknownAuthError(e)),
                    }
                }
                State::InteractivePending(reason) => {
                    info!("Interactive authorization required: {}", reason);
                    State::InteractiveAttempt
                }
                State::InteractiveAttempt => {
                    let cancel = cancel.child_token();
                    let _timeout = self.arm_timeout(&cancel);

                    match self
                        .provider
                        .acquire_token_by_device_code(&self.scopes, self.challenge.as_ref(), &cancel)
                        .await
                    {
                        Outcome::Success(result) => {
                            Self::checked(result, AuthError::DeviceFlowFailed)
                        }
                        Outcome::InteractionRequired(reason) => {
                            State::Failed(AuthError::DeviceFlowFailed(ProviderError::OAuth {
                                error: "interaction_required".to_string(),
                                description: Some(reason),
                            }))
                        }
                        Outcome::Failure(e) => State::Failed(AuthError::DeviceFlowFailed(e)),
                    }
                }
                State::Done(result) => {
                    info!(
                        "Successfully authenticated account {} (token from {})",
                        result.account.home_account_id, result.source
                    );
                    return Ok(result);
                }
                State::Failed(e) => {
                    warn!("Failed to authenticate: {}", e);
                    return Err(e);
                }
            };
            debug!(state = state.name(), "Acquisition state transition");
        }
    }

    /// A success without a usable token is a failure of the attempt that produced it
    fn checked(result: TokenResult, fail: fn(ProviderError) -> AuthError) -> State {
        if result.access_token.is_empty() {
            State::Failed(fail(ProviderError::InvalidResponse(
                "Provider returned an empty access token".to_string(),
            )))
        } else {
            State::Done(result)
        }
    }

    fn select_account(&self, accounts: Vec<CachedAccount>) -> Option<CachedAccount> {
        if accounts.len() > 1 {
            debug!("{} cached accounts, selecting by {:?}", accounts.len(), self.selection);
        }

        match &self.selection {
            AccountSelection::First => accounts.into_iter().next(),
            AccountSelection::HomeAccountId(id) => {
                accounts.into_iter().find(|a| &a.home_account_id == id)
            }
        }
    }

    fn arm_timeout(&self, cancel: &CancellationToken) -> TimeoutGuard {
        TimeoutGuard(self.device_code_timeout.map(|timeout| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!("Device code wait timed out after {:?}", timeout);
                cancel.cancel();
            })
        }))
    }
}
