use thiserror::Error;

/// Caller-facing authentication error
///
/// There is no `InteractionRequired` variant: that signal is carried by
/// [`crate::Outcome`] and always resolved inside the acquisition state machine.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Token cache storage unavailable: {0}")]
    StorageUnavailable(#[from] StorageError),

    #[error("Device code authentication could not be completed: {0}")]
    DeviceFlowFailed(#[source] ProviderError),

    #[error("Authentication could not be completed: {0}")]
    UnknownAuthError(#[source] ProviderError),
}

impl AuthError {
    /// True when the interactive wait was cancelled or timed out locally
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::DeviceFlowFailed(ProviderError::Cancelled))
    }
}

/// Faults raised while talking to the identity provider
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP error {status}: {body_snippet}")]
    Http {
        status: reqwest::StatusCode,
        body_snippet: String,
    },

    #[error("OAuth error '{error}': {}", description.as_deref().unwrap_or("no description"))]
    OAuth {
        error: String,
        description: Option<String>,
    },

    #[error("Device code expired before the user completed sign-in")]
    DeviceCodeExpired,

    #[error("User declined the authorization request")]
    AuthorizationDeclined,

    #[error("Device code wait was cancelled")]
    Cancelled,

    #[error("JSON serialization/deserialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// OAuth error codes that mean silent acquisition is structurally impossible
const INTERACTION_REQUIRED_CODES: &[&str] = &[
    "invalid_grant",
    "interaction_required",
    "login_required",
    "consent_required",
];

impl ProviderError {
    /// Whether the provider classified this failure as needing user interaction
    pub fn requires_interaction(&self) -> bool {
        match self {
            Self::OAuth { error, .. } => INTERACTION_REQUIRED_CODES.contains(&error.as_str()),
            _ => false,
        }
    }
}

/// Token cache storage faults
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out waiting for the token cache lock")]
    LockTimeout,

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Keyring error: {0}")]
    Keyring(String),

    #[error("Token cache is corrupted or was encrypted with another key")]
    CorruptedStore,

    #[error("No passphrase available to unlock the token cache")]
    PassphraseUnavailable,

    #[error("Could not determine a per-user storage directory")]
    NoStorageDir,

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AuthError>;
