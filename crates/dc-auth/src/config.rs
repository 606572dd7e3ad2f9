use std::time::Duration;
use url::Url;

use crate::errors::{AuthError, Result};

/// Microsoft identity platform endpoints
pub mod endpoints {
    pub const AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
    pub const NATIVE_CLIENT_REDIRECT: &str =
        "https://login.microsoftonline.com/common/oauth2/nativeclient";
    pub const DEVICE_CODE_PATH: &str = "oauth2/v2.0/devicecode";
    pub const TOKEN_PATH: &str = "oauth2/v2.0/token";
    pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
}

/// Scopes added to every request so the provider issues a refresh credential and account info
pub const RESERVED_SCOPES: &[&str] = &["openid", "profile", "offline_access"];

/// Default token cache file name
pub const DEFAULT_CACHE_FILE: &str = "token.cache";

/// Time skew for token expiration (refresh 5 minutes early)
pub const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(300);

/// Upper bound on a provider-reported access token lifetime
pub const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Upper bound on a provider-reported device code lifetime
pub const MAX_DEVICE_CODE_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            request: Duration::from_secs(30),
        }
    }
}

/// Device code polling behaviour
#[derive(Debug, Clone)]
pub struct PollingPolicy {
    /// Lower bound applied to the provider-advertised interval
    pub min_interval: Duration,
    /// Added to the interval every time the provider answers `slow_down`
    pub slow_down_increment: Duration,
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            slow_down_increment: Duration::from_secs(5),
        }
    }
}

/// Which cached account the acquisition state machine targets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AccountSelection {
    /// First account in listing order (ascending home account id)
    #[default]
    First,
    /// A specific account; when absent from the cache no account hint is used
    HomeAccountId(String),
}

/// Immutable configuration of an identity client session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Application (client) id registered with the identity provider
    pub client_id: String,

    /// Directory tenant id, or one of `common`, `organizations`, `consumers`
    pub tenant_id: String,

    /// Requested scopes, in the order given
    pub scopes: Vec<String>,

    /// Redirect target registered for the public client
    pub redirect_uri: Url,

    /// Token cache file name inside the per-user cache directory
    pub cache_file_name: String,

    /// Authority host the tenant-relative endpoints are resolved against
    pub authority: Url,

    pub http_timeouts: HttpTimeouts,

    /// Custom user agent (optional)
    pub user_agent: Option<String>,

    pub polling: PollingPolicy,

    pub account_selection: AccountSelection,
}

impl SessionConfig {
    /// Create a config with default authority, redirect and cache settings
    pub fn new(
        client_id: impl Into<String>,
        tenant_id: impl Into<String>,
        scopes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut ordered: Vec<String> = Vec::new();
        for scope in scopes.into_iter().map(Into::into) {
            let scope = scope.trim().to_string();
            if !ordered.iter().any(|s| s.eq_ignore_ascii_case(&scope)) {
                ordered.push(scope);
            }
        }

        Self {
            client_id: client_id.into().trim().to_string(),
            tenant_id: tenant_id.into().trim().to_string(),
            scopes: ordered,
            redirect_uri: Url::parse(endpoints::NATIVE_CLIENT_REDIRECT)
                .expect("valid redirect URI"),
            cache_file_name: DEFAULT_CACHE_FILE.to_string(),
            authority: Url::parse(endpoints::AUTHORITY_HOST).expect("valid authority URL"),
            http_timeouts: HttpTimeouts::default(),
            user_agent: Some("devicecode-console".to_string()),
            polling: PollingPolicy::default(),
            account_selection: AccountSelection::default(),
        }
    }

    pub fn with_authority(mut self, authority: Url) -> Self {
        self.authority = authority;
        self
    }

    pub fn with_cache_file_name(mut self, name: impl Into<String>) -> Self {
        self.cache_file_name = name.into();
        self
    }

    pub fn with_account_selection(mut self, selection: AccountSelection) -> Self {
        self.account_selection = selection;
        self
    }

    pub fn with_polling(mut self, polling: PollingPolicy) -> Self {
        self.polling = polling;
        self
    }

    /// Reject malformed identifiers, empty scope sets and unusable cache names
    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() || self.client_id.chars().any(char::is_whitespace) {
            return Err(AuthError::ConfigInvalid(format!(
                "client id '{}' is empty or contains whitespace",
                self.client_id
            )));
        }

        let tenant_ok = !self.tenant_id.is_empty()
            && self
                .tenant_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'));
        if !tenant_ok {
            return Err(AuthError::ConfigInvalid(format!(
                "tenant id '{}' is not a valid tenant identifier",
                self.tenant_id
            )));
        }

        if self.scopes.is_empty() {
            return Err(AuthError::ConfigInvalid(
                "at least one scope is required".to_string(),
            ));
        }
        if let Some(bad) = self
            .scopes
            .iter()
            .find(|s| s.is_empty() || s.chars().any(char::is_whitespace))
        {
            return Err(AuthError::ConfigInvalid(format!(
                "scope '{bad}' is empty or contains whitespace"
            )));
        }

        if self.cache_file_name.is_empty()
            || self.cache_file_name.contains(['/', '\\'])
            || self.cache_file_name.starts_with('.')
        {
            return Err(AuthError::ConfigInvalid(format!(
                "cache file name '{}' must be a plain file name",
                self.cache_file_name
            )));
        }

        let loopback = matches!(
            self.authority.host_str(),
            Some("localhost") | Some("127.0.0.1") | Some("[::1]")
        );
        if self.authority.scheme() != "https" && !(loopback && self.authority.scheme() == "http") {
            return Err(AuthError::ConfigInvalid(format!(
                "authority '{}' must use https",
                self.authority
            )));
        }

        Ok(())
    }

    /// Normalized key for the configured scope set
    pub fn scope_key(&self) -> String {
        scope_key(&self.scopes)
    }

    pub fn device_code_url(&self) -> std::result::Result<Url, url::ParseError> {
        self.authority
            .join(&format!("{}/{}", self.tenant_id, endpoints::DEVICE_CODE_PATH))
    }

    pub fn token_url(&self) -> std::result::Result<Url, url::ParseError> {
        self.authority
            .join(&format!("{}/{}", self.tenant_id, endpoints::TOKEN_PATH))
    }
}

/// Lower-cased, de-duplicated, sorted scope set joined by spaces
pub fn scope_key(scopes: &[String]) -> String {
    let mut normalized: Vec<String> = scopes.iter().map(|s| s.to_ascii_lowercase()).collect();
    normalized.sort();
    normalized.dedup();
    normalized.join(" ")
}

/// Scopes sent on the wire: configured scopes followed by the reserved ones
pub fn request_scope(scopes: &[String]) -> String {
    let mut all: Vec<&str> = scopes.iter().map(String::as_str).collect();
    for reserved in RESERVED_SCOPES {
        if !all.iter().any(|s| s.eq_ignore_ascii_case(reserved)) {
            all.push(reserved);
        }
    }
    all.join(" ")
}
