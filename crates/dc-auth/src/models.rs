use serde::{Deserialize, Serialize};

/// Device authorization response (RFC 8628 section 3.2)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    #[serde(default = "default_interval")]
    pub interval: u64,
    /// Human-readable instructions composed by the provider
    #[serde(default)]
    pub message: Option<String>,
}

fn default_interval() -> u64 {
    5
}

/// Token endpoint success response (device code and refresh_token grants)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    pub token_type: String,
    #[serde(default)]
    pub scope: Option<String>,
    /// Base64url-encoded JSON `{"uid": .., "utid": ..}` returned when `client_info=1`
    #[serde(default)]
    pub client_info: Option<String>,
}

/// Token endpoint error response (RFC 6749 section 5.2)
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Decoded `client_info` payload
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ClientInfo {
    pub uid: String,
    pub utid: String,
}

impl ClientInfo {
    /// Account identifier stable across tenants and sign-ins
    pub fn home_account_id(&self) -> String {
        format!("{}.{}", self.uid, self.utid)
    }
}
