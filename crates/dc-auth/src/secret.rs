use zeroize::Zeroizing;

/// Source of the passphrase protecting the token cache when no OS keyring key exists
#[async_trait::async_trait]
pub trait SecretProvider: Send + Sync {
    /// Returns None if no passphrase is available
    async fn get_passphrase(&self, prompt: &str) -> Option<Zeroizing<String>>;
}

/// Keyring-only operation: never yields a passphrase
#[derive(Debug, Clone, Default)]
pub struct NoSecretProvider;

#[async_trait::async_trait]
impl SecretProvider for NoSecretProvider {
    async fn get_passphrase(&self, _prompt: &str) -> Option<Zeroizing<String>> {
        None
    }
}

/// Reads the passphrase from an environment variable
#[derive(Debug, Clone)]
pub struct EnvSecretProvider {
    var: String,
}

impl EnvSecretProvider {
    pub const DEFAULT_VAR: &'static str = "DC_CACHE_PASSPHRASE";

    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvSecretProvider {
    fn default() -> Self {
        Self::new(Self::DEFAULT_VAR)
    }
}

#[async_trait::async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn get_passphrase(&self, prompt: &str) -> Option<Zeroizing<String>> {
        match std::env::var(&self.var) {
            Ok(value) if !value.is_empty() => Some(Zeroizing::new(value)),
            _ => {
                tracing::debug!("{} ({} is not set)", prompt, self.var);
                None
            }
        }
    }
}

/// Fixed passphrase, for tests
#[derive(Debug, Clone)]
pub struct StaticSecretProvider {
    secret: String,
}

impl StaticSecretProvider {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[async_trait::async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn get_passphrase(&self, _prompt: &str) -> Option<Zeroizing<String>> {
        Some(Zeroizing::new(self.secret.clone()))
    }
}
