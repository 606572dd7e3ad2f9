mod console;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dc_auth::{
    CacheGuard, DeviceCodeChallenge, EnvSecretProvider, FileTokenStore, IdentitySession,
    SessionConfig, TokenAcquirer,
};
use dc_config::AppSettings;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = AppSettings::load()
        .await
        .context("Failed to load settings")?;

    let config = SessionConfig::new(
        settings.auth.client_id.clone(),
        settings.auth.tenant_id.clone(),
        settings.auth.scopes.clone(),
    )
    .with_cache_file_name(settings.auth.cache_file_name.clone());

    let cache_dir = settings.auth.cache_dir.clone();
    let cache_name = config.cache_file_name.clone();
    let cache = CacheGuard::open(async move {
        let dir = match cache_dir {
            Some(dir) => dir,
            None => FileTokenStore::default_storage_dir()?,
        };
        FileTokenStore::open(dir, &cache_name, Arc::new(EnvSecretProvider::default())).await
    })
    .await;
    if cache.is_degraded() {
        println!("Error while verifying cache persistence. Skipping this process.");
    }

    let session = IdentitySession::create(config, cache)
        .await
        .context("Failed to initialise the identity session. Please check the client id, tenant id and scopes!")?;

    let challenge = |challenge: &DeviceCodeChallenge| {
        println!("Requesting token...");
        println!("{}", challenge.message);
    };
    let mut acquirer = TokenAcquirer::for_session(Arc::new(session), Arc::new(challenge));
    if let Some(secs) = settings.auth.device_code_timeout_secs {
        acquirer = acquirer.with_device_code_timeout(Duration::from_secs(secs));
    }

    info!(
        "Ready to call {}{}",
        settings.api.base_address, settings.api.path
    );
    console::run(&acquirer, &settings.api).await
}
