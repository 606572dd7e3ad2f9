use std::path::{Path, PathBuf};

use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

pub const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub auth: AuthSettings,
    pub api: ApiSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub client_id: String,
    pub tenant_id: String,
    pub scopes: Vec<String>,
    pub cache_file_name: String,
    /// Overrides the per-user data directory holding the token cache
    pub cache_dir: Option<PathBuf>,
    /// Give up waiting for the device-code sign-in after this many seconds
    pub device_code_timeout_secs: Option<u64>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            tenant_id: "organizations".to_string(),
            scopes: Vec::new(),
            cache_file_name: "token.cache".to_string(),
            cache_dir: None,
            device_code_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_address: String,
    pub path: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_address: "https://localhost:8181".to_string(),
            path: "/WeatherForecast".to_string(),
        }
    }
}

impl AppSettings {
    /// Load `settings.toml` from the per-user config directory, then apply `DC_*` overrides
    #[instrument(level = "info")]
    pub async fn load() -> Result<Self, SettingsError> {
        let path = Self::default_path()?;
        let mut settings = Self::load_from(&path).await?;
        settings.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(settings)
    }

    /// Load a settings file; a missing file yields the defaults
    #[instrument(level = "debug")]
    pub async fn load_from(path: &Path) -> Result<Self, SettingsError> {
        if tokio::fs::metadata(path).await.is_err() {
            info!(
                "Settings file {} doesn't exist, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read settings file")
            .map_err(|e| {
                error!("Failed to read settings file {}: {}", path.display(), e);
                SettingsError::FileReadFailed {
                    path: path.to_path_buf(),
                    source: e,
                }
            })?;

        let settings: Self = toml::from_str(&content)
            .context("Failed to parse settings file")
            .map_err(|e| {
                error!("Failed to parse settings file {}: {}", path.display(), e);
                SettingsError::ParsingFailed {
                    path: path.to_path_buf(),
                    source: e,
                }
            })?;

        debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Apply `DC_*` overrides resolved through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = get("DC_CLIENT_ID") {
            self.auth.client_id = value;
        }
        if let Some(value) = get("DC_TENANT_ID") {
            self.auth.tenant_id = value;
        }
        if let Some(value) = get("DC_SCOPES") {
            self.auth.scopes = value
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|scope| !scope.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = get("DC_CACHE_FILE") {
            self.auth.cache_file_name = value;
        }
        if let Some(value) = get("DC_CACHE_DIR") {
            self.auth.cache_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = get("DC_API_BASE_ADDRESS") {
            self.api.base_address = value;
        }
        if let Some(value) = get("DC_API_PATH") {
            self.api.path = value;
        }
        if let Some(value) = get("DC_DEVICE_CODE_TIMEOUT_SECS") {
            let secs = value
                .parse::<u64>()
                .map_err(|_| SettingsError::InvalidOverride {
                    name: "DC_DEVICE_CODE_TIMEOUT_SECS",
                    value,
                })?;
            self.auth.device_code_timeout_secs = Some(secs);
        }

        Ok(())
    }

    pub fn default_path() -> Result<PathBuf, SettingsError> {
        let proj_dirs = ProjectDirs::from("com", "devicecode", "devicecode-console")
            .ok_or_else(|| {
                error!("Failed to determine project directories - this usually indicates an unsupported OS or missing home directory");
                SettingsError::ProjectDirectoriesUnavailable
            })?;

        Ok(proj_dirs.config_dir().join(SETTINGS_FILE))
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(
        "Project directories are unavailable - this usually indicates an unsupported OS or missing home directory"
    )]
    ProjectDirectoriesUnavailable,

    #[error("Failed to read settings file '{path}': {source}")]
    FileReadFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to parse settings file '{path}': {source}")]
    ParsingFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Invalid value '{value}' for {name}")]
    InvalidOverride { name: &'static str, value: String },
}
