mod settings;

pub use settings::{ApiSettings, AppSettings, AuthSettings, SETTINGS_FILE, SettingsError};
