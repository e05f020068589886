//! Engine configuration.
//!
//! Read from the `[auth]` section of a TOML file (by default
//! `config/default.toml`). A missing file or section yields the defaults;
//! `AUTHSYNC_*` environment variables override individual fields.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AuthEngineError, Result};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Settings for the controller, the backend client and the navigation guard.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Base URL of the application backend.
    pub backend_url: String,
    /// Path of the token-exchange endpoint, relative to `backend_url`.
    pub sync_path: String,
    /// Transport timeout for the exchange request.
    pub request_timeout_secs: u64,
    /// How long a sync error stays visible before it is cleared.
    pub error_clear_delay_ms: u64,
    /// SQLite file holding the persisted stores.
    pub database_path: PathBuf,
    /// Navigation segment of the authenticated app shell.
    pub app_segment: String,
    /// Route that enters the authenticated app shell.
    pub app_route: String,
    /// Signed-out entry point.
    pub signed_out_route: String,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:3000".to_string(),
            sync_path: "/auth/sync".to_string(),
            request_timeout_secs: 15,
            error_clear_delay_ms: 5_000,
            database_path: PathBuf::from("data/auth.db"),
            app_segment: "(app)".to_string(),
            app_route: "/(app)".to_string(),
            signed_out_route: "/".to_string(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    auth: Option<AuthConfig>,
}

impl AuthConfig {
    /// Parse the `[auth]` section out of a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content).map_err(|e| AuthEngineError::InvalidConfig {
            reason: format!("malformed TOML: {e}"),
        })?;
        Ok(file.auth.unwrap_or_default())
    }

    /// Load from `path`, falling back to the defaults when the file is absent,
    /// then apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `AUTHSYNC_BACKEND_URL`, `AUTHSYNC_DB_PATH` and `AUTHSYNC_LOG`
    /// through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("AUTHSYNC_BACKEND_URL") {
            self.backend_url = url;
        }
        if let Some(path) = lookup("AUTHSYNC_DB_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(level) = lookup("AUTHSYNC_LOG") {
            self.log_level = level;
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(AuthEngineError::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        if self.backend_url.trim().is_empty() {
            return invalid("backend_url is empty");
        }
        url::Url::parse(&self.backend_url)?;
        if !self.sync_path.starts_with('/') {
            return invalid("sync_path must start with '/'");
        }
        if self.app_segment.is_empty() || self.app_route.is_empty() || self.signed_out_route.is_empty() {
            return invalid("navigation routes must not be empty");
        }
        if self.request_timeout_secs == 0 {
            return invalid("request_timeout_secs must be positive");
        }
        Ok(())
    }

    /// Full URL of the exchange endpoint.
    pub fn sync_url(&self) -> Result<url::Url> {
        let base = url::Url::parse(&self.backend_url)?;
        Ok(base.join(&self.sync_path)?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn error_clear_delay(&self) -> Duration {
        Duration::from_millis(self.error_clear_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
