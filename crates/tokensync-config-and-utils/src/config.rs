//! Configuration management for tokensync.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

/// Default authority host (can be overridden at compile time via TOKENSYNC_AUTHORITY_HOST env var).
pub const DEFAULT_AUTHORITY_HOST: &str = match option_env!("TOKENSYNC_AUTHORITY_HOST") {
    Some(host) => host,
    None => "https://login.microsoftonline.com/",
};

/// Default public client ID (can be overridden at compile time via TOKENSYNC_CLIENT_ID env var).
pub const DEFAULT_CLIENT_ID: &str = match option_env!("TOKENSYNC_CLIENT_ID") {
    Some(id) => id,
    None => "tokensync-public-client",
};

/// Default tenant used when a request does not name one.
pub const DEFAULT_TENANT: &str = "organizations";

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default deadline for interactive sign-in.
pub const DEFAULT_INTERACTIVE_TIMEOUT_SECS: u64 = 300;

/// Main tokensync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Base URL that tenants are joined onto to form an authority.
    #[serde(default = "default_authority_host")]
    pub authority_host: String,
    /// Client ID used when a request carries no client ID marker scope.
    #[serde(default = "default_client_id")]
    pub default_client_id: String,
    /// Tenant used when a request carries no tenant marker scope.
    #[serde(default = "default_tenant")]
    pub default_tenant: String,
    /// Whether refreshes that change nothing still emit an account change event.
    #[serde(default = "default_emit_empty_diffs")]
    pub emit_empty_diffs: bool,
    /// Deadline for interactive sign-in, in seconds.
    #[serde(default = "default_interactive_timeout_secs")]
    pub interactive_timeout_secs: u64,
}

fn default_authority_host() -> String {
    DEFAULT_AUTHORITY_HOST.to_string()
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

fn default_tenant() -> String {
    DEFAULT_TENANT.to_string()
}

fn default_emit_empty_diffs() -> bool {
    true
}

fn default_interactive_timeout_secs() -> u64 {
    DEFAULT_INTERACTIVE_TIMEOUT_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            authority_host: default_authority_host(),
            default_client_id: default_client_id(),
            default_tenant: default_tenant(),
            emit_empty_diffs: default_emit_empty_diffs(),
            interactive_timeout_secs: default_interactive_timeout_secs(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the config file under `paths`, falling back to defaults.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let config_path = paths.config_file();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Override configuration from environment variables.
    /// Only the log level can be overridden at runtime.
    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var("TOKENSYNC_LOG_LEVEL") {
            self.log_level = log_level;
        }
    }

    /// Reject values that would only fail later, deep inside a sign-in.
    pub fn validate(&self) -> CoreResult<()> {
        self.authority_host()?;
        if self.default_client_id.trim().is_empty() {
            return Err(CoreError::Config("default_client_id must not be empty".to_string()));
        }
        if self.default_tenant.trim().is_empty() {
            return Err(CoreError::Config("default_tenant must not be empty".to_string()));
        }
        if self.interactive_timeout_secs == 0 {
            return Err(CoreError::Config(
                "interactive_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the authority host as a parsed URL.
    pub fn authority_host(&self) -> CoreResult<Url> {
        Url::parse(&self.authority_host).map_err(CoreError::from)
    }

    /// Interactive sign-in deadline.
    pub fn interactive_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interactive_timeout_secs)
    }
}
