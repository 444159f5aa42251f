// Session configuration: `~/.concord/session.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root directory for Concord client state: `~/.concord/`.
pub fn concord_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".concord"))
}

/// Path to the session config file: `~/.concord/session.toml`.
pub fn session_config_path() -> Option<PathBuf> {
    concord_dir().map(|d| d.join("session.toml"))
}

/// Default shared Lease Store location: `~/.concord/leases.db`.
pub fn default_lease_store_path() -> PathBuf {
    concord_dir().unwrap_or_else(|| PathBuf::from(".concord")).join("leases.db")
}

/// How sessions reach each other.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Direct broadcast channel. Only reaches sessions in the same process.
    Channel,
    /// Timestamped records in the shared Lease Store. Reaches every process
    /// that opens the same store.
    #[default]
    Storage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Base URL of the Concord server (e.g. `http://127.0.0.1:8080`).
    pub server_url: Option<String>,
    pub lease_ttl_ms: u64,
    /// Leader renewal period. Defaults to a third of the TTL.
    pub heartbeat_interval_ms: Option<u64>,
    pub recheck_margin_ms: u64,
    pub lock_timeout_ms: u64,
    pub lease_store_path: PathBuf,
    pub transport: TransportKind,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            lease_ttl_ms: 15_000,
            heartbeat_interval_ms: None,
            recheck_margin_ms: 1_000,
            lock_timeout_ms: 10_000,
            lease_store_path: default_lease_store_path(),
            transport: TransportKind::Storage,
        }
    }
}

impl SessionConfig {
    /// Load from `~/.concord/session.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        session_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_ttl_ms == 0 {
            return Err(ConfigError::Invalid("lease_ttl_ms must be > 0".into()));
        }
        if self.lock_timeout_ms == 0 {
            return Err(ConfigError::Invalid("lock_timeout_ms must be > 0".into()));
        }
        let heartbeat = self.heartbeat_interval().as_millis();
        if heartbeat == 0 || heartbeat >= u128::from(self.lease_ttl_ms) {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_interval_ms ({heartbeat}) must be > 0 and < lease_ttl_ms ({})",
                self.lease_ttl_ms
            )));
        }
        if let Some(url) = &self.server_url {
            url::Url::parse(url)
                .map_err(|error| ConfigError::Invalid(format!("server_url `{url}`: {error}")))?;
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.lease_ttl() / 3)
    }

    pub fn recheck_margin(&self) -> Duration {
        Duration::from_millis(self.recheck_margin_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
