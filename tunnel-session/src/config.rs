//! Session configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::AccessScope;

/// Errors from loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Configuration for a tunnel session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Access scope the session token must grant
    #[serde(default = "default_access_scope")]
    pub access_scope: String,

    /// Sub-protocols offered to the host, most preferred first
    #[serde(default = "default_protocols")]
    pub protocols: Vec<String>,

    /// Capabilities requested during the first-connect handshake
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,

    /// Timeout for establishing a stream to one endpoint
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Timeout for each configuration handshake exchange
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Outbound messages buffered while the stream is down
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Reconnection backoff
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Backoff configuration for reconnection attempts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first retry
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Ceiling for the doubling delay
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Maximum consecutive attempts; unlimited when unset
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_access_scope() -> String {
    AccessScope::CONNECT.to_string()
}

fn default_protocols() -> Vec<String> {
    vec![
        "tunnel-relay-client-v2".to_string(),
        "tunnel-relay-client".to_string(),
    ]
}

fn default_capabilities() -> Vec<String> {
    vec!["multiplexing".to_string()]
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_outbound_buffer() -> usize {
    64
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            max_attempts: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            access_scope: default_access_scope(),
            protocols: default_protocols(),
            capabilities: default_capabilities(),
            connect_timeout: default_connect_timeout(),
            handshake_timeout: default_handshake_timeout(),
            outbound_buffer: default_outbound_buffer(),
            retry: RetryConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Default config file location (`<config dir>/tunnel-session/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tunnel-session").join("config.toml"))
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Load the config at [`Self::default_path`], or defaults if it does not exist
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.access_scope.trim().is_empty() {
            return Err(ConfigError::Invalid("access_scope must not be empty".into()));
        }
        if self.protocols.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one protocol must be offered".into(),
            ));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid(
                "retry.initial_delay exceeds retry.max_delay".into(),
            ));
        }
        if self.outbound_buffer == 0 {
            return Err(ConfigError::Invalid("outbound_buffer must be positive".into()));
        }
        Ok(())
    }

    /// The configured access scope
    pub fn scope(&self) -> AccessScope {
        AccessScope::new(self.access_scope.clone())
    }

    #[must_use]
    pub fn with_access_scope(mut self, scope: impl Into<String>) -> Self {
        self.access_scope = scope.into();
        self
    }

    #[must_use]
    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = Some(max_attempts);
        self
    }

    #[must_use]
    pub fn with_retry_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.retry.initial_delay = initial;
        self.retry.max_delay = max;
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}
