//! Access scope and bearer token types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Capability class a token must grant (e.g. `connect`, `manage`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessScope(String);

impl AccessScope {
    pub const CONNECT: &'static str = "connect";
    pub const HOST: &'static str = "host";
    pub const MANAGE: &'static str = "manage";

    pub fn new(scope: impl Into<String>) -> Self {
        Self(scope.into())
    }

    /// The scope needed by clients connecting to a tunnel
    pub fn connect() -> Self {
        Self::new(Self::CONNECT)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AccessScope {
    fn default() -> Self {
        Self::connect()
    }
}

impl fmt::Display for AccessScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque bearer token with optional expiry
///
/// The token value is never interpreted. Expiry is whatever the issuer
/// reported; a token without one is treated as valid until the service
/// rejects it.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at: None,
        }
    }

    /// Set the expiry reported by the issuer
    #[must_use]
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Returns true if the token is known to be expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
