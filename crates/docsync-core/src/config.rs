// ── Runtime session configuration ──
//
// Describes how to reach the service and how the cache should behave.
// Carries the session token and tuning knobs, but never touches disk --
// `docsync-config` loads files and hands a `SessionConfig` in.

use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use docsync_api::ReconnectConfig;

use crate::error::SyncError;

/// Connection and cache tuning for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// API base URL, e.g. `https://api.docsync.example/`.
    pub base_url: Url,

    /// Session token minted by the auth flow above this layer.
    pub token: SecretString,

    /// Age after which cached data is refetched on subscription.
    pub stale_after: Duration,

    /// Per-request HTTP timeout.
    pub request_timeout: Duration,

    /// Whether to maintain the push channel. Disabled, the cache still
    /// works but only converges through fetches.
    pub push_enabled: bool,

    /// Push channel reconnection policy.
    pub reconnect: ReconnectConfig,
}

impl SessionConfig {
    pub fn new(base_url: Url, token: SecretString) -> Self {
        Self {
            base_url,
            token,
            stale_after: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            push_enabled: true,
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Derive the push endpoint from the API base URL
    /// (`https://host/v1/events` becomes `wss://host/v1/events`).
    pub fn push_url(&self) -> Result<Url, SyncError> {
        let mut url = self
            .base_url
            .join("v1/events")
            .map_err(|e| SyncError::Config {
                message: format!("invalid base URL: {e}"),
            })?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|()| SyncError::Config {
            message: format!("cannot derive push URL from {}", self.base_url),
        })?;
        Ok(url)
    }
}
