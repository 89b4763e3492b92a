// Shared transport configuration for building reqwest::Client instances.
//
// The API client injects the session token as a default `Authorization`
// header so individual request helpers never handle credentials.

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("docsync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, crate::error::Error> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .build()
            .map_err(crate::error::Error::Transport)
    }

    /// Build a `reqwest::Client` that sends `Authorization: Bearer <token>`
    /// on every request.
    pub fn build_client_with_token(
        &self,
        token: &SecretString,
    ) -> Result<reqwest::Client, crate::error::Error> {
        let mut headers = HeaderMap::new();
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
            .map_err(|e| crate::error::Error::Authentication {
                message: format!("session token is not a valid header value: {e}"),
            })?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);

        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .default_headers(headers)
            .build()
            .map_err(crate::error::Error::Transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_transport_config() {
        let config = TransportConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(config.user_agent.starts_with("docsync/"));
    }

    #[test]
    fn builds_client_with_token() {
        let token: SecretString = "tok-123".to_string().into();
        let client = TransportConfig::default().build_client_with_token(&token);
        assert!(client.is_ok());
    }

    #[test]
    fn rejects_token_with_control_characters() {
        let token: SecretString = "bad\ntoken".to_string().into();
        let result = TransportConfig::default().build_client_with_token(&token);
        assert!(matches!(
            result,
            Err(crate::error::Error::Authentication { .. })
        ));
    }
}
