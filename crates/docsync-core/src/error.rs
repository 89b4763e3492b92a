// ── Engine error types ──
//
// User-facing errors from docsync-core. These are NOT transport
// errors -- consumers never see HTTP status codes or JSON parse
// failures directly. The `From<docsync_api::Error>` impl translates
// transport failures into the retry-relevant categories below.

use thiserror::Error;

/// Unified error type for the sync engine.
///
/// The variant is the error *kind* the UI branches on (retry offered
/// for transient kinds, not for rejected input); the display string is
/// the human-readable message shown next to the reverted change.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Transient transport failure. Retrying may succeed.
    #[error("network error: {message}")]
    Network { message: String },

    /// The server rejected the request. Retrying without changing the
    /// input will fail again.
    #[error("request rejected: {message}")]
    Validation { message: String },

    /// The session is no longer valid. Recovery (re-login) happens
    /// above this layer.
    #[error("session invalid: {message}")]
    Auth { message: String },

    /// Server state diverged from the local assumption (e.g. the entity
    /// was deleted elsewhere while an edit was in flight).
    #[error("state conflict: {message}")]
    Conflict { message: String },

    /// The request timed out. Treated like a network failure for retry
    /// purposes.
    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Bad configuration (unparseable URL, missing credentials).
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Anything that indicates a bug rather than an environmental
    /// failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Short stable name of the error kind, for logs and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Validation { .. } => "validation",
            Self::Auth { .. } => "auth",
            Self::Conflict { .. } => "conflict",
            Self::Timeout { .. } => "timeout",
            Self::Config { .. } => "config",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether retrying the same operation unchanged could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<docsync_api::Error> for SyncError {
    fn from(err: docsync_api::Error) -> Self {
        match err {
            docsync_api::Error::Authentication { message } => SyncError::Auth { message },
            docsync_api::Error::SessionExpired => SyncError::Auth {
                message: "session expired -- sign in again".into(),
            },
            docsync_api::Error::Transport(ref e) => {
                if e.is_timeout() {
                    SyncError::Timeout { seconds: 0 }
                } else {
                    SyncError::Network {
                        message: e.to_string(),
                    }
                }
            }
            docsync_api::Error::InvalidUrl(e) => SyncError::Config {
                message: format!("invalid URL: {e}"),
            },
            docsync_api::Error::Timeout { timeout_secs } => SyncError::Timeout {
                seconds: timeout_secs,
            },
            docsync_api::Error::Api {
                message,
                code,
                status,
            } => match status {
                400 | 422 => SyncError::Validation { message },
                401 | 403 => SyncError::Auth { message },
                404 | 409 | 410 | 412 => SyncError::Conflict { message },
                _ => SyncError::Network {
                    message: match code {
                        Some(code) => format!("{message} ({code})"),
                        None => message,
                    },
                },
            },
            docsync_api::Error::ChannelConnect(reason) => SyncError::Network {
                message: format!("push channel unavailable: {reason}"),
            },
            docsync_api::Error::ChannelClosed { code, reason } => SyncError::Network {
                message: format!("push channel closed (code {code}): {reason}"),
            },
            docsync_api::Error::Deserialization { message, body: _ } => {
                SyncError::Internal(format!("deserialization error: {message}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(status: u16) -> docsync_api::Error {
        docsync_api::Error::Api {
            message: "boom".into(),
            code: None,
            status,
        }
    }

    #[test]
    fn validation_statuses_are_not_retryable() {
        for status in [400, 422] {
            let err = SyncError::from(api_error(status));
            assert_eq!(err.kind(), "validation");
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn auth_statuses_map_to_auth() {
        for status in [401, 403] {
            assert_eq!(SyncError::from(api_error(status)).kind(), "auth");
        }
    }

    #[test]
    fn gone_and_conflict_map_to_conflict() {
        for status in [404, 409, 410] {
            assert_eq!(SyncError::from(api_error(status)).kind(), "conflict");
        }
    }

    #[test]
    fn server_errors_are_retryable() {
        let err = SyncError::from(api_error(503));
        assert_eq!(err.kind(), "network");
        assert!(err.is_retryable());
    }

    #[test]
    fn timeout_is_retryable() {
        let err = SyncError::from(docsync_api::Error::Timeout { timeout_secs: 30 });
        assert_eq!(err.kind(), "timeout");
        assert!(err.is_retryable());
    }
}
