use thiserror::Error;

/// Top-level error type for the `docsync-api` crate.
///
/// Covers every failure mode across both surfaces: the HTTP API and the
/// push-event channel. `docsync-core` maps these into its user-facing
/// taxonomy; consumers of that crate never see raw status codes.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// The session token was rejected by the server.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// The session has expired (token revoked or timed out).
    #[error("Session expired -- re-authentication required")]
    SessionExpired,

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── API ─────────────────────────────────────────────────────────
    /// Structured error from the API (parsed from the `{error}` envelope).
    #[error("API error (HTTP {status}): {message}")]
    Api {
        message: String,
        /// The API-specific error code (e.g., "chat.title.too-long").
        code: Option<String>,
        status: u16,
    },

    // ── Push channel ────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("Push channel connection failed: {0}")]
    ChannelConnect(String),

    /// WebSocket closed unexpectedly.
    #[error("Push channel closed (code {code}): {reason}")]
    ChannelClosed { code: u16, reason: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this error indicates auth has expired
    /// and re-authentication might resolve it.
    pub fn is_auth_expired(&self) -> bool {
        match self {
            Self::Authentication { .. } | Self::SessionExpired => true,
            Self::Api { status, .. } => matches!(status, 401 | 403),
            _ => false,
        }
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } => true,
            Self::ChannelConnect(_) => true,
            Self::Api { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            _ => false,
        }
    }

    /// Returns `true` if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Transport(e) => e.status() == Some(reqwest::StatusCode::NOT_FOUND),
            Self::Api { status: 404, .. } => true,
            _ => false,
        }
    }

    /// Extract the API error code, if available.
    pub fn api_error_code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}
