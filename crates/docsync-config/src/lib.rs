//! Shared configuration for Docsync clients.
//!
//! TOML profiles layered with environment overrides, credential
//! resolution (env var indirection preferred over plaintext), and
//! translation into `docsync_core::SessionConfig`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use docsync_core::SessionConfig;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no session token configured for profile '{profile}'")]
    NoCredentials { profile: String },

    #[error("unknown profile '{profile}'")]
    UnknownProfile { profile: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Default profile name.
    pub default_profile: Option<String>,

    /// Global defaults.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named service profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    /// HTTP request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Cached data older than this (seconds) is refetched on
    /// subscription.
    #[serde(default = "default_stale_after")]
    pub stale_after: u64,

    /// Whether to maintain the push channel.
    #[serde(default = "default_push")]
    pub push: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            stale_after: default_stale_after(),
            push: default_push(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}
fn default_stale_after() -> u64 {
    30
}
fn default_push() -> bool {
    true
}

/// A named service profile.
#[derive(Debug, Deserialize, Serialize)]
pub struct Profile {
    /// API base URL (e.g., "https://api.docsync.example").
    pub api_url: String,

    /// Session token (plaintext -- prefer `token_env`).
    pub token: Option<String>,

    /// Environment variable name containing the session token.
    pub token_env: Option<String>,

    /// Override timeout for this profile.
    pub timeout: Option<u64>,

    /// Override staleness threshold for this profile.
    pub stale_after: Option<u64>,

    /// Override push channel setting for this profile.
    pub push: Option<bool>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "docsync", "docsync").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("docsync");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load the full Config from an explicit file + environment.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("DOCSYNC_").split("_"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if the file doesn't exist.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(&path, toml_str)?;
    Ok(())
}

// ── Credential resolution ───────────────────────────────────────────

/// Resolve the session token for a profile.
///
/// Precedence: `token_env` indirection, then plaintext `token`.
pub fn resolve_token(profile: &Profile, profile_name: &str) -> Result<SecretString, ConfigError> {
    if let Some(ref env_name) = profile.token_env {
        if let Ok(val) = std::env::var(env_name) {
            return Ok(SecretString::from(val));
        }
    }

    if let Some(ref token) = profile.token {
        return Ok(SecretString::from(token.clone()));
    }

    Err(ConfigError::NoCredentials {
        profile: profile_name.into(),
    })
}

// ── Translation to runtime config ───────────────────────────────────

/// Build a `SessionConfig` from a named profile.
pub fn profile_to_session_config(
    config: &Config,
    profile_name: &str,
) -> Result<SessionConfig, ConfigError> {
    let profile =
        config
            .profiles
            .get(profile_name)
            .ok_or_else(|| ConfigError::UnknownProfile {
                profile: profile_name.into(),
            })?;

    let base_url: url::Url = profile.api_url.parse().map_err(|_| ConfigError::Validation {
        field: "api_url".into(),
        reason: format!("invalid URL: {}", profile.api_url),
    })?;

    let token = resolve_token(profile, profile_name)?;

    let mut session = SessionConfig::new(base_url, token);
    session.request_timeout =
        Duration::from_secs(profile.timeout.unwrap_or(config.defaults.timeout));
    session.stale_after =
        Duration::from_secs(profile.stale_after.unwrap_or(config.defaults.stale_after));
    session.push_enabled = profile.push.unwrap_or(config.defaults.push);

    Ok(session)
}

/// Build a `SessionConfig` for the default profile.
pub fn default_session_config(config: &Config) -> Result<SessionConfig, ConfigError> {
    let name = config
        .default_profile
        .clone()
        .unwrap_or_else(|| "default".into());
    profile_to_session_config(config, &name)
}
