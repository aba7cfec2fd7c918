//! TOML configuration for runwatch.
//!
//! Every section falls back to defaults, so an empty file (or no file at all)
//! is a valid configuration pointing at a local backend.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::ws::derive_ws_url;
use crate::channel;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "RUNWATCH_CONFIG";
/// Environment variable overriding `backend.token`.
pub const TOKEN_ENV: &str = "RUNWATCH_TOKEN";
/// Looked up in the working directory when nothing else is given.
pub const LOCAL_CONFIG: &str = "runwatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunwatchConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RunwatchConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded runwatch configuration");
        Ok(config)
    }

    /// Resolve configuration in order:
    /// 1. `explicit` (from `--config`); failing to load it is an error.
    /// 2. The path in `RUNWATCH_CONFIG`.
    /// 3. `./runwatch.toml`.
    /// 4. Compiled-in defaults.
    ///
    /// `RUNWATCH_TOKEN` then overrides the backend token.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = Self::resolve_from(explicit, env_path.as_deref(), Path::new(LOCAL_CONFIG))?;
        config.apply_token_override(std::env::var(TOKEN_ENV).ok());
        Ok(config)
    }

    fn resolve_from(explicit: Option<&Path>, env_path: Option<&Path>, local: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Some(path) = env_path {
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "RUNWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }
        Ok(Self::load_or_default(local))
    }

    /// Load `path` if it exists, otherwise defaults. A file that exists but
    /// does not parse is logged and ignored.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }
        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    fn apply_token_override(&mut self, token: Option<String>) {
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            self.backend.token = Some(token);
        }
    }

    /// Socket base URL: the configured one, or derived from `base_url`.
    pub fn ws_url(&self) -> Result<String> {
        match &self.backend.ws_url {
            Some(url) => Ok(url.clone()),
            None => derive_ws_url(&self.backend.base_url)
                .with_context(|| format!("cannot derive socket URL from {}", self.backend.base_url)),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.channel.connect_timeout_ms)
    }

    pub fn channel_config(&self) -> channel::ChannelConfig {
        channel::ChannelConfig {
            poll_interval: Duration::from_millis(self.channel.poll_interval_ms.max(1)),
            final_sync: self.channel.final_sync,
        }
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// HTTP API base, e.g. `https://dash.example.com`.
    pub base_url: String,
    /// Push channel base. Derived from `base_url` when unset.
    pub ws_url: Option<String>,
    /// Bearer token for HTTP and the socket query string.
    pub token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            ws_url: None,
            token: None,
            request_timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub poll_interval_ms: u64,
    pub connect_timeout_ms: u64,
    /// One last steps fetch after the push channel reports completion.
    pub final_sync: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            connect_timeout_ms: 10_000,
            final_sync: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
