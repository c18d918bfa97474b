//! Client configuration.
//!
//! Settings come from three places, later ones overriding earlier ones:
//! built-in defaults, an optional JSON file ([`ClientConfig::load`]), and the
//! environment ([`ClientConfig::from_env`]).

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ipc::{default_path, DEFAULT_MAX_PAYLOAD};

/// Address override, e.g. `unix:///run/user/1000/xmms-ipc-1000`.
pub const PATH_ENV: &str = "XMMS_PATH";

/// Payload ceiling override in bytes.
pub const MAX_PAYLOAD_ENV: &str = "XMMSV_MAX_PAYLOAD";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address. `None` resolves through [`default_path`].
    pub path: Option<String>,
    /// Largest payload accepted from or sent to the server.
    pub max_payload_len: u32,
    /// Name reported in logs for this client.
    pub client_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_payload_len: DEFAULT_MAX_PAYLOAD,
            client_name: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `XMMS_PATH` and `XMMSV_MAX_PAYLOAD`.
    ///
    /// An unparsable payload ceiling is ignored with a warning.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Read a JSON config file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Apply environment overrides on top of `self`.
    pub fn with_env(mut self) -> Self {
        if let Some(path) = std::env::var(PATH_ENV).ok().filter(|p| !p.is_empty()) {
            self.path = Some(path);
        }
        if let Ok(raw) = std::env::var(MAX_PAYLOAD_ENV) {
            match raw.trim().parse() {
                Ok(max) => self.max_payload_len = max,
                Err(_) => tracing::warn!("Ignoring invalid {}={:?}", MAX_PAYLOAD_ENV, raw),
            }
        }
        self
    }

    /// The address to connect to.
    pub fn address(&self) -> String {
        self.path.clone().unwrap_or_else(default_path)
    }
}
