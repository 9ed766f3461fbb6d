// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Relay process settings: downstream transport, admin auth, backend tuning.
//!
//! Distinct from the control *document* (`document.rs`): these settings shape
//! the process, the document shapes the backend fleet. Priority is
//! file < environment < CLI flags.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Downstream transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Stdio,
    Http,
}

impl std::str::FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" => Ok(TransportMode::Stdio),
            "http" | "sse" => Ok(TransportMode::Http),
            other => Err(format!("unsupported transport: {}", other)),
        }
    }
}

/// Relay configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RelaySettings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub backends: BackendSettings,
    #[serde(default)]
    pub document: DocumentSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    #[serde(default)]
    pub transport: TransportMode,

    /// HTTP listen host (HTTP transport only).
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP listen port (HTTP transport only).
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthSettings {
    /// Bearer token guarding the HTTP surface. None disables the check.
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendSettings {
    /// Bound on a single backend open, handshake included.
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,

    /// Global cap on concurrent opens.
    #[serde(default = "default_max_concurrent_opens")]
    pub max_concurrent_opens: usize,

    /// Idle reaper pass interval.
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,

    /// Pinned-backend watchdog pass interval.
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DocumentSettings {
    /// Control document path. Defaults to the user config dir.
    pub path: Option<PathBuf>,

    /// JSON client config imported on first run (empty document only).
    pub import: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8085
}

fn default_open_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent_opens() -> usize {
    8
}

fn default_reap_interval_secs() -> u64 {
    60
}

fn default_watchdog_interval_secs() -> u64 {
    30
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            transport: TransportMode::Stdio,
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            open_timeout_secs: default_open_timeout_secs(),
            max_concurrent_opens: default_max_concurrent_opens(),
            reap_interval_secs: default_reap_interval_secs(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
        }
    }
}

impl BackendSettings {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }
}

impl RelaySettings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Apply environment overrides.
    ///
    /// Supported variables:
    /// - MCP_RELAY_TRANSPORT: stdio | http
    /// - MCP_RELAY_HOST / MCP_RELAY_PORT: HTTP listen address
    /// - MCP_RELAY_API_KEY: bearer token for the HTTP surface
    /// - MCP_RELAY_DOCUMENT: control document path
    /// - MCP_RELAY_OPEN_TIMEOUT: backend open timeout in seconds
    pub fn merge_env(mut self) -> Self {
        if let Ok(transport) = std::env::var("MCP_RELAY_TRANSPORT") {
            if let Ok(mode) = transport.parse() {
                self.server.transport = mode;
            }
        }
        if let Ok(host) = std::env::var("MCP_RELAY_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("MCP_RELAY_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(key) = std::env::var("MCP_RELAY_API_KEY") {
            if !key.is_empty() {
                self.auth.api_key = Some(key);
            }
        }
        if let Ok(path) = std::env::var("MCP_RELAY_DOCUMENT") {
            self.document.path = Some(PathBuf::from(path));
        }
        if let Ok(timeout) = std::env::var("MCP_RELAY_OPEN_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.backends.open_timeout_secs = secs;
            }
        }
        self
    }

    /// Load with priority: file < env.
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let settings = match config_file {
            Some(path) if path.exists() => {
                tracing::info!("loading settings from {:?}", path);
                Self::from_file(&path)?
            }
            Some(path) => {
                tracing::warn!("settings file not found: {:?}, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };
        Ok(settings.merge_env())
    }

    /// Parse the HTTP listen address.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.server.host, self.server.port).parse()?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.server.transport == TransportMode::Http {
            self.socket_addr()?;
        }
        if self.backends.max_concurrent_opens == 0 {
            anyhow::bail!("max_concurrent_opens must be at least 1");
        }
        if self.backends.open_timeout_secs == 0 {
            anyhow::bail!("open_timeout_secs must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = RelaySettings::default();
        assert_eq!(settings.server.transport, TransportMode::Stdio);
        assert_eq!(settings.server.port, 8085);
        assert_eq!(settings.backends.open_timeout_secs, 30);
        assert_eq!(settings.backends.max_concurrent_opens, 8);
        assert!(settings.auth.api_key.is_none());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_transport_parse() {
        assert_eq!("stdio".parse::<TransportMode>().unwrap(), TransportMode::Stdio);
        assert_eq!("HTTP".parse::<TransportMode>().unwrap(), TransportMode::Http);
        assert!("websocket".parse::<TransportMode>().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml_str = r#"
[server]
transport = "http"
host = "0.0.0.0"
port = 9000

[auth]
api_key = "sekrit"

[backends]
open_timeout_secs = 10
"#;
        let settings: RelaySettings = toml::from_str(toml_str).unwrap();
        assert_eq!(settings.server.transport, TransportMode::Http);
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.auth.api_key.as_deref(), Some("sekrit"));
        assert_eq!(settings.backends.open_timeout_secs, 10);
        // Unspecified sections fall back to defaults.
        assert_eq!(settings.backends.max_concurrent_opens, 8);
    }

    #[test]
    fn test_validation_rejects_zero_bounds() {
        let mut settings = RelaySettings::default();
        settings.backends.max_concurrent_opens = 0;
        assert!(settings.validate().is_err());
    }
}
