// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Error taxonomy for the relay.
//!
//! Backend-origin failures are surfaced to the downstream client as MCP
//! error results (`isError: true`), never as protocol-level errors. Only a
//! failure of the downstream transport itself is fatal to a session.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the relay core.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The qualified name referenced a backend that is neither live nor pending.
    #[error("unknown backend: '{0}'")]
    UnknownBackend(String),

    /// The tool exists but is disabled or stale in the control document.
    #[error("tool '{0}' is hidden by policy")]
    ToolHidden(String),

    /// Opening the backend exceeded the configured connection timeout.
    #[error("timed out opening backend '{name}' after {timeout:?}")]
    OpenTimeout { name: String, timeout: Duration },

    /// A forwarded request failed at the transport layer.
    #[error("transport failure on backend '{name}': {reason}")]
    TransportFailed { name: String, reason: String },

    /// The control document exists but cannot be parsed or validated.
    #[error("control document is corrupt: {0}")]
    ConfigCorrupt(String),

    /// The control document could not be written; in-memory state stands.
    #[error("control document is unwritable: {0}")]
    ConfigUnwritable(String),

    /// The backend URL resolves to a private, loopback, or link-local address.
    #[error("url '{url}' resolves to blocked address {ip}")]
    SsrfBlocked { url: String, ip: String },

    /// The backend command is not in the allowed command set.
    #[error("command '{0}' is not in the allowed command set")]
    CommandRejected(String),

    /// Backend names must not contain the namespace separator.
    #[error("backend name '{0}' contains the reserved separator '::'")]
    InvalidName(String),

    /// The backend config declares neither a command nor a URL (or both).
    #[error("backend '{0}' must declare exactly one of command or url")]
    InvalidBackendConfig(String),
}

impl RelayError {
    /// Whether a retry of the failing operation can possibly succeed.
    /// SSRF and allowlist rejections are permanent for a given config.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            RelayError::SsrfBlocked { .. }
                | RelayError::CommandRejected(_)
                | RelayError::InvalidName(_)
                | RelayError::InvalidBackendConfig(_)
        )
    }
}
