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

//! Opaque audit sink.
//!
//! The core emits events here without knowing what happens to them. The
//! default sink writes structured log records; a no-op sink exists for
//! tests. Recording never suspends and never fails.

use tracing::{info, warn};

/// Events the relay core emits.
#[derive(Debug, Clone)]
pub enum AuditEvent {
    ToolCall { tool: String, backend: String },
    ToolFailure {
        tool: String,
        backend: String,
        error: String,
    },
    BackendConnected { backend: String },
    BackendDisconnected { backend: String },
    BackendAdded { backend: String },
    BackendRemoved { backend: String },
}

/// Consumer of audit events. Implementations must be non-blocking.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Default sink: structured records on the `audit` target.
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, event: AuditEvent) {
        match event {
            AuditEvent::ToolCall { tool, backend } => {
                info!(target: "audit", tool = %tool, backend = %backend, "tool call");
            }
            AuditEvent::ToolFailure {
                tool,
                backend,
                error,
            } => {
                warn!(target: "audit", tool = %tool, backend = %backend, error = %error, "tool failure");
            }
            AuditEvent::BackendConnected { backend } => {
                info!(target: "audit", backend = %backend, "backend connected");
            }
            AuditEvent::BackendDisconnected { backend } => {
                info!(target: "audit", backend = %backend, "backend disconnected");
            }
            AuditEvent::BackendAdded { backend } => {
                info!(target: "audit", backend = %backend, "backend added");
            }
            AuditEvent::BackendRemoved { backend } => {
                info!(target: "audit", backend = %backend, "backend removed");
            }
        }
    }
}

/// Discards everything. Useful in tests.
pub struct NullAudit;

impl AuditSink for NullAudit {
    fn record(&self, _event: AuditEvent) {}
}
