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

//! A live session against one upstream backend.
//!
//! Wraps a transport with the MCP client handshake and the typed calls the
//! relay forwards. Forwarded results are returned as raw JSON so the relay
//! can hand them to the downstream client verbatim.

use serde_json::json;
use std::collections::HashMap;
use tracing::debug;

use crate::mcp::protocol::{
    InitializeResult, ListPromptsResult, ListResourcesResult, ListToolsResult, Prompt, Resource,
    ServerCapabilities, Tool, MCP_PROTOCOL_VERSION, NOTIFICATION_INITIALIZED,
};
use crate::mcp::upstream::{TransportError, UpstreamTransport};

/// A connected backend with its capability snapshot.
pub struct BackendSession {
    name: String,
    transport: Box<dyn UpstreamTransport>,
    capabilities: parking_lot::RwLock<ServerCapabilities>,
}

impl std::fmt::Debug for BackendSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSession")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl BackendSession {
    pub fn new(name: impl Into<String>, transport: Box<dyn UpstreamTransport>) -> Self {
        Self {
            name: name.into(),
            transport,
            capabilities: parking_lot::RwLock::new(ServerCapabilities::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capability snapshot recorded at initialize time.
    pub fn capabilities(&self) -> ServerCapabilities {
        self.capabilities.read().clone()
    }

    /// Perform the MCP initialize exchange and record advertised capabilities.
    pub async fn initialize(&self) -> Result<ServerCapabilities, TransportError> {
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self.transport.request("initialize", Some(params)).await?;
        let parsed: InitializeResult = serde_json::from_value(result)?;
        self.transport.notify(NOTIFICATION_INITIALIZED, None).await?;

        debug!(
            backend = %self.name,
            tools = parsed.capabilities.has_tools(),
            prompts = parsed.capabilities.has_prompts(),
            resources = parsed.capabilities.has_resources(),
            "backend initialized"
        );
        *self.capabilities.write() = parsed.capabilities.clone();
        Ok(parsed.capabilities)
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>, TransportError> {
        let result = self.transport.request("tools/list", None).await?;
        let parsed: ListToolsResult = serde_json::from_value(result)?;
        Ok(parsed.tools)
    }

    /// Forward a tool call. The backend's result object is returned verbatim.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: HashMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value, TransportError> {
        let params = json!({ "name": tool, "arguments": arguments });
        self.transport.request("tools/call", Some(params)).await
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>, TransportError> {
        let result = self.transport.request("prompts/list", None).await?;
        let parsed: ListPromptsResult = serde_json::from_value(result)?;
        Ok(parsed.prompts)
    }

    pub async fn get_prompt(
        &self,
        prompt: &str,
        arguments: HashMap<String, String>,
    ) -> Result<serde_json::Value, TransportError> {
        let params = json!({ "name": prompt, "arguments": arguments });
        self.transport.request("prompts/get", Some(params)).await
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>, TransportError> {
        let result = self.transport.request("resources/list", None).await?;
        let parsed: ListResourcesResult = serde_json::from_value(result)?;
        Ok(parsed.resources)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<serde_json::Value, TransportError> {
        let params = json!({ "uri": uri });
        self.transport.request("resources/read", Some(params)).await
    }

    /// Best-effort logging level propagation.
    pub async fn set_logging_level(&self, level: &str) -> Result<(), TransportError> {
        let params = json!({ "level": level });
        self.transport.request("logging/setLevel", Some(params)).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}
