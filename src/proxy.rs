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

//! The aggregated MCP surface.
//!
//! One server facing the downstream client, many backends behind it. Requests
//! are routed by qualified name (`B::t`), the exposed tool set is filtered by
//! the control document's enable/stale policy, and membership changes emit
//! `list_changed` notifications per capability.
//!
//! Backend-origin failures come back as MCP error results (`isError: true`),
//! never as protocol-level errors.

use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::discovery::SweepOutcome;
use crate::document::{
    qualify_name, split_qualified, BackendConfig, Document, DocumentStore, NAMESPACE_SEPARATOR,
};
use crate::error::RelayError;
use crate::manager::BackendManager;
use crate::mcp::client::BackendSession;
use crate::mcp::protocol::*;
use crate::merge;
use crate::retrieval::{build_retriever, RetrievalContext, ToolRetriever};

/// Channel end used to push notifications at the downstream session.
pub type NotificationSender = mpsc::UnboundedSender<JsonRpcNotification>;

/// The relay's proxy core.
pub struct RelayProxy {
    manager: Arc<BackendManager>,
    store: DocumentStore,
    document: parking_lot::RwLock<Document>,
    /// Capability snapshot per backend, recorded at initialize time.
    capabilities: parking_lot::RwLock<HashMap<String, ServerCapabilities>>,
    /// Live tool metadata by qualified name. Falls back to the document's
    /// cached descriptions when a backend has not connected yet.
    tool_schemas: parking_lot::RwLock<HashMap<String, Tool>>,
    /// Qualified prompt name to owning backend.
    prompt_index: parking_lot::RwLock<HashMap<String, String>>,
    /// Raw resource URI to owning backend. URIs are never rewritten.
    resource_index: parking_lot::RwLock<HashMap<String, String>>,
    /// Downstream session handle: written at run-start, cleared at run-end.
    downstream: parking_lot::RwLock<Option<NotificationSender>>,
    /// Session fingerprint fed to the retrieval extension.
    fingerprint: parking_lot::RwLock<String>,
    retriever: Arc<dyn ToolRetriever>,
    audit: Arc<dyn AuditSink>,
    /// Coarse lock serializing membership changes.
    registration: tokio::sync::Mutex<()>,
}

impl RelayProxy {
    pub fn new(
        manager: Arc<BackendManager>,
        store: DocumentStore,
        document: Document,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let retriever = build_retriever(document.retrieval.as_ref());
        Self {
            manager,
            store,
            document: parking_lot::RwLock::new(document),
            capabilities: parking_lot::RwLock::new(HashMap::new()),
            tool_schemas: parking_lot::RwLock::new(HashMap::new()),
            prompt_index: parking_lot::RwLock::new(HashMap::new()),
            resource_index: parking_lot::RwLock::new(HashMap::new()),
            downstream: parking_lot::RwLock::new(None),
            fingerprint: parking_lot::RwLock::new(String::new()),
            retriever,
            audit,
            registration: tokio::sync::Mutex::new(()),
        }
    }

    pub fn manager(&self) -> &Arc<BackendManager> {
        &self.manager
    }

    /// Fold a discovery sweep's findings into the runtime caches.
    pub fn absorb_sweep(&self, outcome: SweepOutcome) {
        self.capabilities.write().extend(outcome.capabilities);
        self.tool_schemas.write().extend(outcome.tool_schemas);
        self.prompt_index.write().extend(outcome.prompt_index);
        self.resource_index.write().extend(outcome.resource_index);
    }

    /// Snapshot of the current document.
    pub fn document(&self) -> Document {
        self.document.read().clone()
    }

    // =========================================================================
    // Downstream session handle & notifications
    // =========================================================================

    /// Capture the downstream session at run-start.
    pub fn set_downstream(&self, sender: NotificationSender) {
        *self.downstream.write() = Some(sender);
    }

    /// Clear the handle at run-end.
    pub fn clear_downstream(&self) {
        *self.downstream.write() = None;
    }

    /// Best-effort, non-blocking emission. Skipped when no session is live.
    fn emit(&self, method: &str) {
        let guard = self.downstream.read();
        match guard.as_ref() {
            Some(sender) => {
                if sender.send(JsonRpcNotification::new(method)).is_ok() {
                    debug!(method, "notification emitted");
                } else {
                    debug!(method, "downstream gone, notification dropped");
                }
            }
            None => debug!(method, "no downstream session, notification skipped"),
        }
    }

    /// Emit one `list_changed` per capability the backend advertises.
    fn notify_caps_changed(&self, capabilities: &ServerCapabilities) {
        if capabilities.has_tools() {
            self.emit(NOTIFICATION_TOOLS_LIST_CHANGED);
        }
        if capabilities.has_prompts() {
            self.emit(NOTIFICATION_PROMPTS_LIST_CHANGED);
        }
        if capabilities.has_resources() {
            self.emit(NOTIFICATION_RESOURCES_LIST_CHANGED);
        }
    }

    // =========================================================================
    // Request dispatch
    // =========================================================================

    /// Handle a JSON-RPC request from the downstream client.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        debug!(method = %request.method, "downstream request");

        match request.method.as_str() {
            "ping" => JsonRpcResponse::success(request.id, json!({})),
            "initialize" => self.handle_initialize(request.id, request.params),
            "tools/list" => self.handle_tools_list(request.id).await,
            "tools/call" => self.handle_tools_call(request.id, request.params).await,
            "prompts/list" => self.handle_prompts_list(request.id).await,
            "prompts/get" => self.handle_prompts_get(request.id, request.params).await,
            "resources/list" => self.handle_resources_list(request.id).await,
            "resources/read" => self.handle_resources_read(request.id, request.params).await,
            "logging/setLevel" => self.handle_set_level(request.id, request.params).await,
            _ => {
                warn!(method = %request.method, "unknown MCP method");
                JsonRpcResponse::error(request.id, JsonRpcError::method_not_found(&request.method))
            }
        }
    }

    /// Handle a notification from the downstream client.
    pub async fn handle_notification(&self, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            NOTIFICATION_INITIALIZED => debug!("downstream client initialized"),
            other => debug!(method = other, "downstream notification ignored"),
        }
    }

    fn handle_initialize(
        &self,
        id: JsonRpcId,
        params: Option<serde_json::Value>,
    ) -> JsonRpcResponse {
        let init_params: InitializeParams = match params {
            Some(p) => match serde_json::from_value(p) {
                Ok(params) => params,
                Err(e) => {
                    return JsonRpcResponse::error(
                        id,
                        JsonRpcError::invalid_params(format!("Invalid initialize params: {}", e)),
                    )
                }
            },
            None => {
                return JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_params("Missing initialize params"),
                )
            }
        };

        *self.fingerprint.write() = format!(
            "{} {}",
            init_params.client_info.name, init_params.client_info.version
        );

        let result = InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: self.union_capabilities(),
            server_info: ServerInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        JsonRpcResponse::success(id, serde_json::to_value(result).unwrap_or_default())
    }

    /// Union of capabilities across declared backends. A backend that has
    /// never connected counts as tool-capable: the document carries its tool
    /// inventory either way.
    fn union_capabilities(&self) -> ServerCapabilities {
        let document = self.document.read();
        let snapshots = self.capabilities.read();

        let mut tools = false;
        let mut prompts = false;
        let mut resources = false;
        for (name, _) in document.servers.iter() {
            match snapshots.get(name) {
                Some(caps) => {
                    tools |= caps.has_tools();
                    prompts |= caps.has_prompts();
                    resources |= caps.has_resources();
                }
                None => tools = true,
            }
        }

        ServerCapabilities {
            tools: tools.then_some(ToolsCapability { list_changed: true }),
            prompts: prompts.then_some(PromptsCapability { list_changed: true }),
            resources: resources.then_some(ResourcesCapability {
                subscribe: false,
                list_changed: true,
            }),
            logging: Some(LoggingCapability {}),
        }
    }

    // =========================================================================
    // Tools
    // =========================================================================

    /// The exposed tool surface: enabled-and-not-stale entries across all
    /// backends, in (backend insertion order, sorted tool name) order.
    fn exposed_tools(&self) -> Vec<Tool> {
        let document = self.document.read();
        let schemas = self.tool_schemas.read();
        let mut tools = Vec::new();

        for (backend, config) in document.servers.iter() {
            for (local, entry) in &config.tools {
                if !entry.enabled || entry.stale {
                    continue;
                }
                let qualified = qualify_name(backend, local);
                let tool = match schemas.get(&qualified) {
                    Some(live) => Tool {
                        name: qualified,
                        description: live.description.clone(),
                        input_schema: live.input_schema.clone(),
                    },
                    None => Tool {
                        name: qualified,
                        description: (!entry.description.is_empty())
                            .then(|| entry.description.clone()),
                        input_schema: empty_object_schema(),
                    },
                };
                tools.push(tool);
            }
        }
        tools
    }

    async fn handle_tools_list(&self, id: JsonRpcId) -> JsonRpcResponse {
        let candidates = self.exposed_tools();
        let context = RetrievalContext {
            fingerprint: self.fingerprint.read().clone(),
        };
        let tools = self
            .retriever
            .retrieve(&context, candidates)
            .await
            .into_iter()
            .map(|scored| scored.tool)
            .collect();

        let result = ListToolsResult {
            tools,
            next_cursor: None,
        };
        JsonRpcResponse::success(id, serde_json::to_value(result).unwrap_or_default())
    }

    async fn handle_tools_call(
        &self,
        id: JsonRpcId,
        params: Option<serde_json::Value>,
    ) -> JsonRpcResponse {
        let params: CallToolParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(params)) => params,
            Ok(None) => {
                return JsonRpcResponse::error(id, JsonRpcError::invalid_params("Missing params"))
            }
            Err(e) => {
                return JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_params(format!("Invalid call params: {}", e)),
                )
            }
        };

        match self.call_qualified_tool(&params.name, params.arguments).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => {
                info!(tool = %params.name, error = %e, "tool call rejected");
                error_result(id, e.to_string())
            }
        }
    }

    /// Resolve `B::t`, enforce policy, open the backend if needed, forward.
    async fn call_qualified_tool(
        &self,
        qualified: &str,
        arguments: HashMap<String, serde_json::Value>,
    ) -> Result<serde_json::Value, RelayError> {
        let Some((backend, local)) = split_qualified(qualified) else {
            return Err(RelayError::UnknownBackend(qualified.to_string()));
        };

        {
            let document = self.document.read();
            let Some(config) = document.servers.get(backend) else {
                return Err(RelayError::UnknownBackend(backend.to_string()));
            };
            // A tool the document has never seen is forwarded as-is: the
            // backend may expose tools discovery has not caught up with.
            if let Some(entry) = config.tools.get(local) {
                if !entry.enabled || entry.stale {
                    return Err(RelayError::ToolHidden(qualified.to_string()));
                }
            }
        }

        let was_live = self.manager.is_live(backend);
        let session = self.manager.get_or_open(backend).await?;
        self.manager.record_use(backend);

        if !was_live {
            // First call woke a lazy backend: refresh mappings and tell the
            // client the (possibly richer) tool metadata changed.
            self.refresh_backend(backend, &session).await;
            self.audit.record(AuditEvent::BackendConnected {
                backend: backend.to_string(),
            });
            self.emit(NOTIFICATION_TOOLS_LIST_CHANGED);
        }

        match session.call_tool(local, arguments).await {
            Ok(result) => {
                self.audit.record(AuditEvent::ToolCall {
                    tool: qualified.to_string(),
                    backend: backend.to_string(),
                });
                Ok(result)
            }
            Err(e) => {
                self.audit.record(AuditEvent::ToolFailure {
                    tool: qualified.to_string(),
                    backend: backend.to_string(),
                    error: e.to_string(),
                });
                // Drop the broken session; the next request reopens.
                self.manager.close(backend).await;
                Err(RelayError::TransportFailed {
                    name: backend.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    // =========================================================================
    // Prompts
    // =========================================================================

    async fn handle_prompts_list(&self, id: JsonRpcId) -> JsonRpcResponse {
        let mut prompts = Vec::new();
        for (name, session) in self.live_in_document_order() {
            if !session.capabilities().has_prompts() {
                continue;
            }
            match session.list_prompts().await {
                Ok(list) => {
                    for mut prompt in list {
                        prompt.name = qualify_name(&name, &prompt.name);
                        prompts.push(prompt);
                    }
                }
                Err(e) => warn!(backend = %name, error = %e, "prompts/list failed"),
            }
        }

        let result = ListPromptsResult {
            prompts,
            next_cursor: None,
        };
        JsonRpcResponse::success(id, serde_json::to_value(result).unwrap_or_default())
    }

    async fn handle_prompts_get(
        &self,
        id: JsonRpcId,
        params: Option<serde_json::Value>,
    ) -> JsonRpcResponse {
        let params: GetPromptParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(params)) => params,
            _ => return JsonRpcResponse::error(id, JsonRpcError::invalid_params("Invalid params")),
        };

        let backend = self.prompt_index.read().get(&params.name).cloned();
        let backend = match backend {
            Some(backend) => backend,
            None => return error_result(id, format!("Prompt '{}' not found", params.name)),
        };

        let local = split_qualified(&params.name)
            .map(|(_, local)| local.to_string())
            .unwrap_or_else(|| params.name.clone());

        match self.manager.get_or_open(&backend).await {
            Ok(session) => {
                self.manager.record_use(&backend);
                match session.get_prompt(&local, params.arguments).await {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(e) => {
                        warn!(backend = %backend, prompt = %params.name, error = %e, "prompts/get failed");
                        error_result(id, format!("Prompt '{}' failed: {}", params.name, e))
                    }
                }
            }
            Err(e) => error_result(id, e.to_string()),
        }
    }

    // =========================================================================
    // Resources
    // =========================================================================

    async fn handle_resources_list(&self, id: JsonRpcId) -> JsonRpcResponse {
        let mut resources = Vec::new();
        for (name, session) in self.live_in_document_order() {
            if !session.capabilities().has_resources() {
                continue;
            }
            match session.list_resources().await {
                Ok(mut list) => resources.append(&mut list),
                Err(e) => warn!(backend = %name, error = %e, "resources/list failed"),
            }
        }

        let result = ListResourcesResult {
            resources,
            next_cursor: None,
        };
        JsonRpcResponse::success(id, serde_json::to_value(result).unwrap_or_default())
    }

    async fn handle_resources_read(
        &self,
        id: JsonRpcId,
        params: Option<serde_json::Value>,
    ) -> JsonRpcResponse {
        let params: ReadResourceParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(params)) => params,
            _ => return JsonRpcResponse::error(id, JsonRpcError::invalid_params("Invalid params")),
        };

        let backend = self.resource_index.read().get(&params.uri).cloned();
        let backend = match backend {
            Some(backend) => backend,
            None => return error_result(id, format!("Resource '{}' not found", params.uri)),
        };

        match self.manager.get_or_open(&backend).await {
            Ok(session) => {
                self.manager.record_use(&backend);
                match session.read_resource(&params.uri).await {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(e) => {
                        warn!(backend = %backend, uri = %params.uri, error = %e, "resources/read failed");
                        error_result(id, format!("Resource '{}' failed: {}", params.uri, e))
                    }
                }
            }
            Err(e) => error_result(id, e.to_string()),
        }
    }

    // =========================================================================
    // Logging
    // =========================================================================

    async fn handle_set_level(
        &self,
        id: JsonRpcId,
        params: Option<serde_json::Value>,
    ) -> JsonRpcResponse {
        let params: SetLevelParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(params)) => params,
            _ => return JsonRpcResponse::error(id, JsonRpcError::invalid_params("Invalid params")),
        };

        // Best-effort broadcast to every live backend.
        for (name, session) in self.manager.live_sessions() {
            if let Err(e) = session.set_logging_level(&params.level).await {
                debug!(backend = %name, error = %e, "setLevel not accepted");
            }
        }
        JsonRpcResponse::success(id, json!({}))
    }

    // =========================================================================
    // Dynamic membership
    // =========================================================================

    /// Add a backend at runtime. The connect is attempted eagerly; failure
    /// degrades to pending so the first call can retry, except for permanent
    /// rejections (SSRF, command allowlist), which undo the registration.
    pub async fn register_backend(
        &self,
        name: &str,
        config: BackendConfig,
    ) -> Result<bool, RelayError> {
        config.validate(name)?;
        let _guard = self.registration.lock().await;

        self.manager.register(name, config.clone())?;
        self.document.write().servers.insert(name.to_string(), config);

        let connected = match self.manager.get_or_open(name).await {
            Ok(session) => {
                self.refresh_backend(name, &session).await;
                true
            }
            Err(e) if e.is_permanent() => {
                self.manager.remove(name).await;
                self.document.write().servers.remove(name);
                return Err(e);
            }
            Err(e) => {
                warn!(backend = name, error = %e, "eager connect failed, staying pending");
                false
            }
        };

        self.save_document();
        if let Some(caps) = self.capabilities.read().get(name).cloned() {
            self.notify_caps_changed(&caps);
        }
        self.audit.record(AuditEvent::BackendAdded {
            backend: name.to_string(),
        });
        info!(backend = name, connected, "backend registered");
        Ok(connected)
    }

    /// Remove a backend: close its transport stack, drop it from the pending
    /// registry, and (opt-in) delete its document entry.
    pub async fn unregister_backend(
        &self,
        name: &str,
        drop_from_document: bool,
    ) -> Result<(), RelayError> {
        let _guard = self.registration.lock().await;

        let caps = self.capabilities.write().remove(name);
        let was_known = self.manager.remove(name).await;
        let document_had = {
            let mut document = self.document.write();
            let had = document.servers.contains(name);
            if drop_from_document {
                document.servers.remove(name);
            }
            had
        };

        if !was_known && !document_had {
            return Err(RelayError::UnknownBackend(name.to_string()));
        }

        self.purge_backend_caches(name);
        if drop_from_document {
            self.save_document();
        }
        if let Some(caps) = caps {
            self.notify_caps_changed(&caps);
        }
        self.audit.record(AuditEvent::BackendRemoved {
            backend: name.to_string(),
        });
        info!(backend = name, drop_from_document, "backend unregistered");
        Ok(())
    }

    // =========================================================================
    // Lifecycle callbacks (reaper / watchdog tasks)
    // =========================================================================

    /// Idle reaper closed these backends. Their tools remain listed from the
    /// document cache, but schemas revert to placeholders, so tell the client.
    pub fn on_backends_reaped(&self, names: &[String]) {
        for name in names {
            self.audit.record(AuditEvent::BackendDisconnected {
                backend: name.clone(),
            });
        }
        if !names.is_empty() {
            self.emit(NOTIFICATION_TOOLS_LIST_CHANGED);
        }
    }

    /// Watchdog reconnected these pinned backends.
    pub async fn on_backends_revived(&self, names: &[String]) {
        for name in names {
            if let Ok(session) = self.manager.get_or_open(name).await {
                self.refresh_backend(name, &session).await;
            }
            self.audit.record(AuditEvent::BackendConnected {
                backend: name.clone(),
            });
        }
        if !names.is_empty() {
            self.emit(NOTIFICATION_TOOLS_LIST_CHANGED);
        }
    }

    // =========================================================================
    // Administrative operations
    // =========================================================================

    /// Connected and pending backend counts for the health endpoint.
    pub fn health(&self) -> (usize, usize) {
        (
            self.manager.active_names().len(),
            self.manager.pending_names().len(),
        )
    }

    /// Exposed tools grouped by backend, post-policy.
    pub fn tools_by_backend(&self) -> BTreeMap<String, Vec<String>> {
        let document = self.document.read();
        let mut grouped = BTreeMap::new();
        for (backend, _) in document.servers.iter() {
            let tools: Vec<String> = merge::enabled_tools(&document, backend)
                .into_iter()
                .collect();
            grouped.insert(backend.clone(), tools);
        }
        grouped
    }

    /// Manually connect a pending backend.
    pub async fn enable_backend(&self, name: &str) -> Result<(), RelayError> {
        let session = self.manager.get_or_open(name).await?;
        self.refresh_backend(name, &session).await;
        if let Some(caps) = self.capabilities.read().get(name).cloned() {
            self.notify_caps_changed(&caps);
        }
        Ok(())
    }

    /// Manually disconnect a live backend without removing it.
    pub async fn disable_backend(&self, name: &str) -> Result<(), RelayError> {
        if !self.manager.close(name).await {
            return Err(RelayError::UnknownBackend(name.to_string()));
        }
        self.audit.record(AuditEvent::BackendDisconnected {
            backend: name.to_string(),
        });
        self.emit(NOTIFICATION_TOOLS_LIST_CHANGED);
        Ok(())
    }

    /// Explicit administrative prune of stale+disabled tool entries.
    pub fn prune_backend(&self, name: &str) -> usize {
        let removed = {
            let mut document = self.document.write();
            merge::prune_stale_disabled(&mut document, name)
        };
        if removed > 0 {
            self.save_document();
        }
        removed
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Live sessions ordered by document insertion order for deterministic
    /// listings.
    fn live_in_document_order(&self) -> Vec<(String, Arc<BackendSession>)> {
        let order: Vec<String> = {
            let document = self.document.read();
            document.servers.names().cloned().collect()
        };
        let mut live: HashMap<String, Arc<BackendSession>> =
            self.manager.live_sessions().into_iter().collect();

        let mut ordered = Vec::new();
        for name in order {
            if let Some(session) = live.remove(&name) {
                ordered.push((name, session));
            }
        }
        // Backends added at runtime but not yet persisted still count.
        let mut rest: Vec<(String, Arc<BackendSession>)> = live.into_iter().collect();
        rest.sort_by(|a, b| a.0.cmp(&b.0));
        ordered.extend(rest);
        ordered
    }

    /// Refresh the capability snapshot, tool schema cache, and prompt and
    /// resource indexes from a connected session, then fold new observations
    /// into the document.
    async fn refresh_backend(&self, name: &str, session: &BackendSession) {
        let capabilities = session.capabilities();

        if capabilities.has_tools() {
            match session.list_tools().await {
                Ok(tools) => {
                    let observed: Vec<merge::ObservedTool> = tools
                        .iter()
                        .map(|tool| merge::ObservedTool {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                        })
                        .collect();
                    {
                        let mut document = self.document.write();
                        merge::merge_discovered(&mut document, name, &observed);
                    }
                    let prefix = format!("{}{}", name, NAMESPACE_SEPARATOR);
                    let mut schemas = self.tool_schemas.write();
                    schemas.retain(|qualified, _| !qualified.starts_with(&prefix));
                    for tool in tools {
                        schemas.insert(qualify_name(name, &tool.name), tool);
                    }
                }
                Err(e) => warn!(backend = name, error = %e, "tool refresh failed"),
            }
        }

        if capabilities.has_prompts() {
            if let Ok(prompts) = session.list_prompts().await {
                let mut index = self.prompt_index.write();
                index.retain(|_, owner| owner != name);
                for prompt in prompts {
                    index.insert(qualify_name(name, &prompt.name), name.to_string());
                }
            }
        }

        if capabilities.has_resources() {
            if let Ok(resources) = session.list_resources().await {
                let mut index = self.resource_index.write();
                index.retain(|_, owner| owner != name);
                for resource in resources {
                    index.insert(resource.uri, name.to_string());
                }
            }
        }

        self.capabilities
            .write()
            .insert(name.to_string(), capabilities);
    }

    fn purge_backend_caches(&self, name: &str) {
        let prefix = format!("{}{}", name, NAMESPACE_SEPARATOR);
        self.tool_schemas
            .write()
            .retain(|qualified, _| !qualified.starts_with(&prefix));
        self.prompt_index.write().retain(|_, owner| owner != name);
        self.resource_index.write().retain(|_, owner| owner != name);
    }

    /// Persist the document. An unwritable document is non-fatal: the
    /// in-memory update stands.
    fn save_document(&self) {
        let document = self.document.read().clone();
        if let Err(e) = self.store.save(&document) {
            warn!(error = %e, "document save failed, continuing in memory");
        }
    }
}

/// Build an MCP error result (not a protocol error) carrying `text`.
fn error_result(id: JsonRpcId, text: String) -> JsonRpcResponse {
    let result = CallToolResult::error_text(text);
    JsonRpcResponse::success(id, serde_json::to_value(result).unwrap_or_default())
}
