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

// End-to-end lifecycle tests: discovery, policy filtering, lazy opens, idle
// reaping, retry after failure, and dynamic membership. Backends are scripted
// channel transports; no real subprocesses or sockets are involved.

use async_trait::async_trait;
use mcp_relay::audit::NullAudit;
use mcp_relay::discovery::run_sweep;
use mcp_relay::document::{BackendConfig, Document, DocumentStore};
use mcp_relay::error::RelayError;
use mcp_relay::manager::{BackendManager, Connector, ManagerConfig};
use mcp_relay::mcp::client::BackendSession;
use mcp_relay::mcp::protocol::*;
use mcp_relay::mcp::upstream::{ChannelExchange, ChannelUpstream};
use mcp_relay::proxy::RelayProxy;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Scripted backend fleet. Each backend advertises the tools configured for
/// it; connection failures and per-backend connect counts are controllable.
struct TestFleet {
    tools: parking_lot::RwLock<HashMap<String, Vec<(String, String)>>>,
    failing: parking_lot::RwLock<Vec<String>>,
    attempts: parking_lot::RwLock<HashMap<String, usize>>,
}

impl TestFleet {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            tools: parking_lot::RwLock::new(HashMap::new()),
            failing: parking_lot::RwLock::new(Vec::new()),
            attempts: parking_lot::RwLock::new(HashMap::new()),
        })
    }

    fn set_tools(&self, backend: &str, tools: &[(&str, &str)]) {
        self.tools.write().insert(
            backend.to_string(),
            tools
                .iter()
                .map(|(n, d)| (n.to_string(), d.to_string()))
                .collect(),
        );
    }

    fn set_failing(&self, backend: &str, failing: bool) {
        let mut list = self.failing.write();
        list.retain(|b| b != backend);
        if failing {
            list.push(backend.to_string());
        }
    }

    fn attempts(&self, backend: &str) -> usize {
        self.attempts.read().get(backend).copied().unwrap_or(0)
    }

    fn scripted_session(&self, name: &str) -> BackendSession {
        let tools: Vec<serde_json::Value> = self
            .tools
            .read()
            .get(name)
            .map(|tools| {
                tools
                    .iter()
                    .map(|(tool, description)| {
                        json!({
                            "name": tool,
                            "description": description,
                            "inputSchema": {"type": "object", "properties": {}},
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let (tx, mut rx) = mpsc::channel::<ChannelExchange>(32);
        tokio::spawn(async move {
            while let Some((request, reply)) = rx.recv().await {
                let result = match request.method.as_str() {
                    "initialize" => json!({
                        "protocolVersion": MCP_PROTOCOL_VERSION,
                        "capabilities": {"tools": {"listChanged": true}},
                        "serverInfo": {"name": "fleet", "version": "0"},
                    }),
                    "tools/list" => json!({"tools": tools.clone()}),
                    "tools/call" => json!({"content": [{"type": "text", "text": "done"}]}),
                    _ => json!({}),
                };
                let _ = reply.send(JsonRpcResponse::success(request.id, result));
            }
        });
        BackendSession::new(name, Box::new(ChannelUpstream::new(tx)))
    }
}

#[async_trait]
impl Connector for TestFleet {
    async fn connect(
        &self,
        name: &str,
        _config: &BackendConfig,
    ) -> Result<BackendSession, RelayError> {
        *self.attempts.write().entry(name.to_string()).or_insert(0) += 1;
        if self.failing.read().iter().any(|b| b == name) {
            return Err(RelayError::TransportFailed {
                name: name.to_string(),
                reason: "connection refused".into(),
            });
        }
        let session = self.scripted_session(name);
        session
            .initialize()
            .await
            .map_err(|e| RelayError::TransportFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(session)
    }
}

fn stdio_backend(always_on: bool, idle_minutes: u64) -> BackendConfig {
    BackendConfig {
        command: Some("npx".into()),
        always_on,
        idle_timeout_minutes: idle_minutes,
        ..Default::default()
    }
}

fn manager_for(fleet: &Arc<TestFleet>) -> Arc<BackendManager> {
    Arc::new(BackendManager::new(fleet.clone(), ManagerConfig::default()))
}

fn proxy_for(
    manager: Arc<BackendManager>,
    store: DocumentStore,
    document: Document,
) -> Arc<RelayProxy> {
    Arc::new(RelayProxy::new(manager, store, document, Arc::new(NullAudit)))
}

fn request(method: &str, params: serde_json::Value) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: JSONRPC_VERSION.to_string(),
        method: method.to_string(),
        params: Some(params),
        id: JsonRpcId::Number(1),
    }
}

async fn listed_tools(proxy: &RelayProxy) -> Vec<String> {
    let response = proxy.handle_request(request("tools/list", json!({}))).await;
    let result: ListToolsResult = serde_json::from_value(response.result.unwrap()).unwrap();
    result.tools.into_iter().map(|t| t.name).collect()
}

/// S1: first-run discovery populates the document, keeps pinned backends
/// connected, and exposes every qualified tool.
#[tokio::test]
async fn first_run_discovery() {
    let fleet = TestFleet::new();
    fleet.set_tools("alpha", &[("x", "tool x"), ("y", "tool y")]);
    fleet.set_tools("beta", &[("z", "tool z")]);

    let dir = TempDir::new().unwrap();
    let store = DocumentStore::new(dir.path().join("servers.yaml"));

    let mut document = Document::default();
    document.servers.insert("alpha".into(), stdio_backend(true, 5));
    document.servers.insert("beta".into(), stdio_backend(false, 5));

    let manager = manager_for(&fleet);
    let outcome = run_sweep(&manager, &mut document).await;
    store.save(&document).unwrap();

    // Document inventory: all three tools enabled and fresh.
    for (backend, tool) in [("alpha", "x"), ("alpha", "y"), ("beta", "z")] {
        let entry = document.servers.get(backend).unwrap().tools.get(tool).unwrap();
        assert!(entry.enabled);
        assert!(!entry.stale);
    }

    // Pinned backend stays live; the lazy one was disconnected.
    assert!(manager.is_live("alpha"));
    assert!(!manager.is_live("beta"));

    let proxy = proxy_for(manager, store, document);
    proxy.absorb_sweep(outcome);
    assert_eq!(listed_tools(&proxy).await, ["alpha::x", "alpha::y", "beta::z"]);
}

/// S2: a user edit disabling a tool survives restart and rediscovery.
#[tokio::test]
async fn user_disable_persists_across_restart_and_rediscovery() {
    let fleet = TestFleet::new();
    fleet.set_tools("alpha", &[("x", ""), ("y", "")]);
    fleet.set_tools("beta", &[("z", "")]);

    let dir = TempDir::new().unwrap();
    let store = DocumentStore::new(dir.path().join("servers.yaml"));

    let mut document = Document::default();
    document.servers.insert("alpha".into(), stdio_backend(false, 5));
    document.servers.insert("beta".into(), stdio_backend(false, 5));
    run_sweep(&manager_for(&fleet), &mut document).await;

    // User edit: disable alpha::x, save, "restart".
    document
        .servers
        .get_mut("alpha")
        .unwrap()
        .tools
        .get_mut("x")
        .unwrap()
        .enabled = false;
    store.save(&document).unwrap();

    let reloaded = store.load().unwrap();
    let manager = manager_for(&fleet);
    for (name, config) in reloaded.servers.iter() {
        manager.register(name, config.clone()).unwrap();
    }
    let proxy = proxy_for(manager, store.clone(), reloaded);
    assert_eq!(listed_tools(&proxy).await, ["alpha::y", "beta::z"]);

    // Rediscovery leaves the user decision alone.
    let mut redoc = store.load().unwrap();
    run_sweep(&manager_for(&fleet), &mut redoc).await;
    assert!(!redoc.servers.get("alpha").unwrap().tools.get("x").unwrap().enabled);
}

/// S3: a disappeared tool goes stale; stale+disabled entries are pruned on
/// the explicit admin pass.
#[tokio::test]
async fn disappeared_tool_goes_stale_then_pruned() {
    let fleet = TestFleet::new();
    fleet.set_tools("alpha", &[("x", ""), ("y", "")]);

    let dir = TempDir::new().unwrap();
    let store = DocumentStore::new(dir.path().join("servers.yaml"));

    let mut document = Document::default();
    document.servers.insert("alpha".into(), stdio_backend(false, 5));
    run_sweep(&manager_for(&fleet), &mut document).await;

    document
        .servers
        .get_mut("alpha")
        .unwrap()
        .tools
        .get_mut("x")
        .unwrap()
        .enabled = false;

    // The backend stops advertising x.
    fleet.set_tools("alpha", &[("y", "")]);
    run_sweep(&manager_for(&fleet), &mut document).await;

    let entry = document.servers.get("alpha").unwrap().tools.get("x").unwrap();
    assert!(entry.stale);
    assert!(!entry.enabled);

    let manager = manager_for(&fleet);
    let proxy = proxy_for(manager, store, document);
    assert_eq!(proxy.prune_backend("alpha"), 1);
    assert!(!proxy.document().servers.get("alpha").unwrap().tools.contains_key("x"));
}

/// S4: a call to a pending backend opens it lazily; the idle reaper closes
/// it; a later call reopens it.
#[tokio::test]
async fn lazy_open_idle_reap_reopen() {
    let fleet = TestFleet::new();
    fleet.set_tools("beta", &[("z", "")]);

    let dir = TempDir::new().unwrap();
    let store = DocumentStore::new(dir.path().join("servers.yaml"));

    let mut document = Document::default();
    // Zero-minute timeout: idle immediately after any pause.
    document.servers.insert("beta".into(), stdio_backend(false, 0));
    run_sweep(&manager_for(&fleet), &mut document).await;

    let manager = manager_for(&fleet);
    for (name, config) in document.servers.iter() {
        manager.register(name, config.clone()).unwrap();
    }
    let proxy = proxy_for(manager.clone(), store, document);

    assert!(!manager.is_live("beta"));
    let response = proxy
        .handle_request(request("tools/call", json!({"name": "beta::z", "arguments": {}})))
        .await;
    assert_eq!(response.result.unwrap()["content"][0]["text"], "done");
    assert!(manager.is_live("beta"));

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let reaped = manager.tick_idle_reaper().await;
    assert_eq!(reaped, ["beta"]);
    assert!(!manager.is_live("beta"));

    // Reopen on the next call.
    let attempts_before = fleet.attempts("beta");
    let response = proxy
        .handle_request(request("tools/call", json!({"name": "beta::z", "arguments": {}})))
        .await;
    assert!(response.result.unwrap()["content"][0]["text"] == "done");
    assert_eq!(fleet.attempts("beta"), attempts_before + 1);
}

/// S5: an unreachable backend keeps failing softly; it stays pending and a
/// retry reaches the transport again.
#[tokio::test]
async fn open_failure_leaves_backend_retryable() {
    let fleet = TestFleet::new();
    fleet.set_tools("beta", &[("z", "")]);
    fleet.set_failing("beta", true);

    let dir = TempDir::new().unwrap();
    let store = DocumentStore::new(dir.path().join("servers.yaml"));

    let mut document = Document::default();
    let mut beta = stdio_backend(false, 5);
    beta.tools.insert("z".into(), Default::default());
    document.servers.insert("beta".into(), beta);

    let manager = manager_for(&fleet);
    for (name, config) in document.servers.iter() {
        manager.register(name, config.clone()).unwrap();
    }
    let proxy = proxy_for(manager.clone(), store, document);

    let response = proxy
        .handle_request(request("tools/call", json!({"name": "beta::z"})))
        .await;
    let result: CallToolResult = serde_json::from_value(response.result.unwrap()).unwrap();
    assert_eq!(result.is_error, Some(true));

    // Still listed as pending, never silently dropped.
    assert_eq!(manager.pending_names(), ["beta"]);

    fleet.set_failing("beta", false);
    let response = proxy
        .handle_request(request("tools/call", json!({"name": "beta::z"})))
        .await;
    assert_eq!(response.result.unwrap()["content"][0]["text"], "done");
    assert_eq!(fleet.attempts("beta"), 2);
}

/// S6: dynamic membership emits exactly one tools/list_changed per change,
/// and removal closes the live session.
#[tokio::test]
async fn dynamic_membership_notifications() {
    let fleet = TestFleet::new();
    fleet.set_tools("gamma", &[("g", "")]);

    let dir = TempDir::new().unwrap();
    let store = DocumentStore::new(dir.path().join("servers.yaml"));
    let manager = manager_for(&fleet);
    let proxy = proxy_for(manager.clone(), store, Document::default());

    let (tx, mut rx) = mpsc::unbounded_channel();
    proxy.set_downstream(tx);

    proxy
        .register_backend("gamma", stdio_backend(false, 5))
        .await
        .unwrap();
    assert!(manager.is_live("gamma"));
    assert_eq!(rx.try_recv().unwrap().method, NOTIFICATION_TOOLS_LIST_CHANGED);
    assert!(rx.try_recv().is_err(), "exactly one notification expected");

    assert_eq!(listed_tools(&proxy).await, ["gamma::g"]);

    proxy.unregister_backend("gamma", true).await.unwrap();
    assert!(!manager.is_live("gamma"));
    assert!(!manager.is_known("gamma"));
    assert_eq!(rx.try_recv().unwrap().method, NOTIFICATION_TOOLS_LIST_CHANGED);
    assert!(listed_tools(&proxy).await.is_empty());
}

/// Property 7: a leftover temp sibling from an interrupted save never
/// corrupts the next load, and a completed save fully replaces the file.
#[tokio::test]
async fn document_save_is_atomic() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("servers.yaml");
    let store = DocumentStore::new(&path);

    let mut document = Document::default();
    document.servers.insert("alpha".into(), stdio_backend(false, 5));
    store.save(&document).unwrap();

    // Simulate a writer that crashed after writing the temp sibling.
    std::fs::write(path.with_extension("yaml.tmp"), "servers: [torn").unwrap();
    let loaded = store.load().unwrap();
    assert!(loaded.servers.contains("alpha"));

    // A completed save replaces content wholesale.
    document.servers.insert("beta".into(), stdio_backend(false, 5));
    store.save(&document).unwrap();
    let reloaded = store.load().unwrap();
    assert_eq!(reloaded.servers.len(), 2);
}
