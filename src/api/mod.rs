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

//! Administrative HTTP surface (HTTP transport only).
//!
//! Liveness, membership, and per-tool policy operations, all guarded by a
//! bearer token when one is configured. Token comparison is constant time.

use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::RelayError;
use crate::proxy::RelayProxy;
use crate::sources;

/// Shared state of the admin endpoints.
#[derive(Clone)]
pub struct AdminState {
    pub proxy: Arc<RelayProxy>,
    pub api_key: Option<Arc<String>>,
}

/// Build the admin router. Auth is applied by `require_bearer` at the app
/// level so the MCP endpoints share it.
pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/mcp_servers", get(handle_list_servers).post(handle_add_servers))
        .route("/mcp_servers/:name", delete(handle_remove_server))
        .route("/mcp_tools", get(handle_list_tools))
        .route("/mcp_control", post(handle_control))
        .with_state(state)
}

/// Bearer-token admission. A missing configured key means open access
/// (stdio-style local use); with a key, every request must present it.
pub async fn require_bearer(
    State(state): State<AdminState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_ref() else {
        return next.run(request).await;
    };

    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match header {
        Some(value) if value.starts_with("Bearer ") => {
            let token = &value[7..];
            if constant_time_eq(token.as_bytes(), expected.as_bytes()) {
                next.run(request).await
            } else {
                unauthorized("Invalid API key")
            }
        }
        Some(_) => unauthorized("Invalid Authorization format (expected 'Bearer <token>')"),
        None => unauthorized("Missing Authorization header"),
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": format!("Unauthorized: {}", message)})),
    )
        .into_response()
}

/// Constant-time byte comparison so the token check leaks no timing signal.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// GET /health
async fn handle_health(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let (connected, pending) = state.proxy.health();
    Json(json!({
        "status": "healthy",
        "connected": connected,
        "pending": pending,
    }))
}

/// GET /mcp_servers
async fn handle_list_servers(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let manager = state.proxy.manager();
    Json(json!({
        "active_servers": manager.active_names(),
        "pending_servers": manager.pending_names(),
    }))
}

/// POST /mcp_servers — add backends (eager attempt, lazy fallback).
async fn handle_add_servers(
    State(state): State<AdminState>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    if payload.get("mcpServers").is_none() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": "Missing required 'mcpServers' field"})),
        )
            .into_response();
    }

    let backends = sources::extract_backends(&payload);
    if backends.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "No servers found in payload"})),
        )
            .into_response();
    }

    let mut added = Vec::new();
    let mut pending = Vec::new();
    for (name, config) in backends {
        match state.proxy.register_backend(&name, config).await {
            Ok(true) => added.push(name),
            Ok(false) => pending.push(name),
            Err(e) if e.is_permanent() => {
                warn!(backend = %name, error = %e, "rejected backend registration");
                return (StatusCode::FORBIDDEN, Json(json!({"error": e.to_string()})))
                    .into_response();
            }
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": e.to_string()})),
                )
                    .into_response();
            }
        }
    }

    info!(added = ?added, pending = ?pending, "backends added via admin api");
    Json(json!({
        "message": format!("Added {:?}", [added.clone(), pending.clone()].concat()),
        "connected": added,
        "pending": pending,
    }))
    .into_response()
}

/// DELETE /mcp_servers/{name}
async fn handle_remove_server(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Response {
    match state.proxy.unregister_backend(&name, true).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(RelayError::UnknownBackend(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("No backend named '{}'", name)})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// GET /mcp_tools — exposed tools grouped by backend.
async fn handle_list_tools(State(state): State<AdminState>) -> Json<serde_json::Value> {
    Json(json!({"tools": state.proxy.tools_by_backend()}))
}

/// POST /mcp_control — manual enable/disable/prune.
async fn handle_control(
    State(state): State<AdminState>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    let action = payload.get("action").and_then(|v| v.as_str());
    let server = payload.get("server").and_then(|v| v.as_str());
    let (Some(action), Some(server)) = (action, server) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Missing 'action' or 'server' in payload"})),
        )
            .into_response();
    };

    match action {
        "enable" => match state.proxy.enable_backend(server).await {
            Ok(()) => Json(json!({"message": format!("Server '{}' enabled", server)}))
                .into_response(),
            Err(RelayError::UnknownBackend(_)) => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": format!("Server '{}' not found", server)})),
            )
                .into_response(),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response(),
        },
        "disable" => match state.proxy.disable_backend(server).await {
            Ok(()) => Json(json!({"message": format!("Server '{}' disabled", server)}))
                .into_response(),
            Err(_) => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": format!("Server '{}' not active", server)})),
            )
                .into_response(),
        },
        "prune" => {
            let removed = state.proxy.prune_backend(server);
            Json(json!({
                "message": format!("Pruned {} stale disabled tool(s) from '{}'", removed, server),
                "removed": removed,
            }))
            .into_response()
        }
        other => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("Invalid action: {}. Use 'enable', 'disable', or 'prune'", other)})),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret2"));
        assert!(!constant_time_eq(b"", b"x"));
        assert!(constant_time_eq(b"", b""));
    }
}
