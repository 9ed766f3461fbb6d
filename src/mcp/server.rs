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

//! Downstream server: the single MCP endpoint the client connects to.
//!
//! Two transports: a stdio pair (default, one JSON object per line) and an
//! HTTP endpoint (`POST /mcp` for requests, `GET /sse` for notifications).
//! Either way the proxy's notification handle is captured at run-start and
//! cleared at run-end.

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::mcp::protocol::{
    JsonRpcError, JsonRpcId, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use crate::proxy::RelayProxy;

/// Serve the downstream client over stdin/stdout until EOF.
///
/// Responses and notifications are funneled through one writer task so lines
/// never interleave; each request runs in its own task.
pub async fn serve_stdio(proxy: Arc<RelayProxy>) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<JsonRpcNotification>();
    proxy.set_downstream(notify_tx);

    let writer = tokio::spawn(async move {
        let mut stdout = BufWriter::new(tokio::io::stdout());
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                error!("downstream stdout closed");
                break;
            }
        }
    });

    let notify_out = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(notification) = notify_rx.recv().await {
            match serde_json::to_string(&notification) {
                Ok(line) => {
                    let _ = notify_out.send(line);
                }
                Err(e) => warn!(error = %e, "notification serialization failed"),
            }
        }
    });

    info!("serving MCP over stdio");
    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let value: serde_json::Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(e) => {
                let response = JsonRpcResponse::error(
                    JsonRpcId::Null,
                    JsonRpcError::parse_error(format!("Invalid JSON: {}", e)),
                );
                if let Ok(line) = serde_json::to_string(&response) {
                    let _ = out_tx.send(line);
                }
                continue;
            }
        };

        if value.get("id").is_some() {
            match serde_json::from_value::<JsonRpcRequest>(value) {
                Ok(request) => {
                    // One task per downstream request.
                    let proxy = proxy.clone();
                    let out = out_tx.clone();
                    tokio::spawn(async move {
                        let response = proxy.handle_request(request).await;
                        if let Ok(line) = serde_json::to_string(&response) {
                            let _ = out.send(line);
                        }
                    });
                }
                Err(e) => {
                    let response = JsonRpcResponse::error(
                        JsonRpcId::Null,
                        JsonRpcError::invalid_request(e.to_string()),
                    );
                    if let Ok(line) = serde_json::to_string(&response) {
                        let _ = out_tx.send(line);
                    }
                }
            }
        } else {
            match serde_json::from_value::<JsonRpcNotification>(value) {
                Ok(notification) => proxy.handle_notification(notification).await,
                Err(e) => debug!(error = %e, "unparseable notification dropped"),
            }
        }
    }

    info!("stdin closed, downstream session over");
    proxy.clear_downstream();
    forwarder.abort();
    writer.abort();
    Ok(())
}

/// Shared state of the HTTP-mode MCP endpoint.
#[derive(Clone)]
pub struct McpServerState {
    proxy: Arc<RelayProxy>,
    notifications: broadcast::Sender<JsonRpcNotification>,
}

/// Build the MCP-facing router and capture the proxy's notification handle.
///
/// Notifications fan out to every `/sse` subscriber through a broadcast
/// channel; with no subscriber they are dropped, which is the required
/// best-effort behavior.
pub fn mcp_router(proxy: Arc<RelayProxy>) -> Router {
    let (broadcast_tx, _) = broadcast::channel::<JsonRpcNotification>(256);

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<JsonRpcNotification>();
    proxy.set_downstream(notify_tx);
    let fanout = broadcast_tx.clone();
    tokio::spawn(async move {
        while let Some(notification) = notify_rx.recv().await {
            // Send errors just mean nobody is listening right now.
            let _ = fanout.send(notification);
        }
    });

    let state = McpServerState {
        proxy,
        notifications: broadcast_tx,
    };

    Router::new()
        .route("/mcp", post(handle_mcp_post))
        .route("/sse", get(handle_sse))
        .with_state(state)
}

/// Handle an MCP JSON-RPC message over HTTP POST. Requests get a response
/// body; notifications get an empty accepted result.
async fn handle_mcp_post(
    State(state): State<McpServerState>,
    Json(message): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    if message.get("id").is_some() {
        match serde_json::from_value::<JsonRpcRequest>(message) {
            Ok(request) => {
                let response = state.proxy.handle_request(request).await;
                Json(serde_json::to_value(response).unwrap_or_default())
            }
            Err(e) => {
                let response = JsonRpcResponse::error(
                    JsonRpcId::Null,
                    JsonRpcError::invalid_request(e.to_string()),
                );
                Json(serde_json::to_value(response).unwrap_or_default())
            }
        }
    } else {
        match serde_json::from_value::<JsonRpcNotification>(message) {
            Ok(notification) => state.proxy.handle_notification(notification).await,
            Err(e) => debug!(error = %e, "unparseable notification dropped"),
        }
        Json(serde_json::json!({}))
    }
}

/// Stream notifications to the downstream client as server-sent events.
async fn handle_sse(
    State(state): State<McpServerState>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let client_id = uuid::Uuid::new_v4().to_string();
    info!(client_id = %client_id, "SSE client connected");

    let rx = state.notifications.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    let data = serde_json::to_string(&notification).unwrap_or_default();
                    return Some((
                        Ok::<_, Infallible>(Event::default().event("message").data(data)),
                        rx,
                    ));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE subscriber lagged, notifications dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)))
}
