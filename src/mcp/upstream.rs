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

//! Upstream transport codecs (stdio subprocess / streamable HTTP / legacy SSE).
//!
//! The relay core only sees the `UpstreamTransport` trait; everything else in
//! this module is plumbing behind the factory. A channel-backed transport is
//! provided for tests and in-process use.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::mcp::protocol::{JsonRpcId, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("channel closed")]
    ChannelClosed,
    #[error("backend process exited")]
    ProcessExited,
    #[error("failed to spawn backend process: {0}")]
    SpawnFailed(String),
    #[error("malformed event stream: {0}")]
    MalformedEventStream(String),
    #[error("refused redirect to '{0}'")]
    RedirectRefused(String),
    #[error("backend returned JSON-RPC error {code}: {message}")]
    Rpc { code: i32, message: String },
}

/// Outbound HTTP client with redirect following disabled. The SSRF guard
/// validates the URL that is dialed; a redirect could re-point a request at
/// a private address after that check, so redirects surface as errors.
fn no_redirect_client() -> Result<reqwest::Client, TransportError> {
    Ok(reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?)
}

/// Turn a 3xx answer into an error instead of a silently dead response.
fn reject_redirects(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    if response.status().is_redirection() {
        let target = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        return Err(TransportError::RedirectRefused(target));
    }
    Ok(response.error_for_status()?)
}

/// Monotonic request id shared by every upstream connection.
static NEXT_REQUEST_ID: AtomicI64 = AtomicI64::new(1);

fn next_request_id() -> i64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Tagged transport selection resolved from a backend config.
#[derive(Debug, Clone)]
pub enum TransportSpec {
    Stdio {
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    },
    StreamableHttp {
        url: String,
    },
    Sse {
        url: String,
    },
}

/// Narrow capability set the relay core consumes: request, notify, close.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Send a request and wait for the matching response's result payload.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, TransportError>;

    /// Send a one-way notification.
    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), TransportError>;

    /// Tear down the connection and any owned OS resources.
    async fn close(&self);
}

/// Open a transport for the given spec.
pub async fn open_transport(
    name: &str,
    spec: &TransportSpec,
) -> Result<Box<dyn UpstreamTransport>, TransportError> {
    match spec {
        TransportSpec::Stdio { command, args, env } => {
            Ok(Box::new(StdioUpstream::spawn(name, command, args, env)?))
        }
        TransportSpec::StreamableHttp { url } => {
            Ok(Box::new(HttpUpstream::new(name, url.clone())?))
        }
        TransportSpec::Sse { url } => Ok(Box::new(SseUpstream::connect(name, url).await?)),
    }
}

/// Unwrap a JSON-RPC response into its result, mapping `error` members.
fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, TransportError> {
    if let Some(err) = response.error {
        return Err(TransportError::Rpc {
            code: err.code,
            message: err.message,
        });
    }
    response.result.ok_or(TransportError::Rpc {
        code: -32603,
        message: "response missing both result and error".into(),
    })
}

// =============================================================================
// Stdio subprocess transport
// =============================================================================

/// JSON-RPC over a child process's stdio, one JSON object per line.
pub struct StdioUpstream {
    name: String,
    child: Mutex<Child>,
    writer: Mutex<ChildStdin>,
    reader: Mutex<BufReader<ChildStdout>>,
}

impl StdioUpstream {
    fn spawn(
        name: &str,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<Self, TransportError> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::SpawnFailed(format!("{}: {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::SpawnFailed("no stdin handle".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::SpawnFailed("no stdout handle".into()))?;

        debug!(backend = name, command, "spawned stdio backend");
        Ok(Self {
            name: name.to_string(),
            child: Mutex::new(child),
            writer: Mutex::new(stdin),
            reader: Mutex::new(BufReader::new(stdout)),
        })
    }

    async fn write_line(&self, payload: &str) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(payload.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl UpstreamTransport for StdioUpstream {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, TransportError> {
        let id = next_request_id();
        let request = JsonRpcRequest::new(id, method, params);
        self.write_line(&serde_json::to_string(&request)?).await?;

        // Read lines until the matching response id shows up. Anything that
        // does not parse is backend log noise on stdout; skip it.
        let mut reader = self.reader.lock().await;
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line).await?;
            if read == 0 {
                warn!(backend = %self.name, "stdout closed mid-request");
                return Err(TransportError::ProcessExited);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(response) if response.id == JsonRpcId::Number(id) => {
                    return extract_result(response)
                }
                Ok(_) | Err(_) => continue,
            }
        }
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), TransportError> {
        let mut notification = JsonRpcNotification::new(method);
        notification.params = params;
        self.write_line(&serde_json::to_string(&notification)?).await
    }

    async fn close(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(backend = %self.name, error = %e, "kill on close");
        }
    }
}

// =============================================================================
// Streamable HTTP transport
// =============================================================================

const MCP_SESSION_HEADER: &str = "Mcp-Session-Id";

/// JSON-RPC over HTTP POST, per the current MCP transport. The server may
/// answer with a plain JSON body or a short event stream; both are handled.
pub struct HttpUpstream {
    name: String,
    url: String,
    client: reqwest::Client,
    session_id: parking_lot::RwLock<Option<String>>,
}

impl HttpUpstream {
    pub fn new(name: &str, url: String) -> Result<Self, TransportError> {
        Ok(Self {
            name: name.to_string(),
            url,
            client: no_redirect_client()?,
            session_id: parking_lot::RwLock::new(None),
        })
    }

    fn apply_session(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.session_id.read().clone() {
            Some(session) => builder.header(MCP_SESSION_HEADER, session),
            None => builder,
        }
    }

    fn capture_session(&self, response: &reqwest::Response) {
        if let Some(value) = response.headers().get(MCP_SESSION_HEADER) {
            if let Ok(session) = value.to_str() {
                *self.session_id.write() = Some(session.to_string());
            }
        }
    }
}

#[async_trait]
impl UpstreamTransport for HttpUpstream {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, TransportError> {
        let id = next_request_id();
        let request = JsonRpcRequest::new(id, method, params);

        let builder = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(&request);
        let response = reject_redirects(self.apply_session(builder).send().await?)?;
        self.capture_session(&response);

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            let body = response.text().await?;
            let mut decoder = SseDecoder::new();
            for event in decoder.push(&body) {
                if let Ok(parsed) = serde_json::from_str::<JsonRpcResponse>(&event.data) {
                    if parsed.id == JsonRpcId::Number(id) {
                        return extract_result(parsed);
                    }
                }
            }
            Err(TransportError::MalformedEventStream(format!(
                "no response for request {} from '{}'",
                id, self.name
            )))
        } else {
            let parsed: JsonRpcResponse = response.json().await?;
            extract_result(parsed)
        }
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), TransportError> {
        let mut notification = JsonRpcNotification::new(method);
        notification.params = params;
        let builder = self.client.post(&self.url).json(&notification);
        reject_redirects(self.apply_session(builder).send().await?)?;
        Ok(())
    }

    async fn close(&self) {
        // Stateless per-request protocol; end the server-side session if one
        // was established.
        let session = self.session_id.read().clone();
        if let Some(session) = session {
            let result = self
                .client
                .delete(&self.url)
                .header(MCP_SESSION_HEADER, session)
                .send()
                .await;
            if let Err(e) = result {
                debug!(backend = %self.name, error = %e, "session delete on close");
            }
        }
    }
}

// =============================================================================
// Legacy SSE transport
// =============================================================================

/// JSON-RPC over the legacy HTTP+SSE pairing: responses arrive on a long-lived
/// GET event stream, requests are POSTed to the endpoint the stream announces.
pub struct SseUpstream {
    name: String,
    post_url: String,
    client: reqwest::Client,
    pending: Arc<DashMap<i64, oneshot::Sender<JsonRpcResponse>>>,
    reader: tokio::task::JoinHandle<()>,
}

impl SseUpstream {
    pub async fn connect(name: &str, url: &str) -> Result<Self, TransportError> {
        let client = no_redirect_client()?;
        let response = reject_redirects(
            client
                .get(url)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .send()
                .await?,
        )?;

        let base = reqwest::Url::parse(url)
            .map_err(|e| TransportError::MalformedEventStream(e.to_string()))?;
        let pending: Arc<DashMap<i64, oneshot::Sender<JsonRpcResponse>>> = Arc::new(DashMap::new());

        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let mut endpoint_tx = Some(endpoint_tx);
        let pending_for_reader = pending.clone();
        let backend = name.to_string();

        let reader = tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(backend = %backend, error = %e, "event stream error");
                        break;
                    }
                };
                let text = String::from_utf8_lossy(&chunk).into_owned();
                for event in decoder.push(&text) {
                    match event.event.as_str() {
                        "endpoint" => {
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(event.data);
                            }
                        }
                        _ => {
                            if let Ok(parsed) =
                                serde_json::from_str::<JsonRpcResponse>(&event.data)
                            {
                                if let JsonRpcId::Number(id) = parsed.id {
                                    if let Some((_, tx)) = pending_for_reader.remove(&id) {
                                        let _ = tx.send(parsed);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });

        let endpoint = endpoint_rx.await.map_err(|_| {
            TransportError::MalformedEventStream("stream ended before endpoint event".into())
        })?;
        let post_url = base
            .join(&endpoint)
            .map_err(|e| TransportError::MalformedEventStream(e.to_string()))?
            .to_string();

        debug!(backend = name, post_url = %post_url, "sse endpoint resolved");
        Ok(Self {
            name: name.to_string(),
            post_url,
            client,
            pending,
            reader,
        })
    }
}

#[async_trait]
impl UpstreamTransport for SseUpstream {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, TransportError> {
        let id = next_request_id();
        let request = JsonRpcRequest::new(id, method, params);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let result = match self.client.post(&self.post_url).json(&request).send().await {
            Ok(response) => reject_redirects(response),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            self.pending.remove(&id);
            return Err(e);
        }

        let response = rx.await.map_err(|_| TransportError::ChannelClosed)?;
        extract_result(response)
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), TransportError> {
        let mut notification = JsonRpcNotification::new(method);
        notification.params = params;
        reject_redirects(
            self.client
                .post(&self.post_url)
                .json(&notification)
                .send()
                .await?,
        )?;
        Ok(())
    }

    async fn close(&self) {
        self.reader.abort();
        self.pending.clear();
        debug!(backend = %self.name, "sse transport closed");
    }
}

// =============================================================================
// Channel transport (tests / in-process)
// =============================================================================

/// Request paired with the sender its response must go to.
pub type ChannelExchange = (JsonRpcRequest, oneshot::Sender<JsonRpcResponse>);

/// Channel-backed transport for tests and in-process use. A responder task
/// drains the receiver and answers each request.
pub struct ChannelUpstream {
    tx: mpsc::Sender<ChannelExchange>,
}

impl ChannelUpstream {
    pub fn new(tx: mpsc::Sender<ChannelExchange>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl UpstreamTransport for ChannelUpstream {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, TransportError> {
        let id = next_request_id();
        let request = JsonRpcRequest::new(id, method, params);
        let (tx, rx) = oneshot::channel();
        self.tx
            .send((request, tx))
            .await
            .map_err(|_| TransportError::ChannelClosed)?;
        let response = rx.await.map_err(|_| TransportError::ChannelClosed)?;
        extract_result(response)
    }

    async fn notify(
        &self,
        _method: &str,
        _params: Option<serde_json::Value>,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) {}
}

// =============================================================================
// SSE wire decoding
// =============================================================================

/// One decoded server-sent event.
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental decoder for `text/event-stream` payloads. Events are separated
/// by a blank line; multi-line `data:` fields are joined with newlines.
pub(crate) struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        // Normalize CRLF after appending so a \r\n pair split across chunks
        // still collapses once its second half arrives.
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }
        let mut events = Vec::new();

        while let Some(split) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..split + 2).collect();
            let mut event_name = String::from("message");
            let mut data_lines: Vec<&str> = Vec::new();

            for line in block.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    event_name = rest.trim().to_string();
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
                }
                // Comments and id fields are irrelevant here.
            }

            if !data_lines.is_empty() {
                events.push(SseEvent {
                    event: event_name,
                    data: data_lines.join("\n"),
                });
            }
        }

        events
    }
}
