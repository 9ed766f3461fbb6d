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

//! Backend lifecycle: pending-config registry, lazy opens, idle reaping,
//! pinned-backend revival, and per-backend serialization.
//!
//! Open paths are serialized per backend (one connection ever in flight for a
//! given name) and bounded globally by a semaphore. On any open failure,
//! including timeout and cancellation, the pending config is restored before
//! the error unwinds, so a backend is always retryable and is never observed
//! as neither live nor pending.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::document::{BackendConfig, TransportHint};
use crate::error::RelayError;
use crate::mcp::client::BackendSession;
use crate::mcp::upstream::{open_transport, TransportSpec};

/// Default bound on a single backend open, handshake included.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);
/// Default global cap on concurrent opens.
pub const DEFAULT_MAX_CONCURRENT_OPENS: usize = 8;

/// Idle timeout applied when a backend has none recorded.
const FALLBACK_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Commands a stdio backend may run when no override is configured.
const DEFAULT_ALLOWED_COMMANDS: &[&str] =
    &["node", "npx", "uvx", "python", "python3", "uv", "docker"];

/// Environment variables a backend config may never override. These reach
/// into loader, interpreter, and shell startup behavior of the subprocess.
const PROTECTED_ENV_VARS: &[&str] = &[
    "PATH",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "DYLD_FRAMEWORK_PATH",
    "PYTHONPATH",
    "PYTHONHOME",
    "PYTHONSTARTUP",
    "NODE_OPTIONS",
    "NODE_PATH",
    "NODE_EXTRA_CA_CERTS",
    "BASH_ENV",
    "ENV",
    "ZDOTDIR",
    "http_proxy",
    "https_proxy",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "ALL_PROXY",
    "all_proxy",
    "HOME",
    "USER",
    "PERL5LIB",
    "PERL5OPT",
    "RUBYLIB",
    "RUBYOPT",
];

/// The allowed command set, from `MCP_RELAY_ALLOWED_COMMANDS` (comma
/// separated) or the default list.
pub fn allowed_commands() -> HashSet<String> {
    match std::env::var("MCP_RELAY_ALLOWED_COMMANDS") {
        Ok(value) if !value.trim().is_empty() => value
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect(),
        _ => DEFAULT_ALLOWED_COMMANDS.iter().map(|c| c.to_string()).collect(),
    }
}

/// Bare command names only, and only from the allowlist.
pub fn validate_command(command: &str) -> Result<(), RelayError> {
    if command.contains('/') || command.contains('\\') {
        return Err(RelayError::CommandRejected(command.to_string()));
    }
    if !allowed_commands().contains(command) {
        return Err(RelayError::CommandRejected(command.to_string()));
    }
    Ok(())
}

/// Drop protected variables from a backend-supplied environment map.
pub fn filter_env(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(key, _)| !PROTECTED_ENV_VARS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // Unique-local fc00::/7
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // Link-local fe80::/10
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// SSRF guard: resolve the URL host and reject private, loopback, and
/// link-local destinations.
pub async fn validate_url(url: &str) -> Result<(), RelayError> {
    let parsed = url::Url::parse(url).map_err(|e| RelayError::TransportFailed {
        name: url.to_string(),
        reason: format!("invalid url: {}", e),
    })?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(RelayError::TransportFailed {
            name: url.to_string(),
            reason: format!("scheme '{}' is not allowed", parsed.scheme()),
        });
    }
    let host = parsed.host().ok_or_else(|| RelayError::TransportFailed {
        name: url.to_string(),
        reason: "url has no host".to_string(),
    })?;
    let port = parsed.port_or_known_default().unwrap_or(443);

    // Literal IPs are checked directly; names go through the resolver so a
    // DNS answer pointing inward is caught too.
    let resolved: Vec<IpAddr> = match host {
        url::Host::Ipv4(ip) => vec![IpAddr::V4(ip)],
        url::Host::Ipv6(ip) => vec![IpAddr::V6(ip)],
        url::Host::Domain(domain) => tokio::net::lookup_host((domain, port))
            .await
            .map_err(|e| RelayError::TransportFailed {
                name: url.to_string(),
                reason: format!("could not resolve '{}': {}", domain, e),
            })?
            .map(|addr| addr.ip())
            .collect(),
    };

    for ip in resolved {
        if is_blocked_ip(ip) {
            return Err(RelayError::SsrfBlocked {
                url: url.to_string(),
                ip: ip.to_string(),
            });
        }
    }
    Ok(())
}

/// Opens an initialized session for a backend config. The default
/// implementation goes through the real transport factory; tests substitute
/// their own.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, name: &str, config: &BackendConfig)
        -> Result<BackendSession, RelayError>;
}

/// Production connector: validates the config, builds the transport, and runs
/// the initialize exchange. URL backends without an explicit `sse` hint try
/// streamable HTTP first and fall back to legacy SSE.
pub struct TransportConnector;

impl TransportConnector {
    async fn open_and_initialize(
        name: &str,
        spec: &TransportSpec,
    ) -> Result<BackendSession, RelayError> {
        let transport =
            open_transport(name, spec)
                .await
                .map_err(|e| RelayError::TransportFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                })?;
        let session = BackendSession::new(name, transport);
        if let Err(e) = session.initialize().await {
            session.close().await;
            return Err(RelayError::TransportFailed {
                name: name.to_string(),
                reason: format!("initialize failed: {}", e),
            });
        }
        Ok(session)
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(
        &self,
        name: &str,
        config: &BackendConfig,
    ) -> Result<BackendSession, RelayError> {
        config.validate(name)?;

        if let Some(command) = &config.command {
            validate_command(command)?;
            let spec = TransportSpec::Stdio {
                command: command.clone(),
                args: config.args.clone(),
                env: filter_env(&config.env),
            };
            return Self::open_and_initialize(name, &spec).await;
        }

        let url = config.url.clone().unwrap_or_default();
        validate_url(&url).await?;

        if config.transport != Some(TransportHint::Sse) {
            let spec = TransportSpec::StreamableHttp { url: url.clone() };
            match Self::open_and_initialize(name, &spec).await {
                Ok(session) => return Ok(session),
                // With an explicit hint there is nothing to fall back to.
                Err(e) if config.transport.is_some() => return Err(e),
                Err(e) => {
                    debug!(backend = name, error = %e, "streamable http failed, trying sse");
                }
            }
        }

        let spec = TransportSpec::Sse { url };
        Self::open_and_initialize(name, &spec).await
    }
}

/// Tuning knobs for the manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub open_timeout: Duration,
    pub max_concurrent_opens: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            max_concurrent_opens: DEFAULT_MAX_CONCURRENT_OPENS,
        }
    }
}

/// Restores a popped pending config when an open does not complete, whether
/// it failed, timed out, or was cancelled mid-await.
struct PendingRestore<'a> {
    pending: &'a DashMap<String, BackendConfig>,
    name: &'a str,
    config: Option<BackendConfig>,
}

impl<'a> PendingRestore<'a> {
    fn disarm(&mut self) {
        self.config = None;
    }
}

impl<'a> Drop for PendingRestore<'a> {
    fn drop(&mut self) {
        if let Some(config) = self.config.take() {
            self.pending.insert(self.name.to_string(), config);
        }
    }
}

/// Owner of every backend session and its transport resources.
pub struct BackendManager {
    connector: Arc<dyn Connector>,
    live: DashMap<String, Arc<BackendSession>>,
    pending: DashMap<String, BackendConfig>,
    /// Authoritative config copy used to re-pend a backend after close.
    configs: DashMap<String, BackendConfig>,
    open_locks: DashMap<String, Arc<Mutex<()>>>,
    last_used: DashMap<String, Instant>,
    idle_timeouts: DashMap<String, Duration>,
    pinned: parking_lot::RwLock<HashSet<String>>,
    open_semaphore: Arc<Semaphore>,
    open_timeout: Duration,
}

impl BackendManager {
    pub fn new(connector: Arc<dyn Connector>, config: ManagerConfig) -> Self {
        Self {
            connector,
            live: DashMap::new(),
            pending: DashMap::new(),
            configs: DashMap::new(),
            open_locks: DashMap::new(),
            last_used: DashMap::new(),
            idle_timeouts: DashMap::new(),
            pinned: parking_lot::RwLock::new(HashSet::new()),
            open_semaphore: Arc::new(Semaphore::new(config.max_concurrent_opens)),
            open_timeout: config.open_timeout,
        }
    }

    /// Register a backend config without connecting. Idempotent.
    pub fn register(&self, name: &str, config: BackendConfig) -> Result<(), RelayError> {
        config.validate(name)?;
        self.idle_timeouts.insert(name.to_string(), config.idle_timeout());
        if config.always_on {
            self.pinned.write().insert(name.to_string());
        }
        self.configs.insert(name.to_string(), config.clone());
        if !self.live.contains_key(name) {
            self.pending.insert(name.to_string(), config);
        }
        debug!(backend = name, "registered pending backend");
        Ok(())
    }

    /// Fetch the live session for a backend, opening it on demand.
    pub async fn get_or_open(&self, name: &str) -> Result<Arc<BackendSession>, RelayError> {
        // Fast path, no lock.
        if let Some(session) = self.live.get(name).map(|s| s.value().clone()) {
            self.record_use(name);
            return Ok(session);
        }

        let lock = self
            .open_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let _open_guard = lock.lock().await;

        // Re-check under the lock: another task may have just connected.
        if let Some(session) = self.live.get(name).map(|s| s.value().clone()) {
            self.record_use(name);
            return Ok(session);
        }

        let Some((_, config)) = self.pending.remove(name) else {
            return Err(RelayError::UnknownBackend(name.to_string()));
        };

        let mut restore = PendingRestore {
            pending: &self.pending,
            name,
            config: Some(config.clone()),
        };

        let _permit = self.open_semaphore.acquire().await.map_err(|_| {
            RelayError::TransportFailed {
                name: name.to_string(),
                reason: "open semaphore closed during shutdown".to_string(),
            }
        })?;

        let session = match tokio::time::timeout(
            self.open_timeout,
            self.connector.connect(name, &config),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                warn!(backend = name, error = %e, "backend open failed");
                return Err(e);
            }
            Err(_) => {
                warn!(backend = name, timeout = ?self.open_timeout, "backend open timed out");
                return Err(RelayError::OpenTimeout {
                    name: name.to_string(),
                    timeout: self.open_timeout,
                });
            }
        };

        restore.disarm();
        let session = Arc::new(session);
        self.live.insert(name.to_string(), session.clone());
        self.record_use(name);
        info!(backend = name, "backend connected");
        Ok(session)
    }

    /// Close a live backend. The live-remove and pending-reinstate pair runs
    /// under the same per-backend lock as `get_or_open`, so no concurrent
    /// open can observe the backend as neither live nor pending. The lock is
    /// released before the transport close is awaited.
    pub async fn close(&self, name: &str) -> bool {
        let lock = self
            .open_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let session = {
            let _open_guard = lock.lock().await;
            let Some((_, session)) = self.live.remove(name) else {
                return false;
            };
            if let Some(config) = self.configs.get(name).map(|c| c.value().clone()) {
                self.pending.insert(name.to_string(), config);
            }
            self.last_used.remove(name);
            session
        };

        session.close().await;
        info!(backend = name, "backend closed");
        true
    }

    /// Refresh the last-used timestamp. Last-writer-wins is harmless.
    pub fn record_use(&self, name: &str) {
        self.last_used.insert(name.to_string(), Instant::now());
    }

    pub fn mark_pinned(&self, name: &str, pinned: bool) {
        if pinned {
            self.pinned.write().insert(name.to_string());
        } else {
            self.pinned.write().remove(name);
        }
    }

    pub fn is_pinned(&self, name: &str) -> bool {
        self.pinned.read().contains(name)
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.live.contains_key(name)
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.live.contains_key(name) || self.pending.contains_key(name)
    }

    /// Names of currently connected backends, sorted.
    pub fn active_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.live.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Names of declared-but-unconnected backends, sorted.
    pub fn pending_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Snapshot of live sessions.
    pub fn live_sessions(&self) -> Vec<(String, Arc<BackendSession>)> {
        self.live
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Close every live, non-pinned backend idle beyond its timeout.
    /// Returns the names that were reaped.
    pub async fn tick_idle_reaper(&self) -> Vec<String> {
        let now = Instant::now();
        let mut reaped = Vec::new();
        let candidates: Vec<String> = self.live.iter().map(|e| e.key().clone()).collect();

        for name in candidates {
            if self.is_pinned(&name) {
                continue;
            }
            let timeout = self
                .idle_timeouts
                .get(&name)
                .map(|t| *t)
                .unwrap_or(FALLBACK_IDLE_TIMEOUT);
            let idle = self
                .last_used
                .get(&name)
                .map(|t| now.saturating_duration_since(*t))
                .unwrap_or(Duration::MAX);
            if idle > timeout {
                debug!(backend = %name, idle = ?idle, "idle reaper closing backend");
                if self.close(&name).await {
                    reaped.push(name);
                }
            }
        }
        reaped
    }

    /// Reopen pinned backends whose sessions dropped. Returns revived names.
    pub async fn revive_pinned(&self) -> Vec<String> {
        let pinned: Vec<String> = self.pinned.read().iter().cloned().collect();
        let mut revived = Vec::new();
        for name in pinned {
            if self.live.contains_key(&name) || !self.pending.contains_key(&name) {
                continue;
            }
            warn!(backend = %name, "pinned backend not connected, reviving");
            match self.get_or_open(&name).await {
                Ok(_) => revived.push(name),
                Err(e) => warn!(backend = %name, error = %e, "pinned revival failed"),
            }
        }
        revived
    }

    /// Remove a backend entirely: live session, pending config, and all
    /// registration state. Transport resources are torn down.
    pub async fn remove(&self, name: &str) -> bool {
        let was_pending = self.pending.remove(name).is_some();
        let had_config = self.configs.remove(name).is_some();
        self.idle_timeouts.remove(name);
        self.open_locks.remove(name);
        self.last_used.remove(name);
        self.pinned.write().remove(name);
        if let Some((_, session)) = self.live.remove(name) {
            session.close().await;
            return true;
        }
        was_pending || had_config
    }

    /// Close every session concurrently and clear the live map.
    pub async fn shutdown(&self) {
        let sessions: Vec<(String, Arc<BackendSession>)> = self
            .live
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        self.live.clear();
        futures::future::join_all(sessions.iter().map(|(name, session)| {
            let name = name.clone();
            let session = session.clone();
            async move {
                session.close().await;
                debug!(backend = %name, "closed at shutdown");
            }
        }))
        .await;
        info!(count = sessions.len(), "backend manager shut down");
    }
}
