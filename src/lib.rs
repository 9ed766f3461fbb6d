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

pub mod api;
pub mod audit;
pub mod config;
pub mod discovery;
pub mod document;
pub mod error;
pub mod manager;
pub mod mcp;
pub mod merge;
pub mod proxy;
pub mod retrieval;
pub mod sources;

use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::AdminState;
use audit::TracingAudit;
use config::{RelaySettings, TransportMode};
use document::DocumentStore;
use manager::{BackendManager, ManagerConfig, TransportConnector};
use proxy::RelayProxy;

/// Run the relay until the downstream session ends or a signal arrives.
///
/// Exit is nonzero on a corrupt control document or a bind failure; both
/// propagate as errors from here.
pub async fn run_relay(settings: RelaySettings) -> Result<()> {
    init_tracing(settings.server.transport);

    tracing::info!(transport = ?settings.server.transport, "starting mcp-relay");
    settings.validate()?;

    let document_path = settings
        .document
        .path
        .clone()
        .or_else(DocumentStore::default_path)
        .context("could not determine control document path")?;
    let store = DocumentStore::new(&document_path);

    // A corrupt document is fatal at boot.
    let mut document = store.load()?;
    let first_run = document.servers.is_empty();

    // First-run bootstrap: seed the document from a client config file.
    if first_run {
        if let Some(import_path) = &settings.document.import {
            let raw = std::fs::read_to_string(import_path)
                .with_context(|| format!("reading import file {:?}", import_path))?;
            let data: serde_json::Value =
                serde_json::from_str(&raw).context("import file is not valid JSON")?;
            let imported = sources::extract_backends(&data);
            tracing::info!(count = imported.len(), "imported backends from client config");
            for (name, config) in imported {
                document.servers.insert(name, config);
            }
        }
    }

    let manager = Arc::new(BackendManager::new(
        Arc::new(TransportConnector),
        ManagerConfig {
            open_timeout: settings.backends.open_timeout(),
            max_concurrent_opens: settings.backends.max_concurrent_opens,
        },
    ));

    // First run: sweep every declared backend, persist the inventory.
    // Later runs: register everything as pending and start instantly from
    // the document cache.
    let sweep_outcome = if first_run && !document.servers.is_empty() {
        tracing::info!("first run, sweeping declared backends");
        let outcome = discovery::run_sweep(&manager, &mut document).await;
        if let Err(e) = store.save(&document) {
            tracing::warn!(error = %e, "could not persist discovery results");
        }
        Some(outcome)
    } else {
        for (name, config) in document.servers.iter() {
            if let Err(e) = manager.register(name, config.clone()) {
                tracing::warn!(backend = %name, error = %e, "skipping invalid backend");
            }
        }
        None
    };

    let proxy = Arc::new(RelayProxy::new(
        manager.clone(),
        store,
        document,
        Arc::new(TracingAudit),
    ));
    if let Some(outcome) = sweep_outcome {
        proxy.absorb_sweep(outcome);
    }

    // Connect pinned backends in the background; startup never blocks on them.
    let boot_proxy = proxy.clone();
    tokio::spawn(async move {
        let revived = boot_proxy.manager().revive_pinned().await;
        if !revived.is_empty() {
            boot_proxy.on_backends_revived(&revived).await;
        }
    });

    // Idle reaper.
    let reaper_proxy = proxy.clone();
    let reap_interval = settings.backends.reap_interval();
    let reaper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reap_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let reaped = reaper_proxy.manager().tick_idle_reaper().await;
            if !reaped.is_empty() {
                reaper_proxy.on_backends_reaped(&reaped);
            }
        }
    });

    // Pinned-backend watchdog.
    let watchdog_proxy = proxy.clone();
    let watchdog_interval = settings.backends.watchdog_interval();
    let watchdog = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(watchdog_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let revived = watchdog_proxy.manager().revive_pinned().await;
            if !revived.is_empty() {
                watchdog_proxy.on_backends_revived(&revived).await;
            }
        }
    });

    let result = match settings.server.transport {
        TransportMode::Stdio => serve_stdio_until_signal(proxy.clone()).await,
        TransportMode::Http => serve_http(proxy.clone(), &settings).await,
    };

    reaper.abort();
    watchdog.abort();
    proxy.clear_downstream();
    manager.shutdown().await;
    tracing::info!("graceful shutdown complete");
    result
}

async fn serve_stdio_until_signal(proxy: Arc<RelayProxy>) -> Result<()> {
    tokio::select! {
        result = mcp::serve_stdio(proxy) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("signal received, shutting down");
            Ok(())
        }
    }
}

async fn serve_http(proxy: Arc<RelayProxy>, settings: &RelaySettings) -> Result<()> {
    let admin_state = AdminState {
        proxy: proxy.clone(),
        api_key: settings.auth.api_key.clone().map(Arc::new),
    };

    let app = Router::new()
        .merge(mcp::mcp_router(proxy))
        .merge(api::admin_router(admin_state.clone()))
        .layer(axum::middleware::from_fn_with_state(
            admin_state,
            api::require_bearer,
        ))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = settings.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("listening on http://{}", addr);

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("http server error")
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("signal received, shutting down");
            Ok(())
        }
    }
}

fn init_tracing(transport: TransportMode) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mcp_relay=info,tower_http=info".into());

    // On stdio, stdout belongs to the protocol; logs go to stderr.
    match transport {
        TransportMode::Stdio => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
        TransportMode::Http => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}
