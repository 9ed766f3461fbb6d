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

use anyhow::Result;
use clap::Parser;
use mcp_relay::{config::RelaySettings, run_relay};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Downstream transport: stdio or http (overrides settings file)
    #[arg(long, env = "MCP_RELAY_TRANSPORT")]
    transport: Option<String>,

    /// HTTP listen host (overrides settings file)
    #[arg(long, env = "MCP_RELAY_HOST")]
    host: Option<String>,

    /// HTTP listen port (overrides settings file)
    #[arg(long, env = "MCP_RELAY_PORT")]
    port: Option<u16>,

    /// Bearer token guarding the HTTP surface
    #[arg(long, env = "MCP_RELAY_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Control document path (overrides settings file)
    #[arg(long, env = "MCP_RELAY_DOCUMENT")]
    document: Option<PathBuf>,

    /// JSON client config imported on first run
    #[arg(long)]
    import: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = RelaySettings::load(args.config)?;

    // CLI overrides
    if let Some(transport) = args.transport {
        settings.server.transport = transport
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
    }
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(api_key) = args.api_key {
        settings.auth.api_key = Some(api_key);
    }
    if let Some(document) = args.document {
        settings.document.path = Some(document);
    }
    if let Some(import) = args.import {
        settings.document.import = Some(import);
    }

    run_relay(settings).await
}
